//! Deterministic identities for quote observations.
//!
//! A key hashes the length-prefixed identity attributes of a record, so it
//! depends only on their values and never on which payload shape produced
//! the record.

use std::fmt;

use blake3::Hasher;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::models::QuoteRecord;

const KEY_DOMAIN: &[u8] = b"option-chain-quote/v1";

/// Which attribute stood in for the contract's expiry when the key was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyBasis {
    Expiry,
    Identifier,
    /// `{symbol, type, strike, observedAt}` only. Two expiries quoted at the
    /// same strike and instant collide on this basis.
    Fallback,
}

impl KeyBasis {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyBasis::Expiry => "expiry",
            KeyBasis::Identifier => "identifier",
            KeyBasis::Fallback => "fallback",
        }
    }

    fn tag(self) -> u8 {
        match self {
            KeyBasis::Expiry => 1,
            KeyBasis::Identifier => 2,
            KeyBasis::Fallback => 3,
        }
    }
}

/// Hex-encoded blake3 digest identifying one observation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct KeyBuilder {
    hasher: Hasher,
}

impl KeyBuilder {
    fn new(basis: KeyBasis) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(&(KEY_DOMAIN.len() as u32).to_le_bytes());
        hasher.update(KEY_DOMAIN);
        hasher.update(&[basis.tag()]);
        Self { hasher }
    }

    fn write_str(&mut self, value: &str) -> &mut Self {
        self.hasher.update(&(value.len() as u32).to_le_bytes());
        self.hasher.update(value.as_bytes());
        self
    }

    fn write_i64(&mut self, value: i64) -> &mut Self {
        self.hasher.update(&value.to_le_bytes());
        self
    }

    fn finish(&self) -> DedupKey {
        DedupKey(self.hasher.finalize().to_hex().to_string())
    }
}

/// Strike in hundredths, so `25000`, `25000.0` and `"25,000.00"` agree.
fn strike_ticks(strike: f64) -> i64 {
    (strike * 100.0).round() as i64
}

const IDENTIFIER_DATE_FORMATS: [(&str, usize); 2] = [("%d-%m-%Y", 10), ("%d-%b-%Y", 11)];

/// Expiry embedded in a provider identifier such as
/// `OPTIDXNIFTY30-01-2025CE25000.00`.
pub fn expiry_from_identifier(identifier: &str) -> Option<NaiveDate> {
    (0..identifier.len()).find_map(|start| {
        IDENTIFIER_DATE_FORMATS.iter().find_map(|(fmt, width)| {
            let end = start + width;
            if end > identifier.len()
                || !identifier.is_char_boundary(start)
                || !identifier.is_char_boundary(end)
            {
                return None;
            }
            NaiveDate::parse_from_str(&identifier[start..end], fmt).ok()
        })
    })
}

/// Builds the dedup key for `record` and reports the basis used.
///
/// The contract's expiry comes from the record, or else from the date the
/// provider identifier carries, so a leg keyed by identifier in one payload
/// shape and by expiry in the other still maps to one key. Only an
/// identifier without a readable date is hashed as-is; with neither the
/// fallback basis applies.
///
/// # Returns
/// The key and the [`KeyBasis`] it was built on.
pub fn dedup_key(record: &QuoteRecord) -> (DedupKey, KeyBasis) {
    let symbol = record.symbol.trim().to_ascii_uppercase();
    let identifier = record
        .identifier
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());
    let expiry = record
        .expiry_date
        .or_else(|| identifier.and_then(expiry_from_identifier));

    let basis = match (expiry, identifier) {
        (Some(_), _) => KeyBasis::Expiry,
        (None, Some(_)) => KeyBasis::Identifier,
        (None, None) => KeyBasis::Fallback,
    };

    let mut builder = KeyBuilder::new(basis);
    builder
        .write_str(&symbol)
        .write_str(record.option_type.as_str())
        .write_i64(strike_ticks(record.strike_price));
    match (expiry, identifier) {
        (Some(expiry), _) => {
            builder.write_str(&expiry.format("%Y-%m-%d").to_string());
        }
        (None, Some(id)) => {
            builder.write_str(&id.to_ascii_uppercase());
        }
        (None, None) => {}
    }
    builder.write_i64(record.observed_at.timestamp());

    (builder.finish(), basis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::models::OptionType;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn record() -> QuoteRecord {
        let at = Utc.with_ymd_and_hms(2025, 7, 17, 9, 15, 30).unwrap();
        QuoteRecord::new("NIFTY", OptionType::Call, 25000.0, at)
    }

    #[test]
    fn test_key_ignores_market_fields() {
        let a = record();
        let mut b = record();
        b.last_price = Some(123.45);
        b.open_interest = Some(1.0);
        assert_eq!(dedup_key(&a), dedup_key(&b));
    }

    #[test]
    fn test_key_distinguishes_identity_attributes() {
        let base = dedup_key(&record()).0;

        let mut put = record();
        put.option_type = OptionType::Put;
        let mut strike = record();
        strike.strike_price = 25050.0;
        let mut later = record();
        later.observed_at = later.observed_at + chrono::Duration::seconds(1);
        let mut symbol = record();
        symbol.symbol = "BANKNIFTY".into();

        for other in [put, strike, later, symbol] {
            assert_ne!(dedup_key(&other).0, base);
        }
    }

    #[test]
    fn test_basis_follows_precedence() {
        let mut r = record();
        assert_eq!(dedup_key(&r).1, KeyBasis::Fallback);

        r.identifier = Some("NIFTY-WEEKLY-CE-25000".into());
        assert_eq!(dedup_key(&r).1, KeyBasis::Identifier);

        r.identifier = Some("OPTIDXNIFTY30-01-2025CE25000.00".into());
        let (from_identifier, basis) = dedup_key(&r);
        assert_eq!(basis, KeyBasis::Expiry);

        r.expiry_date = NaiveDate::from_ymd_opt(2025, 1, 30);
        assert_eq!(dedup_key(&r), (from_identifier.clone(), KeyBasis::Expiry));

        r.identifier = None;
        assert_eq!(dedup_key(&r).0, from_identifier);
    }

    #[test]
    fn test_identifier_only_leg_matches_leg_with_expiry() {
        let mut structured = record();
        structured.expiry_date = NaiveDate::from_ymd_opt(2025, 1, 30);
        structured.identifier = Some("OPTIDXNIFTY30-01-2025CE25000.00".into());

        let mut tabular = record();
        tabular.identifier = Some("OPTIDXNIFTY30-01-2025CE25000.00".into());

        assert_eq!(dedup_key(&structured), dedup_key(&tabular));
    }

    #[test]
    fn test_identifier_dates_are_extracted() {
        assert_eq!(
            expiry_from_identifier("OPTSTKRELIANCE27-Feb-2025PE1300.00"),
            NaiveDate::from_ymd_opt(2025, 2, 27)
        );
        assert_eq!(expiry_from_identifier("NIFTY25000CE"), None);
    }

    #[test]
    fn test_expiries_do_not_collide_when_present() {
        let mut near = record();
        near.expiry_date = NaiveDate::from_ymd_opt(2025, 1, 30);
        let mut far = record();
        far.expiry_date = NaiveDate::from_ymd_opt(2025, 2, 27);
        assert_ne!(dedup_key(&near).0, dedup_key(&far).0);
    }

    #[test]
    fn test_symbol_case_and_strike_precision_are_canonical() {
        let mut a = record();
        a.symbol = " nifty ".into();
        a.strike_price = 25000.001;
        assert_eq!(dedup_key(&a).0, dedup_key(&record()).0);
        assert_eq!(dedup_key(&a).0.as_str().len(), 64);
    }
}
