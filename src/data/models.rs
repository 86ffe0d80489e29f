use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Side of an option contract at a given strike.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub const ALL: [OptionType; 2] = [OptionType::Call, OptionType::Put];

    pub fn as_str(&self) -> &'static str {
        match self {
            OptionType::Call => "CALL",
            OptionType::Put => "PUT",
        }
    }

    /// Maps the provider's contract codes (`CE`/`PE`) onto a leg.
    pub fn from_provider_code(code: &str) -> Option<Self> {
        match code.trim().to_ascii_uppercase().as_str() {
            "CE" | "CALL" | "CALLS" => Some(OptionType::Call),
            "PE" | "PUT" | "PUTS" => Some(OptionType::Put),
            _ => None,
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of one provider response, as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPayload {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl RawPayload {
    pub fn new(status: u16, content_type: Option<String>, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type,
            body: body.into(),
        }
    }

    pub fn looks_like_html(&self) -> bool {
        let html_type = self
            .content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("text/html"))
            .unwrap_or(false);
        html_type || self.body.trim_start().starts_with('<')
    }
}

/// One option leg at one observation instant.
///
/// Market fields stay `None` whenever the provider omitted them or sent a
/// placeholder; nothing is ever inferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRecord {
    pub symbol: String,
    pub option_type: OptionType,
    pub strike_price: f64,
    pub expiry_date: Option<NaiveDate>,
    /// Provider-issued contract identifier, when one was sent.
    pub identifier: Option<String>,
    pub observed_at: DateTime<Utc>,

    pub open_interest: Option<f64>,
    pub change_in_open_interest: Option<f64>,
    pub percent_change_in_open_interest: Option<f64>,
    pub volume: Option<f64>,
    pub implied_volatility: Option<f64>,
    pub last_price: Option<f64>,
    pub change: Option<f64>,
    pub percent_change: Option<f64>,
    pub bid_qty: Option<f64>,
    pub bid_price: Option<f64>,
    pub ask_price: Option<f64>,
    pub ask_qty: Option<f64>,
    pub underlying_value: Option<f64>,
}

impl QuoteRecord {
    /// Creates a leg with every market field unset. `observed_at` is
    /// truncated to whole seconds.
    pub fn new(
        symbol: &str,
        option_type: OptionType,
        strike_price: f64,
        observed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            option_type,
            strike_price,
            expiry_date: None,
            identifier: None,
            observed_at: observed_at.trunc_subsecs(0),
            open_interest: None,
            change_in_open_interest: None,
            percent_change_in_open_interest: None,
            volume: None,
            implied_volatility: None,
            last_price: None,
            change: None,
            percent_change: None,
            bid_qty: None,
            bid_price: None,
            ask_price: None,
            ask_qty: None,
            underlying_value: None,
        }
    }

    pub fn has_market_data(&self) -> bool {
        [
            self.open_interest,
            self.change_in_open_interest,
            self.percent_change_in_open_interest,
            self.volume,
            self.implied_volatility,
            self.last_price,
            self.change,
            self.percent_change,
            self.bid_qty,
            self.bid_price,
            self.ask_price,
            self.ask_qty,
        ]
        .iter()
        .any(Option::is_some)
    }

    pub fn market_field_mut(&mut self, field: MarketField) -> &mut Option<f64> {
        match field {
            MarketField::OpenInterest => &mut self.open_interest,
            MarketField::ChangeInOpenInterest => &mut self.change_in_open_interest,
            MarketField::PercentChangeInOpenInterest => &mut self.percent_change_in_open_interest,
            MarketField::Volume => &mut self.volume,
            MarketField::ImpliedVolatility => &mut self.implied_volatility,
            MarketField::LastPrice => &mut self.last_price,
            MarketField::Change => &mut self.change,
            MarketField::PercentChange => &mut self.percent_change,
            MarketField::BidQty => &mut self.bid_qty,
            MarketField::BidPrice => &mut self.bid_price,
            MarketField::AskPrice => &mut self.ask_price,
            MarketField::AskQty => &mut self.ask_qty,
            MarketField::UnderlyingValue => &mut self.underlying_value,
        }
    }
}

/// Numeric market attributes shared by both payload shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarketField {
    OpenInterest,
    ChangeInOpenInterest,
    PercentChangeInOpenInterest,
    Volume,
    ImpliedVolatility,
    LastPrice,
    Change,
    PercentChange,
    BidQty,
    BidPrice,
    AskPrice,
    AskQty,
    UnderlyingValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_observed_at_is_truncated_to_seconds() {
        let at = Utc.timestamp_opt(1_700_000_000, 987_000_000).unwrap();
        let record = QuoteRecord::new("NIFTY", OptionType::Call, 25000.0, at);
        assert_eq!(record.observed_at, Utc.timestamp_opt(1_700_000_000, 0).unwrap());
    }

    #[test]
    fn test_underlying_alone_is_not_market_data() {
        let mut record = QuoteRecord::new("NIFTY", OptionType::Put, 25000.0, Utc::now());
        record.underlying_value = Some(25075.5);
        assert!(!record.has_market_data());
        *record.market_field_mut(MarketField::LastPrice) = Some(1.0);
        assert!(record.has_market_data());
    }

    #[test]
    fn test_provider_codes_map_to_legs() {
        assert_eq!(OptionType::from_provider_code("CE"), Some(OptionType::Call));
        assert_eq!(OptionType::from_provider_code(" pe "), Some(OptionType::Put));
        assert_eq!(OptionType::from_provider_code("FUT"), None);
    }

    #[test]
    fn test_html_bodies_are_detected() {
        let page = RawPayload::new(200, None, "  <!DOCTYPE html><html></html>");
        assert!(page.looks_like_html());
        let json = RawPayload::new(200, Some("application/json".into()), "{}");
        assert!(!json.looks_like_html());
    }
}
