use chrono::{DateTime, NaiveDate, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::models::{MarketField, OptionType, QuoteRecord, RawPayload};
use crate::error::ParseError;

/// Result of normalizing one provider payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub records: Vec<QuoteRecord>,
    /// Rows (tabular lines or structured strike entries) dropped because a
    /// field could not be coerced.
    pub dropped_rows: usize,
    /// Legs dropped because they carried neither an expiry nor an identifier
    /// while unkeyed records are rejected.
    pub unkeyed_dropped: usize,
}

impl NormalizedBatch {
    pub fn count(&self, option_type: OptionType) -> usize {
        self.records
            .iter()
            .filter(|r| r.option_type == option_type)
            .count()
    }
}

/// Converts raw option-chain payloads into [`QuoteRecord`]s.
///
/// Two payload shapes are understood:
/// * delimited tabular output, with columns matched by header name
/// * nested JSON, one object per strike with `CE`/`PE` sub-objects
///
/// Both produce the same record shape. Malformed rows are dropped and
/// counted; only a payload with no recognisable structure is an error.
///
/// # Key Features
/// * Header-name column mapping, tolerant of reordering and preamble lines
/// * Placeholder values (`-`, blank) become `None`, never zero
/// * Thousands separators are stripped before numeric conversion
/// * Running dropped-row counter across payloads
pub struct RecordNormalizer {
    reject_unkeyed: bool,
    dropped_rows: u64,
}

impl RecordNormalizer {
    /// Creates a normalizer.
    ///
    /// # Arguments
    /// * `reject_unkeyed`: drop legs that have neither an expiry date nor a
    ///   provider identifier instead of keying them on the fallback basis
    pub fn new(reject_unkeyed: bool) -> Self {
        Self {
            reject_unkeyed,
            dropped_rows: 0,
        }
    }

    /// Total rows dropped since this normalizer was created.
    pub fn dropped_rows(&self) -> u64 {
        self.dropped_rows
    }

    /// Normalizes one payload for `symbol`.
    ///
    /// Every record carries the same `observed_at` (truncated to seconds).
    ///
    /// # Errors
    /// Returns [`ParseError`] if the payload is empty, is not data (an html
    /// page), or lacks the structure of either known shape.
    pub fn normalize(
        &mut self,
        symbol: &str,
        payload: &RawPayload,
        observed_at: DateTime<Utc>,
    ) -> Result<NormalizedBatch, ParseError> {
        let body = payload.body.trim();
        if body.is_empty() {
            return Err(ParseError::Empty);
        }
        if payload.looks_like_html() {
            return Err(ParseError::UnexpectedContent {
                content_type: payload.content_type.clone(),
            });
        }

        let mut batch = if is_structured(payload) {
            normalize_structured(symbol, body, observed_at)?
        } else {
            normalize_tabular(symbol, body, observed_at)?
        };

        if self.reject_unkeyed {
            let before = batch.records.len();
            batch
                .records
                .retain(|r| r.expiry_date.is_some() || r.identifier.is_some());
            batch.unkeyed_dropped = before - batch.records.len();
        }

        self.dropped_rows += batch.dropped_rows as u64;
        if batch.dropped_rows > 0 {
            warn!(
                symbol,
                dropped = batch.dropped_rows,
                total_dropped = self.dropped_rows,
                "dropped malformed rows"
            );
        }
        debug!(
            symbol,
            calls = batch.count(OptionType::Call),
            puts = batch.count(OptionType::Put),
            "normalized payload"
        );
        Ok(batch)
    }
}

fn is_structured(payload: &RawPayload) -> bool {
    let json_type = payload
        .content_type
        .as_deref()
        .map(|ct| ct.to_ascii_lowercase().contains("json"))
        .unwrap_or(false);
    let body = payload.body.trim_start();
    json_type || body.starts_with('{') || body.starts_with('[')
}

#[derive(Debug)]
struct CoerceError(String);

fn is_placeholder(value: &str) -> bool {
    matches!(value, "" | "-" | "--")
        || value.eq_ignore_ascii_case("na")
        || value.eq_ignore_ascii_case("n/a")
}

fn coerce_text(raw: &str) -> Result<Option<f64>, CoerceError> {
    let cleaned = raw.trim().trim_matches('"').trim();
    if is_placeholder(cleaned) {
        return Ok(None);
    }
    let digits: String = cleaned.chars().filter(|c| *c != ',').collect();
    match digits.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Some(value)),
        _ => Err(CoerceError(format!("not a number: {raw:?}"))),
    }
}

fn coerce_json(value: Option<&Value>) -> Result<Option<f64>, CoerceError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| CoerceError(format!("number out of range: {n}"))),
        Some(Value::String(s)) => coerce_text(s),
        Some(other) => Err(CoerceError(format!("not a number: {other}"))),
    }
}

const EXPIRY_FORMATS: [&str; 4] = ["%d-%b-%Y", "%Y-%m-%d", "%d-%m-%Y", "%d %b %Y"];

fn parse_expiry(raw: &str) -> Result<Option<NaiveDate>, CoerceError> {
    let cleaned = raw.trim().trim_matches('"').trim();
    if is_placeholder(cleaned) {
        return Ok(None);
    }
    EXPIRY_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cleaned, fmt).ok())
        .map(Some)
        .ok_or_else(|| CoerceError(format!("unrecognised expiry date: {raw:?}")))
}

fn non_blank(raw: &str) -> Option<String> {
    let cleaned = raw.trim().trim_matches('"').trim();
    (!is_placeholder(cleaned)).then(|| cleaned.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegColumn {
    Market(MarketField),
    Identifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderKind {
    Strike,
    Expiry,
    Underlying,
    Leg(LegColumn),
}

fn header_kind(name: &str) -> Option<HeaderKind> {
    let normalized = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let kind = match normalized.to_ascii_uppercase().as_str() {
        "STRIKE" | "STRIKE PRICE" => HeaderKind::Strike,
        "EXPIRY" | "EXPIRY DATE" => HeaderKind::Expiry,
        "UNDERLYING" | "UNDERLYING VALUE" => HeaderKind::Underlying,
        "IDENTIFIER" => HeaderKind::Leg(LegColumn::Identifier),
        "OI" | "OPEN INTEREST" => HeaderKind::Leg(LegColumn::Market(MarketField::OpenInterest)),
        "CHNG IN OI" | "CHANGE IN OI" => {
            HeaderKind::Leg(LegColumn::Market(MarketField::ChangeInOpenInterest))
        }
        "%CHNG IN OI" | "% CHNG IN OI" => {
            HeaderKind::Leg(LegColumn::Market(MarketField::PercentChangeInOpenInterest))
        }
        "VOLUME" => HeaderKind::Leg(LegColumn::Market(MarketField::Volume)),
        "IV" => HeaderKind::Leg(LegColumn::Market(MarketField::ImpliedVolatility)),
        "LTP" => HeaderKind::Leg(LegColumn::Market(MarketField::LastPrice)),
        "CHNG" | "NET CHNG" => HeaderKind::Leg(LegColumn::Market(MarketField::Change)),
        "%CHNG" | "% CHNG" => HeaderKind::Leg(LegColumn::Market(MarketField::PercentChange)),
        "BID QTY" => HeaderKind::Leg(LegColumn::Market(MarketField::BidQty)),
        "BID" | "BID PRICE" => HeaderKind::Leg(LegColumn::Market(MarketField::BidPrice)),
        "ASK" | "ASK PRICE" => HeaderKind::Leg(LegColumn::Market(MarketField::AskPrice)),
        "ASK QTY" => HeaderKind::Leg(LegColumn::Market(MarketField::AskQty)),
        _ => return None,
    };
    Some(kind)
}

/// Column positions resolved from a header row.
#[derive(Debug, Default)]
struct TabularLayout {
    strike: usize,
    expiry: Option<usize>,
    underlying: Option<usize>,
    legs: Vec<(usize, OptionType, LegColumn)>,
}

impl TabularLayout {
    /// Builds the layout from a header row. The first occurrence of a leg
    /// column belongs to the CALL side, the second (or a `.1` suffix) to PUT.
    fn from_header(header: &StringRecord) -> Option<Self> {
        let mut strike = None;
        let mut layout = TabularLayout::default();
        let mut seen: Vec<LegColumn> = Vec::new();

        for (idx, raw) in header.iter().enumerate() {
            let (name, forced_put) = match raw.trim().strip_suffix(".1") {
                Some(stripped) => (stripped, true),
                None => (raw.trim(), false),
            };
            match header_kind(name) {
                Some(HeaderKind::Strike) => {
                    strike.get_or_insert(idx);
                }
                Some(HeaderKind::Expiry) => {
                    layout.expiry.get_or_insert(idx);
                }
                Some(HeaderKind::Underlying) => {
                    layout.underlying.get_or_insert(idx);
                }
                Some(HeaderKind::Leg(column)) => {
                    let leg = if forced_put || seen.contains(&column) {
                        OptionType::Put
                    } else {
                        seen.push(column);
                        OptionType::Call
                    };
                    let taken = layout.legs.iter().any(|(_, t, c)| *t == leg && *c == column);
                    if !taken {
                        layout.legs.push((idx, leg, column));
                    }
                }
                None => {}
            }
        }

        layout.strike = strike?;
        Some(layout)
    }

    fn build_row(
        &self,
        symbol: &str,
        row: &StringRecord,
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<QuoteRecord>, CoerceError> {
        let cell = |idx: usize| row.get(idx).unwrap_or("");

        let strike = coerce_text(cell(self.strike))?
            .ok_or_else(|| CoerceError("missing strike".to_string()))?;
        let expiry = match self.expiry {
            Some(idx) => parse_expiry(cell(idx))?,
            None => None,
        };
        let underlying = match self.underlying {
            Some(idx) => coerce_text(cell(idx))?,
            None => None,
        };

        let mut legs = OptionType::ALL.map(|leg| {
            let mut record = QuoteRecord::new(symbol, leg, strike, observed_at);
            record.expiry_date = expiry;
            record
        });

        for &(idx, leg, column) in &self.legs {
            let record = &mut legs[leg_index(leg)];
            match column {
                LegColumn::Market(field) => *record.market_field_mut(field) = coerce_text(cell(idx))?,
                LegColumn::Identifier => record.identifier = non_blank(cell(idx)),
            }
        }

        Ok(legs
            .into_iter()
            .filter(QuoteRecord::has_market_data)
            .map(|mut record| {
                record.underlying_value = underlying;
                record
            })
            .collect())
    }
}

fn leg_index(leg: OptionType) -> usize {
    match leg {
        OptionType::Call => 0,
        OptionType::Put => 1,
    }
}

fn normalize_tabular(
    symbol: &str,
    body: &str,
    observed_at: DateTime<Utc>,
) -> Result<NormalizedBatch, ParseError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(body.as_bytes());

    let mut layout: Option<TabularLayout> = None;
    let mut batch = NormalizedBatch::default();

    for row in reader.records() {
        let row = match row {
            Ok(row) => row,
            Err(err) if layout.is_some() => {
                debug!(symbol, "unreadable row: {}", err);
                batch.dropped_rows += 1;
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        if row.iter().all(|f| f.trim().is_empty()) {
            continue;
        }

        if layout.is_none() {
            // preamble lines such as "CALLS,,PUTS" precede the header
            layout = TabularLayout::from_header(&row);
            continue;
        }
        let Some(active) = layout.as_ref() else {
            continue;
        };

        match active.build_row(symbol, &row, observed_at) {
            Ok(records) => batch.records.extend(records),
            Err(CoerceError(reason)) => {
                debug!(symbol, line = ?row.position().map(|p| p.line()), "dropping row: {}", reason);
                batch.dropped_rows += 1;
            }
        }
    }

    if layout.is_none() {
        return Err(ParseError::MissingStructure(
            "no header row with a STRIKE column".to_string(),
        ));
    }
    Ok(batch)
}

const STRUCTURED_FIELDS: [(&str, MarketField); 13] = [
    ("openInterest", MarketField::OpenInterest),
    ("changeinOpenInterest", MarketField::ChangeInOpenInterest),
    ("pchangeinOpenInterest", MarketField::PercentChangeInOpenInterest),
    ("totalTradedVolume", MarketField::Volume),
    ("impliedVolatility", MarketField::ImpliedVolatility),
    ("lastPrice", MarketField::LastPrice),
    ("change", MarketField::Change),
    ("pChange", MarketField::PercentChange),
    ("bidQty", MarketField::BidQty),
    ("bidprice", MarketField::BidPrice),
    ("askPrice", MarketField::AskPrice),
    ("askQty", MarketField::AskQty),
    ("underlyingValue", MarketField::UnderlyingValue),
];

fn expiry_field(obj: &Map<String, Value>) -> Result<Option<NaiveDate>, CoerceError> {
    match obj.get("expiryDate") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => parse_expiry(s),
        Some(other) => Err(CoerceError(format!("unrecognised expiry date: {other}"))),
    }
}

fn build_entry(
    symbol: &str,
    entry: &Value,
    fallback_underlying: Option<f64>,
    observed_at: DateTime<Utc>,
) -> Result<Vec<QuoteRecord>, CoerceError> {
    let obj = entry
        .as_object()
        .ok_or_else(|| CoerceError("entry is not an object".to_string()))?;
    let strike = coerce_json(obj.get("strikePrice"))?
        .ok_or_else(|| CoerceError("missing strikePrice".to_string()))?;
    let entry_expiry = expiry_field(obj)?;

    let mut records = Vec::with_capacity(2);
    for (code, sub) in obj {
        let Some(leg) = OptionType::from_provider_code(code) else {
            continue;
        };
        let sub = match sub {
            Value::Null => continue,
            Value::Object(sub) => sub,
            _ => return Err(CoerceError(format!("{code} is not an object"))),
        };

        let mut record = QuoteRecord::new(symbol, leg, strike, observed_at);
        for (key, field) in STRUCTURED_FIELDS {
            *record.market_field_mut(field) = coerce_json(sub.get(key))?;
        }
        record.expiry_date = match entry_expiry {
            Some(date) => Some(date),
            None => expiry_field(sub)?,
        };
        record.identifier = sub
            .get("identifier")
            .and_then(Value::as_str)
            .and_then(non_blank);
        if record.underlying_value.is_none() {
            record.underlying_value = fallback_underlying;
        }
        records.push(record);
    }
    Ok(records)
}

fn normalize_structured(
    symbol: &str,
    body: &str,
    observed_at: DateTime<Utc>,
) -> Result<NormalizedBatch, ParseError> {
    let root: Value = serde_json::from_str(body)?;
    let records = root
        .get("records")
        .ok_or_else(|| ParseError::MissingStructure("records".to_string()))?;
    let data = records
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| ParseError::MissingStructure("records.data".to_string()))?;
    let underlying = coerce_json(records.get("underlyingValue")).unwrap_or(None);

    let mut batch = NormalizedBatch::default();
    for (idx, entry) in data.iter().enumerate() {
        match build_entry(symbol, entry, underlying, observed_at) {
            Ok(legs) => batch.records.extend(legs),
            Err(CoerceError(reason)) => {
                debug!(symbol, entry = idx, "dropping entry: {}", reason);
                batch.dropped_rows += 1;
            }
        }
    }
    Ok(batch)
}
