use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::data::ingestion::DEFAULT_REQUEST_TIMEOUT;
use crate::data::{OptionType, RetryPolicy};

/// Where and how the provider is contacted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    pub chain_path: String,
    /// Ask the provider for the delimited export instead of JSON.
    pub prefer_csv: bool,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.nseindia.com".to_string(),
            chain_path: "/api/option-chain-indices".to_string(),
            prefer_csv: false,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreTarget {
    Sqlite(PathBuf),
    Memory,
}

impl FromStr for StoreTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s == "memory://" {
            return Ok(StoreTarget::Memory);
        }
        match s.strip_prefix("sqlite://") {
            Some(path) if !path.is_empty() => Ok(StoreTarget::Sqlite(PathBuf::from(path))),
            _ => bail!("unsupported store url {s:?} (expected sqlite://<path> or memory://)"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub target: StoreTarget,
    /// `{symbol}` and `{leg}` are substituted per collection.
    pub collection_template: String,
}

impl StoreConfig {
    /// Collection holding one symbol's legs of one type, e.g.
    /// `nifty_call_option_chain`.
    pub fn collection_for(&self, symbol: &str, leg: OptionType) -> String {
        self.collection_template
            .replace("{symbol}", symbol)
            .replace("{leg}", leg.as_str())
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            target: StoreTarget::Sqlite(PathBuf::from("option_chain.db")),
            collection_template: "{symbol}_{leg}_option_chain".to_string(),
        }
    }
}

/// Cycle cadence and failure handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub fetch_interval: Duration,
    /// Interval used once a symbol is degraded; never shorter than
    /// `fetch_interval`.
    pub degraded_interval: Duration,
    /// Consecutive failures after which a symbol is degraded.
    pub failure_threshold: u32,
    /// Bound on a cycle's store write. Fetches are bounded by the retry
    /// policy and the request timeout instead.
    pub cycle_timeout: Duration,
    /// Log a summary every N cycles per symbol (0 disables).
    pub summary_every: u64,
    /// Cycle reports retained per symbol for status queries.
    pub recent_cycles: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            fetch_interval: Duration::from_secs(5),
            degraded_interval: Duration::from_secs(30),
            failure_threshold: 5,
            cycle_timeout: Duration::from_secs(60),
            summary_every: 10,
            recent_cycles: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub provider: ProviderConfig,
    pub retry: RetryPolicy,
    pub store: StoreConfig,
    pub schedule: ScheduleConfig,
    pub logging: LoggingConfig,
    /// Drop legs with neither an expiry date nor a provider identifier.
    pub reject_unkeyed: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            symbols: vec!["NIFTY".to_string()],
            provider: ProviderConfig::default(),
            retry: RetryPolicy::default(),
            store: StoreConfig::default(),
            schedule: ScheduleConfig::default(),
            logging: LoggingConfig::default(),
            reject_unkeyed: false,
        }
    }
}

impl PipelineConfig {
    /// Reads the configuration from the process environment (after `.env`
    /// has been loaded by the caller).
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. Unset keys
    /// keep their defaults; set but invalid keys are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let parsed = |key: &str| -> Result<Option<u64>> {
            get(key)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .with_context(|| format!("{key} must be a non-negative integer, got {v:?}"))
                })
                .transpose()
        };
        let flag = |key: &str| -> Result<Option<bool>> {
            get(key)
                .map(|v| match v.trim().to_ascii_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => Ok(true),
                    "0" | "false" | "no" | "off" => Ok(false),
                    _ => bail!("{key} must be a boolean, got {v:?}"),
                })
                .transpose()
        };

        let mut config = PipelineConfig::default();

        if let Some(symbols) = get("OCI_SYMBOLS") {
            config.symbols = symbols
                .split(',')
                .map(|s| s.trim().to_ascii_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if config.symbols.is_empty() {
            bail!("OCI_SYMBOLS must name at least one symbol");
        }
        let mut unique = config.symbols.clone();
        unique.sort();
        unique.dedup();
        if unique.len() != config.symbols.len() {
            bail!("OCI_SYMBOLS contains duplicates: {:?}", config.symbols);
        }

        let schedule = &mut config.schedule;
        if let Some(secs) = parsed("OCI_FETCH_INTERVAL_SECS")? {
            schedule.fetch_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = parsed("OCI_DEGRADED_INTERVAL_SECS")? {
            schedule.degraded_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parsed("OCI_FAILURE_THRESHOLD")? {
            schedule.failure_threshold = u32::try_from(n.max(1)).unwrap_or(u32::MAX);
        }
        if let Some(secs) = parsed("OCI_CYCLE_TIMEOUT_SECS")? {
            schedule.cycle_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = parsed("OCI_SUMMARY_EVERY")? {
            schedule.summary_every = n;
        }
        if let Some(n) = parsed("OCI_RECENT_CYCLES")? {
            schedule.recent_cycles = usize::try_from(n.max(1)).unwrap_or(usize::MAX);
        }

        let retry = &config.retry;
        let max_attempts = match parsed("OCI_MAX_ATTEMPTS")? {
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
            None => retry.max_attempts,
        };
        let base = parsed("OCI_BACKOFF_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(retry.base_delay);
        let cap = parsed("OCI_BACKOFF_CAP_MS")?
            .map(Duration::from_millis)
            .unwrap_or(retry.max_delay);
        config.retry = RetryPolicy::new(max_attempts, base, cap);

        let provider = &mut config.provider;
        if let Some(url) = get("OCI_BASE_URL") {
            provider.base_url = url.trim().trim_end_matches('/').to_string();
        }
        if let Some(path) = get("OCI_CHAIN_PATH") {
            provider.chain_path = path.trim().to_string();
        }
        if let Some(prefer) = flag("OCI_PREFER_CSV")? {
            provider.prefer_csv = prefer;
        }
        if let Some(secs) = parsed("OCI_REQUEST_TIMEOUT_SECS")? {
            provider.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(agent) = get("OCI_USER_AGENT") {
            provider.user_agent = agent;
        }

        if let Some(url) = get("OCI_STORE_URL") {
            config.store.target = url.parse()?;
        }
        if let Some(template) = get("OCI_COLLECTION_TEMPLATE") {
            if !template.contains("{symbol}") || !template.contains("{leg}") {
                bail!("OCI_COLLECTION_TEMPLATE must contain {{symbol}} and {{leg}}, got {template:?}");
            }
            config.store.collection_template = template;
        }
        if let Some(reject) = flag("OCI_REJECT_UNKEYED")? {
            config.reject_unkeyed = reject;
        }

        if let Some(level) = get("LOG_LEVEL") {
            config.logging.level = level.trim().to_string();
        }
        config.logging.file = get("LOG_FILE").map(PathBuf::from);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<PipelineConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.symbols, vec!["NIFTY".to_string()]);
        assert_eq!(config.schedule.fetch_interval, Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(
            config.store.target,
            StoreTarget::Sqlite(PathBuf::from("option_chain.db"))
        );
        assert!(!config.reject_unkeyed);
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = config_from(&[
            ("OCI_SYMBOLS", "nifty, banknifty ,"),
            ("OCI_FETCH_INTERVAL_SECS", "10"),
            ("OCI_MAX_ATTEMPTS", "4"),
            ("OCI_BACKOFF_BASE_MS", "250"),
            ("OCI_BACKOFF_CAP_MS", "2000"),
            ("OCI_STORE_URL", "memory://"),
            ("OCI_PREFER_CSV", "yes"),
            ("OCI_BASE_URL", "https://example.test/"),
            ("OCI_REJECT_UNKEYED", "true"),
        ])
        .unwrap();

        assert_eq!(config.symbols, vec!["NIFTY", "BANKNIFTY"]);
        assert_eq!(config.schedule.fetch_interval, Duration::from_secs(10));
        assert_eq!(
            config.retry,
            RetryPolicy::new(4, Duration::from_millis(250), Duration::from_secs(2))
        );
        assert_eq!(config.store.target, StoreTarget::Memory);
        assert!(config.provider.prefer_csv);
        assert_eq!(config.provider.base_url, "https://example.test");
        assert!(config.reject_unkeyed);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config_from(&[("OCI_FETCH_INTERVAL_SECS", "soon")]).is_err());
        assert!(config_from(&[("OCI_PREFER_CSV", "maybe")]).is_err());
        assert!(config_from(&[("OCI_STORE_URL", "mongodb://localhost")]).is_err());
        assert!(config_from(&[("OCI_SYMBOLS", " , ")]).is_err());
        assert!(config_from(&[("OCI_SYMBOLS", "NIFTY,nifty")]).is_err());
        assert!(config_from(&[("OCI_COLLECTION_TEMPLATE", "quotes")]).is_err());
    }

    #[test]
    fn test_collection_names_are_sanitized() {
        let store = StoreConfig::default();
        assert_eq!(
            store.collection_for("NIFTY", OptionType::Call),
            "nifty_call_option_chain"
        );
        assert_eq!(
            store.collection_for("M&M", OptionType::Put),
            "m_m_put_option_chain"
        );
    }
}
