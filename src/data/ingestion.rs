use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::models::RawPayload;
use super::retry::RetryPolicy;
use crate::config::ProviderConfig;
use crate::error::FetchError;

/// One raw request against the quote provider.
///
/// Implementations perform a single attempt; retrying belongs to
/// [`FetchClient`].
#[async_trait]
pub trait QuoteSource: Send + Sync {
    async fn fetch_once(&self, symbol: &str) -> Result<RawPayload, FetchError>;

    /// Drops session state so the next attempt starts from a fresh handshake.
    async fn reset_session(&self);
}

/// Cookie-carrying HTTP session against the option-chain provider.
///
/// The `reqwest::Client` is reused across calls and only rebuilt (and
/// re-warmed) after the provider rejects the session.
pub struct ProviderSession {
    config: ProviderConfig,
    client: Mutex<Option<reqwest::Client>>,
}

impl ProviderSession {
    /// Creates a session for `config`.
    ///
    /// No connection is made here; the first fetch builds the client and
    /// warms it up.
    ///
    /// # Arguments
    /// * `config`: provider endpoint, headers and request timeout
    ///
    /// # Returns
    /// A session with no HTTP client yet.
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
        }
    }

    fn build_client(&self) -> Result<reqwest::Client, FetchError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        let referer = format!("{}/option-chain", self.config.base_url);
        let referer = HeaderValue::from_str(&referer)
            .map_err(|e| FetchError::permanent(format!("invalid referer {referer:?}: {e}")))?;
        headers.insert(header::REFERER, referer);

        reqwest::Client::builder()
            .user_agent(self.config.user_agent.as_str())
            .default_headers(headers)
            .cookie_store(true)
            .gzip(true)
            .timeout(self.config.request_timeout)
            .build()
            .map_err(|e| FetchError::permanent(format!("cannot build http client: {e}")))
    }

    /// Visits the landing pages the provider expects before it serves data.
    /// Failures here are tolerated; the data request reports the real error.
    async fn warm_up(&self, client: &reqwest::Client) {
        for path in ["", "/option-chain"] {
            let url = format!("{}{}", self.config.base_url, path);
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %url, "session warm-up ok");
                }
                Ok(resp) => {
                    warn!(url = %url, status = resp.status().as_u16(), "session warm-up rejected");
                }
                Err(err) => {
                    warn!(url = %url, "session warm-up failed: {}", err);
                }
            }
        }
    }

    async fn session(&self) -> Result<reqwest::Client, FetchError> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        info!(base_url = %self.config.base_url, "establishing provider session");
        let client = self.build_client()?;
        self.warm_up(&client).await;
        *guard = Some(client.clone());
        Ok(client)
    }

    fn chain_url(&self, symbol: &str) -> String {
        let mut url = format!(
            "{}{}?symbol={}",
            self.config.base_url, self.config.chain_path, symbol
        );
        if self.config.prefer_csv {
            url.push_str("&csv=true");
        }
        url
    }
}

#[async_trait]
impl QuoteSource for ProviderSession {
    async fn fetch_once(&self, symbol: &str) -> Result<RawPayload, FetchError> {
        let client = self.session().await?;
        let url = self.chain_url(symbol);

        let response = client.get(&url).send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        debug!(
            symbol,
            status,
            content_type = content_type.as_deref().unwrap_or("unknown"),
            bytes = body.len(),
            "provider responded"
        );

        let payload = RawPayload::new(status, content_type, body);
        classify_response(&payload)?;
        Ok(payload)
    }

    async fn reset_session(&self) {
        let mut guard = self.client.lock().await;
        if guard.take().is_some() {
            info!(base_url = %self.config.base_url, "provider session dropped");
        }
    }
}

/// Maps an HTTP-level outcome onto the retry taxonomy.
pub fn classify_response(payload: &RawPayload) -> Result<(), FetchError> {
    match payload.status {
        200..=299 if payload.looks_like_html() => Err(FetchError::session_rejected(
            "provider served an html page instead of data",
        )),
        200..=299 => Ok(()),
        401 | 403 => Err(FetchError::session_rejected(format!(
            "provider rejected session with {}",
            payload.status
        ))),
        408 | 429 | 500..=599 => Err(FetchError::transient(format!(
            "provider returned {}",
            payload.status
        ))),
        status => Err(FetchError::permanent(format!("provider returned {status}"))),
    }
}

/// Retrying front end over a [`QuoteSource`].
#[derive(Clone)]
pub struct FetchClient {
    source: Arc<dyn QuoteSource>,
    policy: RetryPolicy,
}

impl FetchClient {
    /// Creates a retrying client.
    ///
    /// # Arguments
    /// * `source`: performs single attempts against the provider
    /// * `policy`: attempt budget and backoff between attempts
    pub fn new(source: Arc<dyn QuoteSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    /// Fetches the current option chain for `symbol`, retrying transient
    /// failures with backoff and resetting the session when the provider
    /// asks for it.
    pub async fn fetch(&self, symbol: &str) -> Result<RawPayload, FetchError> {
        let source = &self.source;
        self.policy
            .run(
                |attempt| {
                    debug!(symbol, attempt = attempt + 1, "fetching option chain");
                    source.fetch_once(symbol)
                },
                |err| {
                    let reset = err.reset_session;
                    async move {
                        if reset {
                            source.reset_session().await;
                        }
                    }
                },
            )
            .await
    }
}

/// Default request timeout, shared with the config defaults.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchClass;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        script: parking_lot::Mutex<VecDeque<Result<RawPayload, FetchError>>>,
        resets: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<RawPayload, FetchError>>) -> Self {
            Self {
                script: parking_lot::Mutex::new(script.into()),
                resets: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl QuoteSource for ScriptedSource {
        async fn fetch_once(&self, _symbol: &str) -> Result<RawPayload, FetchError> {
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(FetchError::permanent("script exhausted")))
        }

        async fn reset_session(&self) {
            self.resets.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ok_payload() -> RawPayload {
        RawPayload::new(200, Some("application/json".into()), "{\"records\":{\"data\":[]}}")
    }

    #[test]
    fn test_statuses_are_classified() {
        assert!(classify_response(&ok_payload()).is_ok());

        let forbidden = classify_response(&RawPayload::new(403, None, "")).unwrap_err();
        assert_eq!(forbidden.class, FetchClass::Transient);
        assert!(forbidden.reset_session);

        let busy = classify_response(&RawPayload::new(503, None, "")).unwrap_err();
        assert_eq!(busy.class, FetchClass::Transient);
        assert!(!busy.reset_session);

        let throttled = classify_response(&RawPayload::new(429, None, "")).unwrap_err();
        assert!(throttled.is_transient());

        let missing = classify_response(&RawPayload::new(404, None, "")).unwrap_err();
        assert_eq!(missing.class, FetchClass::Permanent);
    }

    #[test]
    fn test_html_with_ok_status_is_a_session_rejection() {
        let page = RawPayload::new(200, Some("text/html; charset=utf-8".into()), "<html>");
        let err = classify_response(&page).unwrap_err();
        assert!(err.reset_session);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_is_reset_only_when_provider_rejects_it() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(FetchError::session_rejected("403")),
            Err(FetchError::transient("timeout")),
            Ok(ok_payload()),
        ]));
        let client = FetchClient::new(
            source.clone(),
            RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40)),
        );

        let payload = client.fetch("NIFTY").await.unwrap();
        assert_eq!(payload, ok_payload());
        assert_eq!(source.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_returns_immediately() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(FetchError::permanent("404")),
            Ok(ok_payload()),
        ]));
        let client = FetchClient::new(source.clone(), RetryPolicy::default());

        let err = client.fetch("NIFTY").await.unwrap_err();
        assert_eq!(err.class, FetchClass::Permanent);
        assert_eq!(source.script.lock().len(), 1);
    }

    #[test]
    fn test_csv_preference_is_reflected_in_url() {
        let mut config = ProviderConfig::default();
        config.base_url = "https://example.test".into();
        config.chain_path = "/api/chain".into();
        config.prefer_csv = true;
        let session = ProviderSession::new(config);
        assert_eq!(
            session.chain_url("BANKNIFTY"),
            "https://example.test/api/chain?symbol=BANKNIFTY&csv=true"
        );
    }
}
