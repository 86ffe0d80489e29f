use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Whether a failed fetch is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchClass {
    Transient,
    Permanent,
}

impl fmt::Display for FetchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchClass::Transient => write!(f, "transient"),
            FetchClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure of a single request against the quote provider.
#[derive(Debug, Clone, Error)]
#[error("{class} fetch failure: {cause}")]
pub struct FetchError {
    pub class: FetchClass,
    /// Provider rejected the session itself (cookies expired, edge block).
    pub reset_session: bool,
    pub cause: String,
}

impl FetchError {
    pub fn transient(cause: impl Into<String>) -> Self {
        Self {
            class: FetchClass::Transient,
            reset_session: false,
            cause: cause.into(),
        }
    }

    pub fn permanent(cause: impl Into<String>) -> Self {
        Self {
            class: FetchClass::Permanent,
            reset_session: false,
            cause: cause.into(),
        }
    }

    pub fn session_rejected(cause: impl Into<String>) -> Self {
        Self {
            class: FetchClass::Transient,
            reset_session: true,
            cause: cause.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == FetchClass::Transient
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            return FetchError::permanent(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_client_error() && status.as_u16() != 408 && status.as_u16() != 429 {
                return FetchError::permanent(err.to_string());
            }
        }
        // timeouts, resets, refused connections and truncated bodies
        FetchError::transient(err.to_string())
    }
}

/// A payload that cannot be turned into records at all.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is empty")]
    Empty,
    #[error("unexpected content (content-type {content_type:?})")]
    UnexpectedContent { content_type: Option<String> },
    #[error("payload is missing expected structure: {0}")]
    MissingStructure(String),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid tabular payload: {0}")]
    Csv(#[from] csv::Error),
}

/// Infrastructure failure of the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid collection name {0:?}")]
    InvalidCollection(String),
    #[error("sqlite error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Coarse classification recorded in cycle statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    FetchTransient,
    FetchPermanent,
    Parse,
    Store,
    TimedOut,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureKind::FetchTransient => "fetch/transient",
            FailureKind::FetchPermanent => "fetch/permanent",
            FailureKind::Parse => "parse",
            FailureKind::Store => "store",
            FailureKind::TimedOut => "timeout",
        };
        f.write_str(label)
    }
}

/// Anything that fails a whole cycle for one symbol.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("cycle exceeded {0:?}")]
    TimedOut(Duration),
}

impl CycleError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CycleError::Fetch(err) if err.is_transient() => FailureKind::FetchTransient,
            CycleError::Fetch(_) => FailureKind::FetchPermanent,
            CycleError::Parse(_) => FailureKind::Parse,
            CycleError::Store(_) => FailureKind::Store,
            CycleError::TimedOut(_) => FailureKind::TimedOut,
        }
    }
}

/// An on-demand cycle could not be run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("symbol {0} is not tracked")]
    UnknownSymbol(String),
    #[error("pipeline for {0} has stopped")]
    Stopped(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_errors_are_classified_by_origin() {
        let transient: CycleError = FetchError::transient("reset").into();
        let permanent: CycleError = FetchError::permanent("bad symbol").into();
        let parse: CycleError = ParseError::Empty.into();
        let store: CycleError = StoreError::Unavailable("down".into()).into();

        assert_eq!(transient.kind(), FailureKind::FetchTransient);
        assert_eq!(permanent.kind(), FailureKind::FetchPermanent);
        assert_eq!(parse.kind(), FailureKind::Parse);
        assert_eq!(store.kind(), FailureKind::Store);
        assert_eq!(
            CycleError::TimedOut(Duration::from_secs(1)).kind(),
            FailureKind::TimedOut
        );
    }

    #[test]
    fn test_session_rejection_is_retryable() {
        let err = FetchError::session_rejected("403");
        assert!(err.is_transient());
        assert!(err.reset_session);
    }
}
