//! Error type shared by every module in `mugalyser-core`.
//!
//! Failures fall into four groups:
//! - fetch failures (HTTP errors, timeouts, malformed pagination headers): always fatal to
//!   the ingestion run that hit them, never retried
//! - batch lifecycle misuse (`UnknownBatch`, `AlreadyCompleted`, `NoValidBatch`)
//! - pipeline builder misuse (duplicate sort keys, executing an empty pipeline)
//! - caller input the core cannot interpret (`UnknownPhase`)

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Network failure, timeout or non-success HTTP status from the upstream API.
    #[error("fetch failed for {url} (status {status:?}): {message}")]
    FetchFailed {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// A `Link` header that does not follow `<url>; rel="..."`.
    #[error("malformed Link header: {0:?}")]
    MalformedLink(String),

    #[error("no audit record for batch {0}")]
    UnknownBatch(i64),

    #[error("batch {0} is no longer running")]
    AlreadyCompleted(i64),

    #[error("no completed batch found in the audit history")]
    NoValidBatch,

    #[error("aggregation builder misuse: {0}")]
    BuilderMisuse(String),

    #[error("unknown ingestion phase {0:?}")]
    UnknownPhase(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("ingestion cancelled")]
    Cancelled,
}

impl Error {
    /// True for everything that should abort an ingestion run as a failed fetch.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(self, Error::FetchFailed { .. } | Error::MalformedLink(_))
    }

    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        Error::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
