//! # contract: seams between the core pipeline and the outside world
//!
//! Three traits describe everything the core needs from its collaborators:
//!
//! - [`Fetcher`]: one HTTP GET against the upstream REST API, returning headers and a
//!   decoded JSON body. [`crate::fetch::HttpFetcher`] is the production implementation.
//! - [`EntitySource`]: the record stream for one ingestion phase and target, implemented
//!   by [`crate::meetup::MeetupApi`] on top of a fetcher.
//! - [`DocumentStore`]: an additive document sink plus an aggregation-pipeline executor.
//!   [`crate::sqlite::SqliteStore`] persists to disk; [`crate::store::MemoryStore`] keeps
//!   everything in process.
//!
//! All traits are annotated for `mockall`, so tests (and downstream crates with the
//! `test-export-mocks` feature) get `MockFetcher`, `MockEntitySource` and
//! `MockDocumentStore`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use mockall::automock;
use serde_json::Value;

use crate::agg::Stage;
use crate::error::Result;
use crate::ingest::Phase;

/// A single decoded upstream record or stored document.
pub type Record = Value;

/// Response headers. Lookups are case-sensitive; `Link` is the only one the pagination
/// engine reads.
pub type Headers = BTreeMap<String, String>;

/// Query parameters appended to a request, in order.
pub type QueryParams = Vec<(String, String)>;

/// Lazy sequence of documents produced by the store or by pagination.
pub type DocumentStream = BoxStream<'static, Result<Record>>;

/// One upstream response: headers plus decoded JSON body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub headers: Headers,
    pub body: Value,
}

impl Response {
    pub fn new(headers: Headers, body: Value) -> Self {
        Self { headers, body }
    }

    /// Response with a body only, as returned by unpaginated endpoints.
    pub fn body(body: Value) -> Self {
        Self {
            headers: Headers::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }
}

/// Performs one GET request against the upstream API.
///
/// Implementations must fail with [`crate::Error::FetchFailed`] on non-2xx responses,
/// transport errors and timeouts; the pagination engine propagates these unchanged.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, params: &QueryParams) -> Result<Response>;
}

/// Resolves the upstream record stream for one phase and one target (a group url-name).
///
/// The first page is fetched eagerly, so a failing first request surfaces from this call;
/// later pages fail through the stream.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait EntitySource: Send + Sync {
    async fn records(&self, phase: Phase, target: &str) -> Result<DocumentStream>;
}

/// Storage collaborator: additive writes keyed by collection name and ordered pipeline
/// execution.
///
/// Documents are never updated in place except for audit bookkeeping through
/// [`DocumentStore::update_one`].
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Append documents to a collection, preserving their order.
    async fn insert_many(&self, collection: &str, docs: Vec<Record>) -> Result<()>;

    /// Run the stages in order against a collection and stream the results.
    async fn aggregate(&self, collection: &str, pipeline: &[Stage]) -> Result<DocumentStream>;

    /// Atomically increment the named counter and return its new value (first call → 1).
    async fn next_sequence(&self, name: &str) -> Result<i64>;

    /// Merge `set` into the first document matching `filter`. Returns the number of
    /// documents matched (0 or 1). Check and update happen atomically.
    async fn update_one(&self, collection: &str, filter: &Value, set: Value) -> Result<u64>;

    /// Make previous writes durable. No-op for purely in-memory stores.
    async fn flush(&self) -> Result<()>;
}
