use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "https://api.meetup.com/";

/// Upstream API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Sent as the `key` query parameter; usually injected from the environment.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    /// Pro account whose groups `get_pro_groups` lists.
    pub pro_account: String,
    pub events_page_size: u32,
    pub members_page_size: u32,
    pub attendees_page_size: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            timeout_secs: 30,
            pro_account: "MongoDB".to_string(),
            events_page_size: 20,
            members_page_size: 100,
            attendees_page_size: 50,
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn trace_loaded(&self) {
        info!(
            base_url = %self.base_url,
            api_key_set = self.api_key.is_some(),
            timeout_secs = self.timeout_secs,
            "Loaded ApiConfig"
        );
        debug!(
            pro_account = %self.pro_account,
            events_page_size = self.events_page_size,
            members_page_size = self.members_page_size,
            attendees_page_size = self.attendees_page_size,
            "ApiConfig page sizes"
        );
    }
}

/// Ingestion run settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Fetch everything but write nothing.
    pub trial_run: bool,
    /// Targets fetched in parallel within one phase.
    pub concurrency: usize,
    /// Documents per `insert_many` call.
    pub write_chunk: usize,
    /// Pause before the batch is marked complete.
    pub wait_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            trial_run: false,
            concurrency: 4,
            write_chunk: 100,
            wait_secs: 0,
        }
    }
}

impl IngestConfig {
    pub fn trace_loaded(&self) {
        info!(
            trial_run = self.trial_run,
            concurrency = self.concurrency,
            write_chunk = self.write_chunk,
            wait_secs = self.wait_secs,
            "Loaded IngestConfig"
        );
    }
}
