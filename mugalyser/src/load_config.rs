/// `load_config` module: reads the YAML run configuration and injects secrets from the
/// environment.
///
/// The file has three optional sections:
///
/// ```yaml
/// api:
///   base_url: https://api.meetup.com/
///   timeout_secs: 30
///   events_page_size: 20
/// store:
///   path: ./mugalyser.db
/// ingest:
///   phases: [all]
///   mugs: [DublinMUG]
///   concurrency: 4
///   write_chunk: 100
/// ```
///
/// The API key is never expected in the file; it is taken from `MEETUP_API_KEY`
/// (a `.env` file works too, `main` loads it through `dotenvy`).
///
/// # Errors
/// All errors use `anyhow::Error` and are surfaced at the CLI boundary.
use anyhow::Result;
use mugalyser_core::config::{ApiConfig, IngestConfig};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

pub const API_KEY_ENV: &str = "MEETUP_API_KEY";
pub const DEFAULT_STORE_PATH: &str = "mugalyser.db";

#[derive(Debug, Default, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub ingest: IngestSection,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// SQLite database shared by every command.
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_STORE_PATH),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub phases: Vec<String>,
    /// Group url-names to ingest. Empty means every group of the pro account.
    pub mugs: Vec<String>,
    #[serde(flatten)]
    pub run: IngestConfig,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            phases: vec!["all".to_string()],
            mugs: Vec::new(),
            run: IngestConfig::default(),
        }
    }
}

impl CliConfig {
    /// Fill the API key from the environment. A set, non-empty variable wins over the file.
    pub fn inject_env(&mut self) {
        match std::env::var(API_KEY_ENV) {
            Ok(key) if !key.trim().is_empty() => {
                info!(env = API_KEY_ENV, "API key taken from environment");
                self.api.api_key = Some(key.trim().to_string());
            }
            _ if self.api.api_key.is_none() => {
                warn!(env = API_KEY_ENV, "No API key configured; requests go out unsigned");
            }
            _ => {}
        }
    }

    pub fn trace_loaded(&self) {
        self.api.trace_loaded();
        self.ingest.run.trace_loaded();
        info!(
            store_path = %self.store.path.display(),
            phases = ?self.ingest.phases,
            mugs = self.ingest.mugs.len(),
            "Loaded CliConfig"
        );
    }
}

/// Loads the YAML config file and injects the API key from the environment.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<CliConfig> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let config_content = match fs::read_to_string(path_ref) {
        Ok(content) => content,
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
            return Err(anyhow::anyhow!(
                "Failed to read config file {:?}: {}",
                path_ref,
                e
            ));
        }
    };

    let mut config: CliConfig = match serde_yaml::from_str(&config_content) {
        Ok(conf) => {
            info!(config_path = ?path_ref, "Parsed config YAML successfully");
            conf
        }
        Err(e) => {
            error!(error = ?e, config_path = ?path_ref, "Failed to parse config YAML");
            return Err(anyhow::anyhow!("Failed to parse config YAML: {e}"));
        }
    };

    config.inject_env();
    Ok(config)
}

/// Config from `path` when given, defaults plus environment otherwise.
pub fn load_or_default(path: Option<&Path>) -> Result<CliConfig> {
    let config = match path {
        Some(path) => load_config(path)?,
        None => {
            let mut config = CliConfig::default();
            config.inject_env();
            config
        }
    };
    config.trace_loaded();
    Ok(config)
}
