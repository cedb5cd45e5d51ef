//! Ingestion pipeline: drives entity phases for a set of groups into the store.
//!
//! Phases run one after another in the order given. Within a phase every target group is
//! fetched concurrently (bounded by [`IngestConfig::concurrency`]); each target writes its
//! own records in order, `write_chunk` documents per `insert_many`. Every document is
//! tagged with the active `batchID` and the ingestion timestamp.
//!
//! The first failure in any phase or target aborts the run. In [`Ingestor::run_batch`] the
//! batch is then left `Running`, so reports keep using the previous completed batch.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::BatchAudit;
use crate::config::IngestConfig;
use crate::contract::{DocumentStore, EntitySource, Record};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Groups,
    PastEvents,
    UpcomingEvents,
    Members,
    Attendees,
}

impl Phase {
    /// What `all` expands to, in run order.
    pub const ALL: [Phase; 5] = [
        Phase::Groups,
        Phase::Members,
        Phase::Attendees,
        Phase::UpcomingEvents,
        Phase::PastEvents,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::Groups => "groups",
            Phase::PastEvents => "pastevents",
            Phase::UpcomingEvents => "upcomingevents",
            Phase::Members => "members",
            Phase::Attendees => "attendees",
        }
    }

    pub fn collection(self) -> &'static str {
        match self {
            Phase::Groups => "groups",
            Phase::PastEvents => "past_events",
            Phase::UpcomingEvents => "upcoming_events",
            Phase::Members => "members",
            Phase::Attendees => "attendees",
        }
    }

    /// Field holding the upstream record in stored documents. Attendee records already
    /// arrive as `{attendee, event}` pairs and are stored flat.
    fn payload_key(self) -> Option<&'static str> {
        match self {
            Phase::Groups => Some("group"),
            Phase::PastEvents | Phase::UpcomingEvents => Some("event"),
            Phase::Members => Some("member"),
            Phase::Attendees => None,
        }
    }

    /// Build the stored document for one upstream record.
    pub fn wrap(self, record: Record, batch_id: i64, timestamp: &str) -> Record {
        let mut doc = Map::new();
        doc.insert("batchID".into(), json!(batch_id));
        doc.insert("timestamp".into(), json!(timestamp));
        match (self.payload_key(), record) {
            (Some(key), record) => {
                doc.insert(key.into(), record);
            }
            (None, Value::Object(fields)) => {
                for (k, v) in fields {
                    if k != "batchID" && k != "timestamp" {
                        doc.insert(k, v);
                    }
                }
            }
            (None, other) => {
                doc.insert("record".into(), other);
            }
        }
        Value::Object(doc)
    }

    /// Parse phase names in order, expanding `all` and dropping repeats.
    pub fn parse_list<S: AsRef<str>>(names: &[S]) -> Result<Vec<Phase>> {
        let mut phases = Vec::new();
        for name in names {
            let expanded: Vec<Phase> = if name.as_ref().trim().eq_ignore_ascii_case("all") {
                Phase::ALL.to_vec()
            } else {
                vec![name.as_ref().parse()?]
            };
            for phase in expanded {
                if !phases.contains(&phase) {
                    phases.push(phase);
                }
            }
        }
        Ok(phases)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "groups" => Ok(Phase::Groups),
            "pastevents" => Ok(Phase::PastEvents),
            "upcomingevents" => Ok(Phase::UpcomingEvents),
            "members" => Ok(Phase::Members),
            "attendees" => Ok(Phase::Attendees),
            _ => Err(Error::UnknownPhase(s.to_string())),
        }
    }
}

/// Records seen per target within one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub counts: BTreeMap<String, usize>,
}

impl PhaseReport {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub batch_id: i64,
    pub trial_run: bool,
    pub phases: Vec<PhaseReport>,
    pub elapsed: Duration,
}

impl IngestReport {
    pub fn total(&self) -> usize {
        self.phases.iter().map(PhaseReport::total).sum()
    }
}

pub struct Ingestor {
    source: Arc<dyn EntitySource>,
    store: Arc<dyn DocumentStore>,
    audit: BatchAudit,
    config: IngestConfig,
}

impl Ingestor {
    pub fn new(
        source: Arc<dyn EntitySource>,
        store: Arc<dyn DocumentStore>,
        config: IngestConfig,
    ) -> Self {
        let audit = BatchAudit::new(store.clone());
        Self {
            source,
            store,
            audit,
            config,
        }
    }

    pub fn audit(&self) -> &BatchAudit {
        &self.audit
    }

    /// Start a batch, run every phase into it, optionally wait, then complete it.
    ///
    /// On any error the batch stays `Running` and the error is returned.
    pub async fn run_batch(
        &self,
        phases: &[Phase],
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let started = Instant::now();
        let metadata = json!({
            "phases": phases.iter().map(|p| p.name()).collect::<Vec<_>>(),
            "targets": targets,
            "concurrency": self.config.concurrency,
            "writeChunk": self.config.write_chunk,
        });
        let batch_id = self
            .audit
            .start_batch(self.config.trial_run, metadata)
            .await?;

        let phase_reports = match self.run(batch_id, phases, targets, cancel).await {
            Ok(reports) => reports,
            Err(e) => {
                error!(batch_id, error = %e, "[INGEST] Run aborted, batch left running");
                return Err(e);
            }
        };

        if self.config.wait_secs > 0 {
            info!(batch_id, wait_secs = self.config.wait_secs, "[INGEST] Waiting before completing batch");
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!(batch_id, "[INGEST] Cancelled while waiting, batch left running");
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep(Duration::from_secs(self.config.wait_secs)) => {}
            }
        }

        self.audit.end_batch(batch_id).await?;
        let report = IngestReport {
            batch_id,
            trial_run: self.config.trial_run,
            phases: phase_reports,
            elapsed: started.elapsed(),
        };
        info!(
            batch_id,
            records = report.total(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "[INGEST] Batch complete"
        );
        Ok(report)
    }

    /// Run the phases in order into an already started batch.
    pub async fn run(
        &self,
        batch_id: i64,
        phases: &[Phase],
        targets: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<PhaseReport>> {
        let mut reports = Vec::with_capacity(phases.len());
        for &phase in phases {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            info!(batch_id, phase = %phase, targets = targets.len(), "[INGEST] Phase start");

            let counts: BTreeMap<String, usize> = stream::iter(targets.iter().cloned())
                .map(|target| async move {
                    let count = self
                        .ingest_target(batch_id, phase, &target, cancel)
                        .await
                        .inspect_err(|e| {
                            error!(batch_id, phase = %phase, group = %target, error = %e, "[INGEST] Target failed");
                        })?;
                    Ok::<_, Error>((target, count))
                })
                .buffer_unordered(self.config.concurrency.max(1))
                .try_collect()
                .await?;

            self.store.flush().await?;
            let report = PhaseReport { phase, counts };
            info!(batch_id, phase = %phase, records = report.total(), "[INGEST] Phase done");
            reports.push(report);
        }
        Ok(reports)
    }

    async fn ingest_target(
        &self,
        batch_id: i64,
        phase: Phase,
        target: &str,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        // Fetches are raced against the token so a stalled request does not hold up shutdown.
        let mut records = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            records = self.source.records(phase, target) => records?,
        };
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let chunk_size = self.config.write_chunk.max(1);
        let mut chunk = Vec::with_capacity(chunk_size);
        let mut count = 0;

        loop {
            let record = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = records.try_next() => match next? {
                    Some(record) => record,
                    None => break,
                },
            };
            count += 1;
            if self.config.trial_run {
                continue;
            }
            chunk.push(phase.wrap(record, batch_id, &timestamp));
            if chunk.len() >= chunk_size {
                self.store
                    .insert_many(phase.collection(), std::mem::take(&mut chunk))
                    .await?;
            }
        }
        if !chunk.is_empty() {
            self.store.insert_many(phase.collection(), chunk).await?;
        }
        debug!(batch_id, phase = %phase, group = target, count, "[INGEST] Target done");
        Ok(count)
    }
}
