//! Batch lifecycle bookkeeping.
//!
//! Every ingestion run owns one audit record in the `audit` collection. Ids come from the
//! store's `batchID` sequence, so concurrent runs never share one. A run that dies before
//! [`BatchAudit::end_batch`] leaves its record `Running`; such batches are never
//! considered current and reports keep reading the last completed one.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::agg::{Agg, Direction, SortSpec};
use crate::contract::DocumentStore;
use crate::error::{Error, Result};

pub const AUDIT_COLLECTION: &str = "audit";
pub const BATCH_SEQUENCE: &str = "batchID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    Running,
    Completed,
    Abandoned,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchStatus::Running => "Running",
            BatchStatus::Completed => "Completed",
            BatchStatus::Abandoned => "Abandoned",
        };
        f.write_str(s)
    }
}

/// One persisted audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    #[serde(rename = "batchID")]
    pub batch_id: i64,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    #[serde(rename = "endTime")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(rename = "trialRun")]
    pub trial_run: bool,
    /// Run parameters as given by the caller (phases, targets, flags).
    #[serde(default)]
    pub metadata: Value,
    pub status: BatchStatus,
}

#[derive(Clone)]
pub struct BatchAudit {
    store: Arc<dyn DocumentStore>,
}

impl BatchAudit {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Allocate the next batch id and record it as `Running`.
    pub async fn start_batch(&self, trial_run: bool, metadata: Value) -> Result<i64> {
        let batch_id = self.store.next_sequence(BATCH_SEQUENCE).await?;
        let record = BatchRecord {
            batch_id,
            start_time: Utc::now(),
            end_time: None,
            trial_run,
            metadata,
            status: BatchStatus::Running,
        };
        let doc = serde_json::to_value(&record).map_err(Error::storage)?;
        self.store.insert_many(AUDIT_COLLECTION, vec![doc]).await?;
        self.store.flush().await?;
        info!(batch_id, trial_run, "[AUDIT] Started batch");
        Ok(batch_id)
    }

    /// Mark a running batch `Completed` and stamp its end time.
    pub async fn end_batch(&self, batch_id: i64) -> Result<()> {
        let set = json!({
            "status": BatchStatus::Completed,
            "endTime": Utc::now(),
        });
        self.finish(batch_id, set).await?;
        info!(batch_id, "[AUDIT] Completed batch");
        Ok(())
    }

    /// Mark a stale running batch `Abandoned`. Its end time stays unset.
    pub async fn abandon_batch(&self, batch_id: i64) -> Result<()> {
        self.finish(batch_id, json!({ "status": BatchStatus::Abandoned }))
            .await?;
        warn!(batch_id, "[AUDIT] Abandoned batch");
        Ok(())
    }

    // Conditional on the record still being Running, so a batch leaves that state once.
    async fn finish(&self, batch_id: i64, set: Value) -> Result<()> {
        let filter = json!({ "batchID": batch_id, "status": BatchStatus::Running });
        let matched = self.store.update_one(AUDIT_COLLECTION, &filter, set).await?;
        if matched == 0 {
            let err = match self.get_batch(batch_id).await? {
                Some(_) => Error::AlreadyCompleted(batch_id),
                None => Error::UnknownBatch(batch_id),
            };
            error!(batch_id, error = %err, "[AUDIT] Cannot close batch");
            return Err(err);
        }
        self.store.flush().await
    }

    /// Highest completed batch id. Completed trial batches count too.
    pub async fn current_valid_batch_id(&self) -> Result<i64> {
        let mut agg = Agg::new(self.store.clone(), AUDIT_COLLECTION);
        agg.add_match(json!({ "status": BatchStatus::Completed }))?
            .add_sort(SortSpec::with_direction("batchID", Direction::Descending));
        let first = agg.execute().await?.try_next().await?;
        first
            .and_then(|doc| doc.get("batchID").and_then(Value::as_i64))
            .ok_or(Error::NoValidBatch)
    }

    /// Most recently started batch, whatever its status.
    pub async fn current_batch_id(&self) -> Result<Option<i64>> {
        let mut agg = Agg::new(self.store.clone(), AUDIT_COLLECTION);
        agg.add_sort(SortSpec::with_direction("batchID", Direction::Descending));
        let first = agg.execute().await?.try_next().await?;
        Ok(first.and_then(|doc| doc.get("batchID").and_then(Value::as_i64)))
    }

    pub async fn get_batch(&self, batch_id: i64) -> Result<Option<BatchRecord>> {
        let mut agg = Agg::new(self.store.clone(), AUDIT_COLLECTION);
        agg.add_match(json!({ "batchID": batch_id }))?;
        match agg.execute().await?.try_next().await? {
            Some(doc) => Ok(Some(serde_json::from_value(doc).map_err(Error::storage)?)),
            None => Ok(None),
        }
    }

    /// Every audit record, oldest first.
    pub async fn list_batches(&self) -> Result<Vec<BatchRecord>> {
        let mut agg = Agg::new(self.store.clone(), AUDIT_COLLECTION);
        agg.add_sort(SortSpec::new("batchID"));
        let docs: Vec<Value> = agg.execute().await?.try_collect().await?;
        docs.into_iter()
            .map(|doc| serde_json::from_value(doc).map_err(Error::storage))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn audit() -> (Arc<MemoryStore>, BatchAudit) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), BatchAudit::new(store))
    }

    #[tokio::test]
    async fn start_writes_running_record() {
        let (store, audit) = audit();
        let id = audit
            .start_batch(false, json!({ "phases": ["members"] }))
            .await
            .unwrap();
        assert_eq!(id, 1);

        let docs = store.documents(AUDIT_COLLECTION);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["status"], "Running");
        assert_eq!(docs[0]["trialRun"], false);
        assert!(docs[0]["endTime"].is_null());
        assert_eq!(docs[0]["metadata"]["phases"][0], "members");
    }

    #[tokio::test]
    async fn concurrent_starts_get_distinct_ordered_ids() {
        let (_, audit) = audit();
        let (a, b) = tokio::join!(
            audit.start_batch(false, json!({})),
            audit.start_batch(false, json!({}))
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_ne!(a, b);
        let mut ids = vec![a, b];
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn current_valid_skips_running_and_abandoned_batches() {
        let (_, audit) = audit();
        let done = audit.start_batch(false, json!({})).await.unwrap();
        audit.end_batch(done).await.unwrap();
        let abandoned = audit.start_batch(false, json!({})).await.unwrap();
        audit.abandon_batch(abandoned).await.unwrap();
        let running = audit.start_batch(false, json!({})).await.unwrap();

        assert_eq!(audit.current_valid_batch_id().await.unwrap(), done);
        assert_eq!(audit.current_batch_id().await.unwrap(), Some(running));
    }

    #[tokio::test]
    async fn completed_trial_batch_is_current() {
        let (_, audit) = audit();
        let trial = audit.start_batch(true, json!({})).await.unwrap();
        audit.end_batch(trial).await.unwrap();
        assert_eq!(audit.current_valid_batch_id().await.unwrap(), trial);

        let real = audit.start_batch(false, json!({})).await.unwrap();
        audit.end_batch(real).await.unwrap();
        assert_eq!(audit.current_valid_batch_id().await.unwrap(), real);
    }

    #[tokio::test]
    async fn no_completed_batch_is_an_error() {
        let (_, audit) = audit();
        assert!(matches!(
            audit.current_valid_batch_id().await,
            Err(Error::NoValidBatch)
        ));
        audit.start_batch(false, json!({})).await.unwrap();
        assert!(matches!(
            audit.current_valid_batch_id().await,
            Err(Error::NoValidBatch)
        ));
    }

    #[tokio::test]
    async fn end_batch_sets_end_time_once() {
        let (_, audit) = audit();
        let id = audit.start_batch(false, json!({})).await.unwrap();
        audit.end_batch(id).await.unwrap();

        let record = audit.get_batch(id).await.unwrap().unwrap();
        assert_eq!(record.status, BatchStatus::Completed);
        let ended = record.end_time.unwrap();
        assert!(ended >= record.start_time);

        assert!(matches!(
            audit.end_batch(id).await,
            Err(Error::AlreadyCompleted(i)) if i == id
        ));
        let again = audit.get_batch(id).await.unwrap().unwrap();
        assert_eq!(again.end_time, Some(ended));
    }

    #[tokio::test]
    async fn closing_unknown_or_abandoned_batches_fails() {
        let (_, audit) = audit();
        assert!(matches!(
            audit.end_batch(42).await,
            Err(Error::UnknownBatch(42))
        ));

        let id = audit.start_batch(false, json!({})).await.unwrap();
        audit.abandon_batch(id).await.unwrap();
        assert!(matches!(
            audit.end_batch(id).await,
            Err(Error::AlreadyCompleted(_))
        ));
        assert!(matches!(
            audit.abandon_batch(id).await,
            Err(Error::AlreadyCompleted(_))
        ));
    }

    #[tokio::test]
    async fn list_batches_is_oldest_first() {
        let (_, audit) = audit();
        for _ in 0..3 {
            audit.start_batch(false, json!({})).await.unwrap();
        }
        audit.end_batch(2).await.unwrap();
        let batches = audit.list_batches().await.unwrap();
        let ids: Vec<i64> = batches.iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(batches[1].status, BatchStatus::Completed);
        assert_eq!(batches[2].status, BatchStatus::Running);
    }
}
