use std::sync::Arc;

use futures::TryStreamExt;
use mugalyser_core::agg::Agg;
use mugalyser_core::audit::{BatchAudit, BatchStatus};
use mugalyser_core::config::{ApiConfig, IngestConfig};
use mugalyser_core::contract::{MockFetcher, Response};
use mugalyser_core::ingest::{Ingestor, Phase};
use mugalyser_core::meetup::MeetupApi;
use mugalyser_core::paginate::LINK_HEADER;
use mugalyser_core::reports::{Region, Reports};
use mugalyser_core::sqlite::SqliteStore;
use mugalyser_core::store::MemoryStore;
use mugalyser_core::Error;
use serde_json::{json, Value};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

const BASE: &str = "https://api.test";

fn api_config() -> ApiConfig {
    ApiConfig {
        base_url: format!("{BASE}/"),
        api_key: Some("secret".to_string()),
        ..ApiConfig::default()
    }
}

fn past_event(id: &str, group: &str, time_ms: i64, rsvp: i64) -> Value {
    json!({
        "id": id,
        "name": format!("event {id}"),
        "status": "past",
        "time": time_ms,
        "yes_rsvp_count": rsvp,
        "group": { "urlname": group }
    })
}

/// Upstream with one group whose past events span a legacy two-page listing.
fn healthy_upstream() -> MockFetcher {
    let mut fetcher = MockFetcher::new();
    fetcher
        .expect_fetch()
        .withf(|url, _| url == "https://api.test/DublinMUG")
        .returning(|_, _| {
            Ok(Response::body(json!({
                "urlname": "DublinMUG",
                "country": "IE",
                "member_count": 700,
                "lat": 53.3,
                "lon": -6.2
            })))
        });
    fetcher
        .expect_fetch()
        .withf(|url, _| url == "https://api.test/2/events")
        .returning(|_, _| {
            Ok(Response::body(json!({
                "results": [past_event("e1", "DublinMUG", 1473163200000, 40)],
                "meta": { "next": "https://api.test/2/events?offset=1" }
            })))
        });
    fetcher
        .expect_fetch()
        .withf(|url, _| url == "https://api.test/2/events?offset=1")
        .returning(|_, _| {
            Ok(Response::body(json!({
                "results": [past_event("e2", "DublinMUG", 1491048000000, 25)],
                "meta": { "next": "" }
            })))
        });
    fetcher
        .expect_fetch()
        .withf(|url, _| url.ends_with("/attendance"))
        .returning(|_, _| {
            Ok(Response::body(json!([{ "member": { "id": 1 } }]))
                .with_header(LINK_HEADER, r#"<https://api.test/x>; rel="prev""#))
        });
    fetcher
}

#[tokio::test]
async fn ingest_then_report_across_store_reopen() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("mugalyser.db");

    {
        let store = Arc::new(SqliteStore::open(&db).unwrap());
        let api = MeetupApi::new(Arc::new(healthy_upstream()), api_config());
        let ingestor = Ingestor::new(Arc::new(api), store.clone(), IngestConfig::default());
        let phases = Phase::parse_list(&["groups", "pastevents", "attendees"]).unwrap();
        let report = ingestor
            .run_batch(&phases, &["DublinMUG".to_string()], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.batch_id, 1);
        assert_eq!(report.total(), 1 + 2 + 2);
    }

    let store = Arc::new(SqliteStore::open(&db).unwrap());
    assert_eq!(store.count("attendees").unwrap(), 2);
    let mut by_batch = Agg::new(store.clone(), "groups");
    by_batch.add_match(json!({ "batchID": 1 })).unwrap();
    let groups: Vec<Value> = by_batch
        .execute()
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(
        groups[0]["group"]["location"]["coordinates"],
        json!([-6.2, 53.3])
    );

    let batch_id = BatchAudit::new(store.clone())
        .current_valid_batch_id()
        .await
        .unwrap();
    let reports = Reports::new(store);
    let urls = reports.group_urlnames(batch_id, &Region::Eu).await.unwrap();
    assert_eq!(urls, vec!["DublinMUG"]);

    let totals: Vec<Value> = reports
        .meetup_totals(batch_id, &urls)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(
        totals,
        vec![
            json!({ "year": 2016, "total_rsvp": 40, "total_events": 1 }),
            json!({ "year": 2017, "total_rsvp": 25, "total_events": 1 }),
        ]
    );
}

#[tokio::test]
async fn failed_batch_does_not_replace_current() {
    let store = Arc::new(MemoryStore::new());
    let api = MeetupApi::new(Arc::new(healthy_upstream()), api_config());
    let ingestor = Ingestor::new(Arc::new(api), store.clone(), IngestConfig::default());
    ingestor
        .run_batch(&[Phase::Groups], &["DublinMUG".to_string()], &CancellationToken::new())
        .await
        .unwrap();

    let mut broken = MockFetcher::new();
    broken.expect_fetch().returning(|url, _| {
        Err(Error::FetchFailed {
            url: url.to_string(),
            status: Some(503),
            message: "unavailable".to_string(),
        })
    });
    let api = MeetupApi::new(Arc::new(broken), api_config());
    let ingestor = Ingestor::new(Arc::new(api), store.clone(), IngestConfig::default());
    let err = ingestor
        .run_batch(&[Phase::Groups], &["DublinMUG".to_string()], &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_fetch_failure());

    let audit = BatchAudit::new(store);
    assert_eq!(audit.current_valid_batch_id().await.unwrap(), 1);
    assert_eq!(audit.current_batch_id().await.unwrap(), Some(2));
    let batches = audit.list_batches().await.unwrap();
    assert_eq!(batches[1].status, BatchStatus::Running);
}
