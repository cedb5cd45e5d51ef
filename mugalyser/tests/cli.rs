use assert_cmd::Command;
use predicates::prelude::*;
use std::fs::write;
use tempfile::{tempdir, NamedTempFile};

/// Config pointing the API at a closed local port, so every fetch fails fast.
fn unreachable_api_config() -> NamedTempFile {
    let config = NamedTempFile::new().expect("Creating temp config file failed");
    write(
        config.path(),
        b"api:\n  base_url: http://127.0.0.1:9/\n  timeout_secs: 2\ningest:\n  phases: [groups]\n",
    )
    .expect("Writing temp config failed");
    config
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = Command::cargo_bin("mugalyser").expect("Binary exists");
    cmd.arg("--help");
    cmd.assert().success().stdout(
        predicate::str::contains("ingest")
            .and(predicate::str::contains("report"))
            .and(predicate::str::contains("batches")),
    );
}

#[test]
fn batches_on_empty_store_prints_empty_list() {
    let dir = tempdir().unwrap();
    let store = dir.path().join("store.db");

    let mut cmd = Command::cargo_bin("mugalyser").expect("Binary exists");
    cmd.arg("--store").arg(&store).arg("batches").env_remove("MEETUP_API_KEY");
    cmd.assert().success().stdout(predicate::str::contains("[]"));
}

#[test]
fn report_without_completed_batch_fails_with_code_one() {
    let dir = tempdir().unwrap();
    let store = dir.path().join("store.db");

    let mut cmd = Command::cargo_bin("mugalyser").expect("Binary exists");
    cmd.arg("--store").arg(&store).arg("report");
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("no completed batch"));
}

#[test]
fn unknown_phase_is_rejected_before_any_batch_starts() {
    let dir = tempdir().unwrap();
    let store = dir.path().join("store.db");

    let mut cmd = Command::cargo_bin("mugalyser").expect("Binary exists");
    cmd.arg("--store")
        .arg(&store)
        .args(["ingest", "--phases", "rsvps", "--mugs", "DublinMUG"]);
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("unknown ingestion phase"));

    let mut cmd = Command::cargo_bin("mugalyser").expect("Binary exists");
    cmd.arg("--store").arg(&store).arg("batches");
    cmd.assert().success().stdout(predicate::str::contains("[]"));
}

#[test]
fn fetch_failure_exits_with_code_two_and_leaves_batch_running() {
    let dir = tempdir().unwrap();
    let store = dir.path().join("store.db");
    let config = unreachable_api_config();

    let mut cmd = Command::cargo_bin("mugalyser").expect("Binary exists");
    cmd.arg("--config")
        .arg(config.path())
        .arg("--store")
        .arg(&store)
        .args(["ingest", "--mugs", "DublinMUG"])
        .env("MEETUP_API_KEY", "test-key");
    cmd.assert().code(2).stderr(predicate::str::contains("fetch failed"));

    let mut cmd = Command::cargo_bin("mugalyser").expect("Binary exists");
    cmd.arg("--store").arg(&store).args(["batches", "--format", "csv"]);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("batchID,status,trialRun,startTime,endTime"))
        .stdout(predicate::str::contains("1,Running,false,"));

    let mut cmd = Command::cargo_bin("mugalyser").expect("Binary exists");
    cmd.arg("--store").arg(&store).args(["report", "--batch", "1"]);
    cmd.assert()
        .code(1)
        .stderr(predicate::str::contains("batch 1 is Running"));
}

use std::sync::{Arc, Mutex};
use tracing_subscriber::prelude::*; // needed for .with()
use tracing_subscriber::{layer::Context, Layer, Registry};

/// Custom Layer to collect emitted event messages.
struct EventCollector {
    events: Arc<Mutex<Vec<String>>>,
}

impl<S> Layer<S> for EventCollector
where
    S: tracing::Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        use std::fmt::Write as FmtWrite;
        let mut msg = String::new();
        let _ = write!(&mut msg, "{:?}", event);
        self.events.lock().unwrap().push(msg);
    }
}

#[tokio::test]
async fn emits_trace_initialised_event() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let collector = EventCollector {
        events: events.clone(),
    };
    let subscriber = Registry::default().with(collector);
    let _guard = tracing::subscriber::set_default(subscriber);

    use mugalyser::cli::{run, Cli, Commands};

    let dir = tempdir().unwrap();
    let cli = Cli {
        config: None,
        store: Some(dir.path().join("store.db")),
        loglevel: None,
        command: Commands::Batches {
            abandon: None,
            format: mugalyser::output::OutputFormat::Json,
        },
    };

    run(cli).await.expect("batches on an empty store succeeds");

    let event_msgs = events.lock().unwrap();
    assert!(
        event_msgs.iter().any(|msg| msg.contains("trace_initialised")),
        "Expected a 'trace_initialised' trace event, got: {:?}",
        event_msgs
    );
}
