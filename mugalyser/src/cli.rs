/// # mugalyser CLI Interface (Module)
///
/// Command parsing and orchestration for the `mugalyser` binary. All ingestion, audit and
/// reporting logic lives in [`mugalyser_core`]; this module wires configuration, the HTTP
/// fetcher and the SQLite store together and formats results.
///
/// ## Subcommands
/// - `ingest`: fetch phases for a set of groups into a new batch.
/// - `report`: run canned reports against the current valid batch.
/// - `batches`: list audit records, or abandon a stale running batch.
///
/// For programmatic and integration use, call [`run`] with a constructed [`Cli`].
use crate::load_config::{load_or_default, CliConfig};
use crate::mugs::read_mug_file;
use crate::output::{write_rows, OutputFormat};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use futures::TryStreamExt;
use mugalyser_core::audit::{BatchAudit, BatchStatus};
use mugalyser_core::contract::DocumentStore;
use mugalyser_core::fetch::HttpFetcher;
use mugalyser_core::ingest::{Ingestor, Phase};
use mugalyser_core::meetup::MeetupApi;
use mugalyser_core::reports::{EventFilter, Region, Report, Reports};
use mugalyser_core::sqlite::SqliteStore;
use serde_json::Value;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_FETCH_FAILED: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

/// CLI for mugalyser: ingest Meetup group history and report on it.
#[derive(Parser)]
#[clap(
    name = "mugalyser",
    version,
    about = "Ingest Meetup group, event and member history into batches and report on it"
)]
pub struct Cli {
    /// Path to the YAML config file
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database file (overrides `store.path` from the config)
    #[clap(long, global = true)]
    pub store: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `mugalyser_core=trace` (overrides RUST_LOG)
    #[clap(long, global = true)]
    pub loglevel: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fetch the given phases for every target group into a new batch
    Ingest {
        /// Phases to run, in order: groups, members, attendees, upcomingevents, pastevents, all
        #[clap(long, value_delimiter = ',', num_args = 1..)]
        phases: Vec<String>,

        /// Group url-names to ingest
        #[clap(long, num_args = 1..)]
        mugs: Vec<String>,

        /// File with one group url-name per line
        #[clap(long)]
        mugfile: Option<PathBuf>,

        /// Fetch everything but store nothing
        #[clap(long)]
        trialrun: bool,

        /// Seconds to wait before marking the batch complete
        #[clap(long)]
        wait: Option<u64>,

        /// Groups fetched in parallel within a phase
        #[clap(long)]
        concurrency: Option<usize>,

        /// Meetup API key (overrides MEETUP_API_KEY)
        #[clap(long)]
        apikey: Option<String>,
    },

    /// Print reports for the current valid batch
    Report {
        /// Reports to print: meetups, groups, members, events
        #[clap(long, value_delimiter = ',', num_args = 1.., default_value = "meetups")]
        stats: Vec<String>,

        /// Region to report on: all, EU, US, NORDICS, or comma-separated country codes
        #[clap(long, default_value = "all")]
        country: String,

        #[clap(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Output file; `-` is stdout
        #[clap(long, default_value = "-")]
        output: PathBuf,

        /// Report on this batch instead of the current valid one
        #[clap(long)]
        batch: Option<i64>,

        /// Earliest event date (YYYY-MM-DD) for the events report
        #[clap(long)]
        start: Option<String>,

        /// Latest event date (YYYY-MM-DD) for the events report
        #[clap(long)]
        end: Option<String>,

        /// Minimum RSVP count for the events report
        #[clap(long, default_value_t = 0)]
        min_rsvp: i64,
    },

    /// List batch audit records
    Batches {
        /// Mark this running batch as abandoned first
        #[clap(long)]
        abandon: Option<i64>,

        #[clap(long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,
    },
}

/// Map an error returned by [`run`] to the process exit code.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<mugalyser_core::Error>() {
        Some(mugalyser_core::Error::Cancelled) => EXIT_INTERRUPTED,
        Some(e) if e.is_fetch_failure() => EXIT_FETCH_FAILED,
        _ => EXIT_FAILURE,
    }
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    run_with_cancel(cli, CancellationToken::new()).await
}

pub async fn run_with_cancel(cli: Cli, cancel: CancellationToken) -> Result<()> {
    // Emit a top-level 'trace_initialised' event at the very start
    tracing::info!("trace_initialised");

    let config = load_or_default(cli.config.as_deref())?;
    let store_path = cli.store.clone().unwrap_or_else(|| config.store.path.clone());
    let store = Arc::new(
        SqliteStore::open(&store_path)
            .with_context(|| format!("Failed to open store {}", store_path.display()))?,
    );

    match cli.command {
        Commands::Ingest {
            phases,
            mugs,
            mugfile,
            trialrun,
            wait,
            concurrency,
            apikey,
        } => {
            let args = IngestArgs {
                phases,
                mugs,
                mugfile,
                trialrun,
                wait,
                concurrency,
                apikey,
            };
            ingest(config, store, args, cancel).await
        }
        Commands::Report {
            stats,
            country,
            format,
            output,
            batch,
            start,
            end,
            min_rsvp,
        } => {
            let filter = EventFilter {
                start: start.as_deref().map(parse_day).transpose()?,
                end: end.as_deref().map(parse_day).transpose()?,
                min_rsvp,
            };
            let args = ReportArgs {
                stats,
                country,
                format,
                output,
                batch,
                filter,
            };
            report(store, args).await
        }
        Commands::Batches { abandon, format } => batches(store, abandon, format).await,
    }
}

struct IngestArgs {
    phases: Vec<String>,
    mugs: Vec<String>,
    mugfile: Option<PathBuf>,
    trialrun: bool,
    wait: Option<u64>,
    concurrency: Option<usize>,
    apikey: Option<String>,
}

async fn ingest(
    mut config: CliConfig,
    store: Arc<SqliteStore>,
    args: IngestArgs,
    cancel: CancellationToken,
) -> Result<()> {
    if args.apikey.is_some() {
        config.api.api_key = args.apikey;
    }
    let mut run = config.ingest.run.clone();
    run.trial_run |= args.trialrun;
    if let Some(wait) = args.wait {
        run.wait_secs = wait;
    }
    if let Some(concurrency) = args.concurrency {
        run.concurrency = concurrency;
    }

    let phase_names = if args.phases.is_empty() {
        config.ingest.phases.clone()
    } else {
        args.phases
    };
    let phases = Phase::parse_list(phase_names.as_slice())?;

    let fetcher = HttpFetcher::new(config.api.timeout())?;
    let api = MeetupApi::new(Arc::new(fetcher), config.api.clone());

    let mut targets = args.mugs;
    if let Some(path) = &args.mugfile {
        targets.extend(read_mug_file(path)?);
    }
    if targets.is_empty() {
        targets = config.ingest.mugs.clone();
    }
    if targets.is_empty() {
        tracing::info!(pro_account = %config.api.pro_account, "No mugs given, using pro account groups");
        targets = api.get_group_names().await?.try_collect().await?;
    }
    dedup_targets(&mut targets);

    tracing::info!(
        command = "ingest",
        phases = ?phases,
        targets = targets.len(),
        trial_run = run.trial_run,
        "Starting ingestion"
    );
    let ingestor = Ingestor::new(Arc::new(api), store, run);
    let report = ingestor.run_batch(&phases, &targets, &cancel).await?;

    let mut stdout = std::io::stdout().lock();
    writeln!(
        stdout,
        "batch {} complete{}: {} records in {:.1}s",
        report.batch_id,
        if report.trial_run { " (trial run)" } else { "" },
        report.total(),
        report.elapsed.as_secs_f64()
    )?;
    for phase in &report.phases {
        writeln!(stdout, "  {:<16}{}", phase.phase.name(), phase.total())?;
    }
    Ok(())
}

struct ReportArgs {
    stats: Vec<String>,
    country: String,
    format: OutputFormat,
    output: PathBuf,
    batch: Option<i64>,
    filter: EventFilter,
}

async fn report(store: Arc<SqliteStore>, args: ReportArgs) -> Result<()> {
    let selected = args
        .stats
        .iter()
        .map(|s| s.parse::<Report>())
        .collect::<mugalyser_core::Result<Vec<_>>>()?;
    let region: Region = args.country.parse()?;

    let store: Arc<dyn DocumentStore> = store;
    let batch_id = resolve_batch(&BatchAudit::new(store.clone()), args.batch).await?;
    let reports = Reports::new(store);

    let urls = match region {
        Region::All => Vec::new(),
        ref region => {
            let urls = reports.group_urlnames(batch_id, region).await?;
            if urls.is_empty() {
                tracing::warn!(batch_id, country = %args.country, "No groups in region");
            }
            urls
        }
    };

    let mut out = open_output(&args.output)?;
    for report in selected {
        let rows: Vec<Value> = if urls.is_empty() && region != Region::All {
            Vec::new()
        } else {
            reports
                .run(report, batch_id, &urls, &args.filter)
                .await?
                .try_collect()
                .await?
        };
        tracing::info!(command = "report", report = %report, batch_id, rows = rows.len(), "Report ready");
        write_rows(&mut out, args.format, report.fields(), &rows)?;
    }
    out.flush()?;
    Ok(())
}

async fn batches(
    store: Arc<SqliteStore>,
    abandon: Option<i64>,
    format: OutputFormat,
) -> Result<()> {
    let audit = BatchAudit::new(store);
    if let Some(id) = abandon {
        audit.abandon_batch(id).await?;
    }
    let rows = audit
        .list_batches()
        .await?
        .iter()
        .map(serde_json::to_value)
        .collect::<serde_json::Result<Vec<_>>>()?;
    let mut stdout = std::io::stdout().lock();
    write_rows(
        &mut stdout,
        format,
        &["batchID", "status", "trialRun", "startTime", "endTime"],
        &rows,
    )?;
    Ok(())
}

// Mugs from flags, file and config may overlap; keep the first occurrence of each.
fn dedup_targets(targets: &mut Vec<String>) {
    let mut seen = HashSet::new();
    targets.retain(|t| seen.insert(t.clone()));
}

/// The explicitly requested batch if it completed, otherwise the current valid one.
async fn resolve_batch(audit: &BatchAudit, requested: Option<i64>) -> Result<i64> {
    let Some(batch_id) = requested else {
        return Ok(audit.current_valid_batch_id().await?);
    };
    match audit.get_batch(batch_id).await? {
        Some(record) if record.status == BatchStatus::Completed => Ok(batch_id),
        Some(record) => anyhow::bail!(
            "batch {batch_id} is {} and cannot be reported on",
            record.status
        ),
        None => Err(mugalyser_core::Error::UnknownBatch(batch_id).into()),
    }
}

fn open_output(path: &Path) -> Result<Box<dyn Write>> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(std::io::stdout()));
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create output file {}", path.display()))?;
    Ok(Box::new(std::io::BufWriter::new(file)))
}

fn parse_day(raw: &str) -> Result<DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("Expected a YYYY-MM-DD date, got {raw:?}"))?;
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .with_context(|| format!("No midnight on {raw:?}"))?;
    Ok(midnight.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_kind() {
        let fetch: anyhow::Error = mugalyser_core::Error::FetchFailed {
            url: "u".into(),
            status: Some(500),
            message: "boom".into(),
        }
        .into();
        assert_eq!(exit_code(&fetch), EXIT_FETCH_FAILED);

        let cancelled: anyhow::Error = mugalyser_core::Error::Cancelled.into();
        assert_eq!(exit_code(&cancelled.context("while ingesting")), EXIT_INTERRUPTED);

        let other = anyhow::anyhow!("bad config");
        assert_eq!(exit_code(&other), EXIT_FAILURE);
        let no_batch: anyhow::Error = mugalyser_core::Error::NoValidBatch.into();
        assert_eq!(exit_code(&no_batch), EXIT_FAILURE);
    }

    #[test]
    fn parses_report_dates_as_utc_midnight() {
        let day = parse_day("2016-09-06").unwrap();
        assert_eq!(day.to_rfc3339(), "2016-09-06T00:00:00+00:00");
        assert!(parse_day("06/09/2016").is_err());
    }

    #[test]
    fn dedup_keeps_first_occurrence_of_each_mug() {
        let mut targets: Vec<String> = [
            "DublinMUG",
            "LondonMUG",
            "ParisMUG",
            "DublinMUG",
            "LondonMUG",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        dedup_targets(&mut targets);
        assert_eq!(targets, vec!["DublinMUG", "LondonMUG", "ParisMUG"]);
    }

    #[tokio::test]
    async fn explicit_batch_must_be_completed() {
        use mugalyser_core::store::MemoryStore;
        use serde_json::json;

        let audit = BatchAudit::new(Arc::new(MemoryStore::new()));
        let done = audit.start_batch(false, json!({})).await.unwrap();
        audit.end_batch(done).await.unwrap();
        let running = audit.start_batch(false, json!({})).await.unwrap();
        let abandoned = audit.start_batch(false, json!({})).await.unwrap();
        audit.abandon_batch(abandoned).await.unwrap();

        assert_eq!(resolve_batch(&audit, None).await.unwrap(), done);
        assert_eq!(resolve_batch(&audit, Some(done)).await.unwrap(), done);
        let err = resolve_batch(&audit, Some(running)).await.unwrap_err();
        assert!(err.to_string().contains("Running"));
        let err = resolve_batch(&audit, Some(abandoned)).await.unwrap_err();
        assert!(err.to_string().contains("Abandoned"));
        let err = resolve_batch(&audit, Some(99)).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<mugalyser_core::Error>(),
            Some(mugalyser_core::Error::UnknownBatch(99))
        ));
    }

    #[test]
    fn cli_parses_ingest_flags() {
        let cli = Cli::try_parse_from([
            "mugalyser",
            "--store",
            "/tmp/s.db",
            "ingest",
            "--phases",
            "groups,members",
            "--mugs",
            "DublinMUG",
            "LondonMUG",
            "--trialrun",
        ])
        .unwrap();
        assert_eq!(cli.store, Some(PathBuf::from("/tmp/s.db")));
        match cli.command {
            Commands::Ingest {
                phases,
                mugs,
                trialrun,
                ..
            } => {
                assert_eq!(phases, vec!["groups", "members"]);
                assert_eq!(mugs, vec!["DublinMUG", "LondonMUG"]);
                assert!(trialrun);
            }
            _ => panic!("expected ingest"),
        }
    }
}
