//! taqstage CLI: extract, status and symbol listing.
//!
//! Commands:
//! - `extract`: ingest one date or a weekday range into the partition store
//! - `status`: per-partition state and per-kind fingerprint for a date
//! - `symbols`: symbols present in the store for a date and kind

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use taqstage_core::source::database::PgConnectOptions;
use taqstage_core::source::{
    ChainedSource, CsvSource, DatabaseSource, HttpSource, PostgresClient,
};
use taqstage_core::{DataKind, IngestMode, PartitionState, SourceAdapter};
use taqstage_runner::credentials::{self, Credentials};
use taqstage_runner::symbols::parse_symbol_arg;
use taqstage_runner::{IngestConfig, Orchestrator, RangeReport, RangeRequest};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "taqstage", about = "Partitioned, idempotent TAQ tick data ingestion")]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG).
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum SourceChoice {
    /// WRDS PostgreSQL.
    Wrds,
    /// Alpaca market data REST API.
    Alpaca,
    /// Local CSV exports.
    Csv,
    /// CSV if configured, then WRDS, then Alpaca.
    Auto,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest TAQ data for a date or an inclusive weekday range.
    Extract {
        /// Path to the TOML config file.
        #[arg(long)]
        config: PathBuf,

        #[arg(long, value_enum, default_value_t = SourceChoice::Auto)]
        source: SourceChoice,

        /// Single trade date (YYYY-MM-DD).
        #[arg(long, conflicts_with_all = ["start", "end"])]
        date: Option<NaiveDate>,

        /// Range start (YYYY-MM-DD), inclusive.
        #[arg(long, requires = "end")]
        start: Option<NaiveDate>,

        /// Range end (YYYY-MM-DD), inclusive.
        #[arg(long, requires = "start")]
        end: Option<NaiveDate>,

        /// Comma-separated symbols or a file with one symbol per line.
        #[arg(long)]
        symbols: Option<String>,

        /// Data kinds: trades, quotes, nbbo. Defaults to `[extract].types`.
        #[arg(long, num_args = 1..)]
        types: Option<Vec<String>>,

        /// Delete the targeted partitions and refetch them.
        #[arg(long, default_value_t = false, conflicts_with = "resume")]
        overwrite: bool,

        /// Fetch only kinds not already complete.
        #[arg(long, default_value_t = false)]
        resume: bool,

        /// Do not probe the source before each date.
        #[arg(long, default_value_t = false)]
        skip_availability: bool,

        /// Write the run report as JSON to this file.
        #[arg(long)]
        report_json: Option<PathBuf>,
    },
    /// Show partition states and fingerprints for a date.
    Status {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        date: NaiveDate,

        /// Symbols to check. Defaults to those present in the store.
        #[arg(long)]
        symbols: Option<String>,

        #[arg(long, num_args = 1..)]
        types: Option<Vec<String>>,
    },
    /// List symbols present in the store for a date.
    Symbols {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        date: NaiveDate,

        #[arg(long = "type", default_value = "trades")]
        kind: DataKind,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);

    match cli.command {
        Commands::Extract {
            config,
            source,
            date,
            start,
            end,
            symbols,
            types,
            overwrite,
            resume,
            skip_availability,
            report_json,
        } => {
            let (start, end) = match (date, start, end) {
                (Some(d), _, _) => (d, d),
                (None, Some(s), Some(e)) => (s, e),
                _ => bail!("either --date or both --start and --end are required"),
            };
            let mode = if overwrite {
                IngestMode::Overwrite
            } else if resume {
                IngestMode::Resume
            } else {
                IngestMode::Normal
            };
            run_extract(ExtractArgs {
                config_path: config,
                source,
                start,
                end,
                symbols,
                types,
                mode,
                check_availability: !skip_availability,
                report_json,
            })
        }
        Commands::Status {
            config,
            date,
            symbols,
            types,
        } => run_status(&config, date, symbols.as_deref(), types),
        Commands::Symbols { config, date, kind } => run_symbols(&config, date, kind),
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

struct ExtractArgs {
    config_path: PathBuf,
    source: SourceChoice,
    start: NaiveDate,
    end: NaiveDate,
    symbols: Option<String>,
    types: Option<Vec<String>>,
    mode: IngestMode,
    check_availability: bool,
    report_json: Option<PathBuf>,
}

fn run_extract(args: ExtractArgs) -> Result<()> {
    let config = IngestConfig::load(&args.config_path)?;
    let kinds = resolve_kinds(&config, args.types)?;
    let symbols = resolve_symbols(&config, args.symbols.as_deref())?;
    let creds = credentials::resolve(Some(args.config_path.as_path()), &config.credentials)?;

    let source = build_source(args.source, &config, &creds)?;
    info!(source = source.name(), kinds = ?kinds, "source ready");
    let mut orchestrator = Orchestrator::from_config(&config, source)?;

    let report = orchestrator.run_range(&RangeRequest {
        start: args.start,
        end: args.end,
        symbols,
        kinds,
        mode: args.mode,
        check_availability: args.check_availability,
    })?;

    print_summary(&report);
    if let Some(path) = args.report_json {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing report to {}", path.display()))?;
        println!("Report saved to: {}", path.display());
    }
    Ok(())
}

fn resolve_kinds(config: &IngestConfig, types: Option<Vec<String>>) -> Result<Vec<DataKind>> {
    match types {
        Some(names) => {
            let kinds = taqstage_core::domain::parse_kinds(names.as_slice())?;
            if kinds.is_empty() {
                bail!("--types must name at least one of trades, quotes, nbbo");
            }
            Ok(kinds)
        }
        None => Ok(config.kinds()?),
    }
}

/// `--symbols`, then `[extract].symbols`, then `[extract].symbols_file`.
/// `None` lets the orchestrator resolve a universe per date.
fn resolve_symbols(config: &IngestConfig, arg: Option<&str>) -> Result<Option<Vec<String>>> {
    let symbols = if let Some(arg) = arg {
        parse_symbol_arg(arg).with_context(|| format!("reading symbols from {arg}"))?
    } else if !config.extract.symbols.is_empty() {
        taqstage_runner::symbols::normalize(&config.extract.symbols)
    } else if let Some(path) = &config.extract.symbols_file {
        taqstage_runner::symbols::read_symbol_file(path)
            .with_context(|| format!("reading symbols from {}", path.display()))?
    } else {
        return Ok(None);
    };
    if symbols.is_empty() {
        bail!("symbol list is empty");
    }
    Ok(Some(symbols))
}

fn build_source(
    choice: SourceChoice,
    config: &IngestConfig,
    creds: &Credentials,
) -> Result<Box<dyn SourceAdapter>> {
    match choice {
        SourceChoice::Wrds => Ok(Box::new(connect_wrds(config, creds)?)),
        SourceChoice::Alpaca => {
            let (key, secret) = creds.alpaca()?;
            let source =
                HttpSource::connect(config.http_source_config(key, secret)?, config.http.retry.policy())?;
            Ok(Box::new(source))
        }
        SourceChoice::Csv => match config.csv_source_config() {
            Some(csv) => Ok(Box::new(CsvSource::new(csv))),
            None => bail!("--source csv requires [csv].root in the config"),
        },
        SourceChoice::Auto => {
            let mut sources: Vec<Box<dyn SourceAdapter>> = Vec::new();
            if let Some(csv) = config.csv_source_config() {
                sources.push(Box::new(CsvSource::new(csv)));
            }
            if creds.wrds_username.is_some() {
                match connect_wrds(config, creds) {
                    Ok(source) => sources.push(Box::new(source)),
                    Err(e) => warn!(error = %e, "WRDS unavailable, continuing without it"),
                }
            }
            if let Ok((key, secret)) = creds.alpaca() {
                let source = HttpSource::connect(
                    config.http_source_config(key, secret)?,
                    config.http.retry.policy(),
                )?;
                sources.push(Box::new(source));
            }
            if sources.is_empty() {
                bail!("no source configured: set [csv].root, WRDS or Alpaca credentials");
            }
            Ok(Box::new(ChainedSource::new(sources)))
        }
    }
}

fn connect_wrds(
    config: &IngestConfig,
    creds: &Credentials,
) -> Result<DatabaseSource<PostgresClient>> {
    let (user, password) = creds.wrds()?;
    let opts: PgConnectOptions = config.database_connect_options(&user, password);
    let client = PostgresClient::connect(&opts)?;
    Ok(DatabaseSource::new(client, config.database_source_config()))
}

fn run_status(
    config_path: &Path,
    date: NaiveDate,
    symbols: Option<&str>,
    types: Option<Vec<String>>,
) -> Result<()> {
    let config = IngestConfig::load(config_path)?;
    let kinds = resolve_kinds(&config, types)?;
    let explicit = symbols.map(parse_symbol_arg).transpose()?;
    let store = config.partition_store();

    println!("Store: {}", store.root().display());
    println!("Date:  {date}");
    println!();
    println!("{:<8} {:<12} {:<11}", "Kind", "Symbol", "State");
    println!("{}", "-".repeat(33));
    for &kind in &kinds {
        let symbols = match &explicit {
            Some(list) => list.clone(),
            None => store.list_symbols(kind, date)?,
        };
        if symbols.is_empty() || !store.partition_by_symbol() {
            let state = store.state(kind, date, None)?;
            println!("{:<8} {:<12} {:<11}", kind, "(all)", state_label(state));
        } else {
            for sym in &symbols {
                let state = store.state(kind, date, Some(sym))?;
                println!("{:<8} {:<12} {:<11}", kind, sym, state_label(state));
            }
        }
    }

    println!();
    for &kind in &kinds {
        match store.fingerprint(kind, date)? {
            Some(fp) => println!("{kind:<8} fingerprint {fp}"),
            None => {
                let (before, after) = store.nearest_dates(kind, date)?;
                let show = |d: Option<NaiveDate>| d.map_or_else(|| "-".to_string(), |d| d.to_string());
                println!("{kind:<8} (no data; nearest {} / {})", show(before), show(after));
            }
        }
        let dates = store.list_dates(kind)?;
        if let (Some(first), Some(last)) = (dates.first(), dates.last()) {
            println!("{kind:<8} {} date(s) on disk, {first} to {last}", dates.len());
        }
    }
    Ok(())
}

fn state_label(state: PartitionState) -> &'static str {
    match state {
        PartitionState::Absent => "absent",
        PartitionState::Incomplete => "incomplete",
        PartitionState::Complete => "complete",
    }
}

fn run_symbols(config_path: &Path, date: NaiveDate, kind: DataKind) -> Result<()> {
    let config = IngestConfig::load(config_path)?;
    let store = config.partition_store();
    let symbols = store.list_symbols(kind, date)?;
    if symbols.is_empty() {
        println!("No {kind} data for {date} in {}", store.root().display());
        return Ok(());
    }
    for sym in &symbols {
        println!("{sym}");
    }
    eprintln!("{} symbol(s)", symbols.len());
    Ok(())
}

fn print_summary(report: &RangeReport) {
    println!();
    println!("=== Extract Result ===");
    println!("Run:      {}", report.run_id);
    println!("Period:   {} to {}", report.start, report.end);
    println!("Days:     {}", report.days.len());
    println!();
    println!("{:<12} {:<17} {:>10}", "Date", "Status", "Rows");
    println!("{}", "-".repeat(41));
    for day in &report.days {
        let status = match &day.outcome {
            taqstage_runner::DayOutcome::Completed => "completed",
            taqstage_runner::DayOutcome::AlreadyIngested => "already ingested",
            taqstage_runner::DayOutcome::Unavailable => "unavailable",
            taqstage_runner::DayOutcome::Failed { .. } => "FAILED",
        };
        let rows = day.report.as_ref().map(|r| r.total_rows()).unwrap_or(0);
        println!("{:<12} {:<17} {:>10}", day.trade_date, status, rows);
    }
    println!();
    for (kind, rows) in report.totals() {
        println!("{kind:<8} {rows:>12} rows");
    }
    for day in &report.days {
        if let taqstage_runner::DayOutcome::Failed { error } = &day.outcome {
            println!("WARNING: {} failed: {error}", day.trade_date);
        }
    }
    if report.days.is_empty() {
        println!("WARNING: no weekdays in {} to {}", report.start, report.end);
    }
    println!();
}
