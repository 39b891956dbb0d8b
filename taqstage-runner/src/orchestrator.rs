//! Single-date and date-range ingestion.
//!
//! Per date: PLAN, then one FETCH and PUBLISH per pending kind, then DONE.
//! Per range: every weekday in turn, each isolated so one failing date never
//! stops the rest.

use crate::config::{ConfigError, IngestConfig};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::io;
use taqstage_core::calendar::{trading_days, CalendarError};
use taqstage_core::writer::WriteError;
use taqstage_core::{
    ColumnarWriter, Compression, DataKind, ExistencePolicy, IngestMode, IngestRequest,
    PartitionStore, Planner, RecordBatch, RunContext, SourceAdapter, SourceError, WriteMode,
};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Calendar(#[from] CalendarError),

    #[error("{kind} on {date}: {source}")]
    Source {
        kind: DataKind,
        date: NaiveDate,
        #[source]
        source: SourceError,
    },

    #[error("writing {kind} for {date}: {source}")]
    Write {
        kind: DataKind,
        date: NaiveDate,
        #[source]
        source: WriteError,
    },

    #[error("resolving symbols for {date}: {source}")]
    Symbols {
        date: NaiveDate,
        #[source]
        source: SourceError,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of one single-date run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateReport {
    pub trade_date: NaiveDate,
    pub run_id: Uuid,
    pub mode: IngestMode,
    pub symbols: usize,
    /// Rows written per requested kind; zero for skipped or unavailable kinds.
    pub rows: BTreeMap<DataKind, usize>,
    pub short_circuit: bool,
    pub skipped_kinds: Vec<DataKind>,
    pub unavailable_kinds: Vec<DataKind>,
    pub deleted: usize,
    pub cleared: usize,
}

impl DateReport {
    pub fn total_rows(&self) -> usize {
        self.rows.values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DayOutcome {
    Completed,
    /// Every requested partition already existed.
    AlreadyIngested,
    /// The availability probe said the source has nothing for this date.
    Unavailable,
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DayEntry {
    pub trade_date: NaiveDate,
    #[serde(flatten)]
    pub outcome: DayOutcome,
    pub report: Option<DateReport>,
}

impl DayEntry {
    pub fn rows(&self, kind: DataKind) -> usize {
        self.report
            .as_ref()
            .and_then(|r| r.rows.get(&kind).copied())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeReport {
    pub run_id: Uuid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days: Vec<DayEntry>,
}

impl RangeReport {
    /// Rows written per kind across every day.
    pub fn totals(&self) -> BTreeMap<DataKind, usize> {
        let mut totals = BTreeMap::new();
        for report in self.days.iter().filter_map(|d| d.report.as_ref()) {
            for (kind, rows) in &report.rows {
                *totals.entry(*kind).or_insert(0) += rows;
            }
        }
        totals
    }

    pub fn total_rows(&self) -> usize {
        self.totals().values().sum()
    }

    pub fn failed_days(&self) -> Vec<NaiveDate> {
        self.days
            .iter()
            .filter(|d| matches!(d.outcome, DayOutcome::Failed { .. }))
            .map(|d| d.trade_date)
            .collect()
    }
}

/// An inclusive date range request.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeRequest {
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// `None` resolves symbols per date from the source or a reference store.
    pub symbols: Option<Vec<String>>,
    pub kinds: Vec<DataKind>,
    pub mode: IngestMode,
    pub check_availability: bool,
}

/// Wires Planner, source adapter and writer together for one invocation.
pub struct Orchestrator<S> {
    store: PartitionStore,
    source: S,
    ctx: RunContext,
    write_mode: WriteMode,
    compression: Compression,
    reference: Option<PartitionStore>,
}

impl<S: SourceAdapter> Orchestrator<S> {
    pub fn new(store: PartitionStore, source: S, ctx: RunContext) -> Self {
        Self {
            store,
            source,
            ctx,
            write_mode: WriteMode::default(),
            compression: Compression::default(),
            reference: None,
        }
    }

    pub fn from_config(config: &IngestConfig, source: S) -> Result<Self, ConfigError> {
        let ctx = RunContext::new(config.timezone()?);
        let reference = config
            .extract
            .reference_root
            .as_ref()
            .map(|root| PartitionStore::new(root, true, ExistencePolicy::Lenient));
        Ok(Self {
            store: config.partition_store(),
            source,
            ctx,
            write_mode: config.store.write_mode,
            compression: config.compression()?,
            reference,
        })
    }

    pub fn with_write_mode(mut self, mode: WriteMode) -> Self {
        self.write_mode = mode;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Store whose trades symbols are used when nothing else supplies a universe.
    pub fn with_reference_store(mut self, reference: PartitionStore) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.ctx.run_id
    }

    pub fn store(&self) -> &PartitionStore {
        &self.store
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Plan, fetch and publish every pending kind for one date.
    ///
    /// Unavailable or unsupported kinds are warned about and recorded with
    /// zero rows. Write failures abort the date.
    pub fn run_date(&mut self, request: &IngestRequest) -> Result<DateReport, RunError> {
        if request.kinds.is_empty() {
            return Err(RunError::Validation("no data kinds requested".into()));
        }
        let date = request.trade_date;
        info!(
            %date,
            mode = %request.mode,
            symbols = request.symbols.len(),
            run_id = %self.ctx.run_id,
            source = self.source.name(),
            "planning"
        );

        let plan = Planner::plan(&self.store, request);
        let mut report = DateReport {
            trade_date: date,
            run_id: self.ctx.run_id,
            mode: request.mode,
            symbols: request.symbols.len(),
            rows: request.kinds.iter().map(|&k| (k, 0)).collect(),
            short_circuit: plan.short_circuit,
            skipped_kinds: plan.skipped_kinds(),
            unavailable_kinds: Vec::new(),
            deleted: plan.deleted,
            cleared: plan.cleared,
        };
        if plan.short_circuit {
            return Ok(report);
        }

        let pending: Vec<(DataKind, Vec<String>)> =
            plan.pending().map(|(k, s)| (k, s.to_vec())).collect();
        for (kind, symbols) in pending {
            match self.fetch_and_publish(kind, date, &symbols) {
                Ok(rows) => {
                    report.rows.insert(kind, rows);
                }
                Err(RunError::Source { source, .. }) if source.is_unavailable() => {
                    warn!(%kind, %date, error = %source, "source has no data, recording zero rows");
                    report.unavailable_kinds.push(kind);
                }
                Err(e) => return Err(e),
            }
        }

        for (kind, rows) in &report.rows {
            info!(%date, %kind, rows, "kind summary");
        }
        info!(%date, total = report.total_rows(), "date finished");
        Ok(report)
    }

    fn fetch_and_publish(
        &mut self,
        kind: DataKind,
        date: NaiveDate,
        symbols: &[String],
    ) -> Result<usize, RunError> {
        info!(%kind, %date, symbols = symbols.len(), "fetching");
        let keep: HashSet<String> = symbols.iter().cloned().collect();
        let ctx = &self.ctx;
        let stream = self
            .source
            .extract(kind, date, symbols)
            .map_err(|source| RunError::Source { kind, date, source })?;
        let batches = stream
            .map(|raw| ctx.enrich(date, raw).retain_symbols(&keep))
            .filter(|batch: &RecordBatch| !batch.is_empty());

        let writer = ColumnarWriter::new(&self.store, self.compression);
        let written = match self.write_mode {
            WriteMode::Streaming => writer.write_streaming(kind, date, batches),
            WriteMode::Buffered => writer.write_buffered(kind, date, batches.collect()),
        };
        written.map_err(|source| RunError::Write { kind, date, source })
    }

    /// Explicit list, else the source's default universe, else the
    /// reference store's trades symbols for that date.
    pub fn resolve_symbols(
        &mut self,
        date: NaiveDate,
        explicit: Option<&[String]>,
    ) -> Result<Vec<String>, RunError> {
        if let Some(symbols) = explicit {
            return Ok(symbols.to_vec());
        }
        let from_source = match self.source.default_symbols(date) {
            Ok(symbols) if !symbols.is_empty() => return Ok(symbols),
            Ok(_) => None,
            Err(e) => Some(e),
        };
        if let Some(reference) = &self.reference {
            let symbols = reference.list_symbols(DataKind::Trades, date)?;
            if !symbols.is_empty() {
                info!(%date, count = symbols.len(), root = %reference.root().display(), "symbols from reference store");
                return Ok(symbols);
            }
        }
        Err(match from_source {
            Some(source) => RunError::Symbols { date, source },
            None => RunError::Validation(format!("no symbols available for {date}")),
        })
    }

    /// Run every weekday in `[start, end]`.
    ///
    /// Fails only on an invalid request; per-date errors are recorded.
    pub fn run_range(&mut self, range: &RangeRequest) -> Result<RangeReport, RunError> {
        if range.start > range.end {
            return Err(RunError::Validation(format!(
                "start {} is after end {}",
                range.start, range.end
            )));
        }
        if range.kinds.is_empty() {
            return Err(RunError::Validation("no data kinds requested".into()));
        }
        let days = trading_days(range.start, range.end)?;
        info!(start = %range.start, end = %range.end, days = days.len(), run_id = %self.ctx.run_id, "range started");

        let mut entries = Vec::with_capacity(days.len());
        for (i, date) in days.iter().copied().enumerate() {
            info!(%date, day = i + 1, of = days.len(), "processing date");
            let entry = self.run_day(date, range);
            if let DayOutcome::Failed { error } = &entry.outcome {
                error!(%date, %error, "date failed, continuing with the next one");
            }
            entries.push(entry);
        }

        let report = RangeReport {
            run_id: self.ctx.run_id,
            start: range.start,
            end: range.end,
            days: entries,
        };
        for (kind, rows) in report.totals() {
            info!(%kind, rows, "range total");
        }
        let failed = report.failed_days();
        if !failed.is_empty() {
            warn!(count = failed.len(), dates = ?failed, "some dates failed");
        }
        Ok(report)
    }

    fn run_day(&mut self, date: NaiveDate, range: &RangeRequest) -> DayEntry {
        let failed = |error: String| DayEntry {
            trade_date: date,
            outcome: DayOutcome::Failed { error },
            report: None,
        };

        if range.check_availability {
            // Unsupported kinds end up in `unavailable_kinds`; they say nothing about the date.
            let checked: Vec<DataKind> = range
                .kinds
                .iter()
                .copied()
                .filter(|&kind| self.source.supports(kind))
                .collect();
            let available = if checked.is_empty() {
                Ok(false)
            } else {
                self.source.is_available(date, &checked)
            };
            match available {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%date, source = self.source.name(), "no data available, skipping date");
                    return DayEntry {
                        trade_date: date,
                        outcome: DayOutcome::Unavailable,
                        report: None,
                    };
                }
                Err(e) => return failed(format!("availability check: {e}")),
            }
        }

        let symbols = match self.resolve_symbols(date, range.symbols.as_deref()) {
            Ok(symbols) => symbols,
            Err(e) => return failed(e.to_string()),
        };
        let request = IngestRequest {
            trade_date: date,
            symbols,
            kinds: range.kinds.clone(),
            mode: range.mode,
        };
        match self.run_date(&request) {
            Ok(report) => DayEntry {
                trade_date: date,
                outcome: if report.short_circuit {
                    DayOutcome::AlreadyIngested
                } else {
                    DayOutcome::Completed
                },
                report: Some(report),
            },
            Err(e) => failed(e.to_string()),
        }
    }
}
