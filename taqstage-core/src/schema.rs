//! Row schema for the three TAQ datasets.
//!
//! Each kind is a fixed struct: fields every provider fills are plain values,
//! provider-dependent fields are `Option`. The writer only relies on
//! [`required_columns`] plus the five derived columns, never on whichever
//! columns a provider happened to send.

use crate::domain::DataKind;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

/// Derived columns attached to every written row, in output order.
pub const DERIVED_COLUMNS: [&str; 5] = [
    "trade_date",
    "symbol",
    "ts_event",
    "extract_run_id",
    "ingest_ts",
];

const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("missing required column: {0}")]
    MissingColumn(String),

    #[error("type mismatch in column {column}: expected {expected:?}, got {actual:?}")]
    TypeMismatch {
        column: String,
        expected: DataType,
        actual: DataType,
    },

    #[error("cannot combine {left} rows with {right} rows")]
    KindMismatch { left: DataKind, right: DataKind },

    #[error("batch columns disagree in length: {rows} rows, {derived} derived values")]
    RaggedBatch { rows: usize, derived: usize },

    #[error("timestamp out of nanosecond range: {0}")]
    TimestampOutOfRange(DateTime<Utc>),

    #[error("polars: {0}")]
    Polars(#[from] PolarsError),
}

/// Fields that locate a row in time and identify its instrument.
pub trait TaqRow {
    fn date(&self) -> NaiveDate;
    fn time_m(&self) -> NaiveTime;
    fn time_m_nano(&self) -> Option<i64>;
    fn sym_root(&self) -> &str;
    fn sym_suffix(&self) -> Option<&str>;
}

/// One consolidated trade (`ctm_*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRow {
    pub date: NaiveDate,
    pub time_m: NaiveTime,
    pub time_m_nano: Option<i64>,
    pub part_time: Option<NaiveTime>,
    pub trf_time: Option<NaiveTime>,
    pub sym_root: String,
    pub sym_suffix: Option<String>,
    pub ex: Option<String>,
    pub price: f64,
    pub size: i64,
    pub tr_corr: Option<String>,
    pub tr_id: Option<String>,
    pub tr_rf: Option<String>,
    pub tr_scond: Option<String>,
    pub tr_seqnum: Option<i64>,
    pub tr_source: Option<String>,
    pub tr_stop_ind: Option<String>,
    pub tte_ind: Option<String>,
}

/// One exchange quote (`cqm_*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRow {
    pub date: NaiveDate,
    pub time_m: NaiveTime,
    pub time_m_nano: Option<i64>,
    pub sym_root: String,
    pub sym_suffix: Option<String>,
    pub ex: Option<String>,
    pub bid: f64,
    pub bidsiz: i64,
    pub ask: f64,
    pub asksiz: i64,
    pub qu_cond: Option<String>,
    pub qu_seqnum: Option<i64>,
    pub qu_cancel: Option<String>,
    pub qu_source: Option<String>,
}

/// One national best bid and offer update (`complete_nbbo_*`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NbboRow {
    pub date: NaiveDate,
    pub time_m: NaiveTime,
    pub time_m_nano: Option<i64>,
    pub sym_root: String,
    pub sym_suffix: Option<String>,
    pub best_bid: f64,
    pub best_bidsiz: i64,
    pub best_ask: f64,
    pub best_asksiz: i64,
    pub best_bidex: Option<String>,
    pub best_askex: Option<String>,
    pub nbbo_qu_cond: Option<String>,
    pub secstat_ind: Option<String>,
    pub luld_indicator: Option<String>,
    pub qu_source: Option<String>,
}

macro_rules! impl_taq_row {
    ($($ty:ty),*) => {
        $(
            impl TaqRow for $ty {
                fn date(&self) -> NaiveDate {
                    self.date
                }
                fn time_m(&self) -> NaiveTime {
                    self.time_m
                }
                fn time_m_nano(&self) -> Option<i64> {
                    self.time_m_nano
                }
                fn sym_root(&self) -> &str {
                    &self.sym_root
                }
                fn sym_suffix(&self) -> Option<&str> {
                    self.sym_suffix.as_deref()
                }
            }
        )*
    };
}

impl_taq_row!(TradeRow, QuoteRow, NbboRow);

/// Provider-native rows of a single kind, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRows {
    Trades(Vec<TradeRow>),
    Quotes(Vec<QuoteRow>),
    Nbbo(Vec<NbboRow>),
}

impl RawRows {
    pub fn empty(kind: DataKind) -> Self {
        match kind {
            DataKind::Trades => RawRows::Trades(Vec::new()),
            DataKind::Quotes => RawRows::Quotes(Vec::new()),
            DataKind::Nbbo => RawRows::Nbbo(Vec::new()),
        }
    }

    pub fn kind(&self) -> DataKind {
        match self {
            RawRows::Trades(_) => DataKind::Trades,
            RawRows::Quotes(_) => DataKind::Quotes,
            RawRows::Nbbo(_) => DataKind::Nbbo,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawRows::Trades(r) => r.len(),
            RawRows::Quotes(r) => r.len(),
            RawRows::Nbbo(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = &dyn TaqRow> + '_> {
        match self {
            RawRows::Trades(r) => Box::new(r.iter().map(|x| x as &dyn TaqRow)),
            RawRows::Quotes(r) => Box::new(r.iter().map(|x| x as &dyn TaqRow)),
            RawRows::Nbbo(r) => Box::new(r.iter().map(|x| x as &dyn TaqRow)),
        }
    }

    /// Rows at `indices`, in that order.
    pub fn take(&self, indices: &[usize]) -> RawRows {
        fn pick<T: Clone>(rows: &[T], indices: &[usize]) -> Vec<T> {
            indices.iter().filter_map(|&i| rows.get(i).cloned()).collect()
        }
        match self {
            RawRows::Trades(r) => RawRows::Trades(pick(r, indices)),
            RawRows::Quotes(r) => RawRows::Quotes(pick(r, indices)),
            RawRows::Nbbo(r) => RawRows::Nbbo(pick(r, indices)),
        }
    }

    pub fn append(&mut self, other: RawRows) -> Result<(), SchemaError> {
        match (self, other) {
            (RawRows::Trades(a), RawRows::Trades(b)) => a.extend(b),
            (RawRows::Quotes(a), RawRows::Quotes(b)) => a.extend(b),
            (RawRows::Nbbo(a), RawRows::Nbbo(b)) => a.extend(b),
            (left, right) => {
                return Err(SchemaError::KindMismatch {
                    left: left.kind(),
                    right: right.kind(),
                })
            }
        }
        Ok(())
    }
}

/// Enriched rows ready for the writer: native rows plus the derived columns.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordBatch {
    pub trade_date: NaiveDate,
    pub extract_run_id: Uuid,
    pub symbols: Vec<String>,
    pub ts_event: Vec<DateTime<Utc>>,
    pub ingest_ts: Vec<DateTime<Utc>>,
    pub rows: RawRows,
}

impl RecordBatch {
    pub fn kind(&self) -> DataKind {
        self.rows.kind()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn take(&self, indices: &[usize]) -> RecordBatch {
        let pick = |v: &[DateTime<Utc>]| -> Vec<DateTime<Utc>> {
            indices.iter().filter_map(|&i| v.get(i).copied()).collect()
        };
        RecordBatch {
            trade_date: self.trade_date,
            extract_run_id: self.extract_run_id,
            symbols: indices
                .iter()
                .filter_map(|&i| self.symbols.get(i).cloned())
                .collect(),
            ts_event: pick(&self.ts_event),
            ingest_ts: pick(&self.ingest_ts),
            rows: self.rows.take(indices),
        }
    }

    /// Drop rows whose canonical symbol is not in `keep`.
    pub fn retain_symbols(self, keep: &HashSet<String>) -> RecordBatch {
        let indices: Vec<usize> = self
            .symbols
            .iter()
            .enumerate()
            .filter(|(_, s)| keep.contains(s.as_str()))
            .map(|(i, _)| i)
            .collect();
        if indices.len() == self.len() {
            return self;
        }
        self.take(&indices)
    }

    /// One sub-batch per canonical symbol, ordered by symbol.
    pub fn split_by_symbol(&self) -> BTreeMap<String, RecordBatch> {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, sym) in self.symbols.iter().enumerate() {
            groups.entry(sym.clone()).or_default().push(i);
        }
        groups
            .into_iter()
            .map(|(sym, idx)| (sym, self.take(&idx)))
            .collect()
    }

    /// Concatenate batches of one kind. `None` when there is nothing to concatenate.
    pub fn concat(batches: Vec<RecordBatch>) -> Result<Option<RecordBatch>, SchemaError> {
        let mut iter = batches.into_iter();
        let Some(mut acc) = iter.next() else {
            return Ok(None);
        };
        for batch in iter {
            acc.rows.append(batch.rows)?;
            acc.symbols.extend(batch.symbols);
            acc.ts_event.extend(batch.ts_event);
            acc.ingest_ts.extend(batch.ingest_ts);
        }
        Ok(Some(acc))
    }

    /// Build the Parquet-ready frame: native columns followed by the derived ones.
    pub fn to_dataframe(&self) -> Result<DataFrame, SchemaError> {
        let n = self.len();
        for derived in [self.symbols.len(), self.ts_event.len(), self.ingest_ts.len()] {
            if derived != n {
                return Err(SchemaError::RaggedBatch { rows: n, derived });
            }
        }

        let mut columns = match &self.rows {
            RawRows::Trades(rows) => trade_columns(rows)?,
            RawRows::Quotes(rows) => quote_columns(rows)?,
            RawRows::Nbbo(rows) => nbbo_columns(rows)?,
        };

        let run_id = self.extract_run_id.to_string();
        columns.push(date_column("trade_date", vec![self.trade_date; n])?);
        columns.push(Column::new("symbol".into(), self.symbols.clone()));
        columns.push(utc_column("ts_event", &self.ts_event)?);
        columns.push(Column::new("extract_run_id".into(), vec![run_id; n]));
        columns.push(utc_column("ingest_ts", &self.ingest_ts)?);

        Ok(DataFrame::new(columns)?)
    }
}

// ── Column builders ─────────────────────────────────────────────────

fn days_since_epoch(d: NaiveDate) -> i32 {
    d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

fn nanos_since_midnight(t: NaiveTime) -> i64 {
    i64::from(t.num_seconds_from_midnight()) * 1_000_000_000 + i64::from(t.nanosecond())
}

fn date_column(name: &str, dates: Vec<NaiveDate>) -> Result<Column, SchemaError> {
    let days: Vec<i32> = dates.into_iter().map(days_since_epoch).collect();
    Ok(Column::new(name.into(), days).cast(&DataType::Date)?)
}

fn time_column(name: &str, times: Vec<NaiveTime>) -> Result<Column, SchemaError> {
    let ns: Vec<i64> = times.into_iter().map(nanos_since_midnight).collect();
    Ok(Column::new(name.into(), ns).cast(&DataType::Time)?)
}

fn opt_time_column(name: &str, times: Vec<Option<NaiveTime>>) -> Result<Column, SchemaError> {
    let ns: Vec<Option<i64>> = times
        .into_iter()
        .map(|t| t.map(nanos_since_midnight))
        .collect();
    Ok(Column::new(name.into(), ns).cast(&DataType::Time)?)
}

fn utc_dtype() -> DataType {
    DataType::Datetime(TimeUnit::Nanoseconds, Some("UTC".into()))
}

fn utc_column(name: &str, stamps: &[DateTime<Utc>]) -> Result<Column, SchemaError> {
    let ns = stamps
        .iter()
        .map(|ts| {
            ts.timestamp_nanos_opt()
                .ok_or(SchemaError::TimestampOutOfRange(*ts))
        })
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(Column::new(name.into(), ns).cast(&utc_dtype())?)
}

macro_rules! col_of {
    ($rows:expr, $field:ident) => {
        Column::new(
            stringify!($field).into(),
            $rows.iter().map(|r| r.$field.clone()).collect::<Vec<_>>(),
        )
    };
}

fn trade_columns(rows: &[TradeRow]) -> Result<Vec<Column>, SchemaError> {
    Ok(vec![
        date_column("date", rows.iter().map(|r| r.date).collect())?,
        time_column("time_m", rows.iter().map(|r| r.time_m).collect())?,
        col_of!(rows, time_m_nano),
        opt_time_column("part_time", rows.iter().map(|r| r.part_time).collect())?,
        opt_time_column("trf_time", rows.iter().map(|r| r.trf_time).collect())?,
        col_of!(rows, sym_root),
        col_of!(rows, sym_suffix),
        col_of!(rows, ex),
        col_of!(rows, price),
        col_of!(rows, size),
        col_of!(rows, tr_corr),
        col_of!(rows, tr_id),
        col_of!(rows, tr_rf),
        col_of!(rows, tr_scond),
        col_of!(rows, tr_seqnum),
        col_of!(rows, tr_source),
        col_of!(rows, tr_stop_ind),
        col_of!(rows, tte_ind),
    ])
}

fn quote_columns(rows: &[QuoteRow]) -> Result<Vec<Column>, SchemaError> {
    Ok(vec![
        date_column("date", rows.iter().map(|r| r.date).collect())?,
        time_column("time_m", rows.iter().map(|r| r.time_m).collect())?,
        col_of!(rows, time_m_nano),
        col_of!(rows, sym_root),
        col_of!(rows, sym_suffix),
        col_of!(rows, ex),
        col_of!(rows, bid),
        col_of!(rows, bidsiz),
        col_of!(rows, ask),
        col_of!(rows, asksiz),
        col_of!(rows, qu_cond),
        col_of!(rows, qu_seqnum),
        col_of!(rows, qu_cancel),
        col_of!(rows, qu_source),
    ])
}

fn nbbo_columns(rows: &[NbboRow]) -> Result<Vec<Column>, SchemaError> {
    Ok(vec![
        date_column("date", rows.iter().map(|r| r.date).collect())?,
        time_column("time_m", rows.iter().map(|r| r.time_m).collect())?,
        col_of!(rows, time_m_nano),
        col_of!(rows, sym_root),
        col_of!(rows, sym_suffix),
        col_of!(rows, best_bid),
        col_of!(rows, best_bidsiz),
        col_of!(rows, best_ask),
        col_of!(rows, best_asksiz),
        col_of!(rows, best_bidex),
        col_of!(rows, best_askex),
        col_of!(rows, nbbo_qu_cond),
        col_of!(rows, secstat_ind),
        col_of!(rows, luld_indicator),
        col_of!(rows, qu_source),
    ])
}

// ── Declared schema ─────────────────────────────────────────────────

/// Native columns every provider must fill for `kind`.
pub fn required_columns(kind: DataKind) -> &'static [&'static str] {
    match kind {
        DataKind::Trades => &["date", "time_m", "time_m_nano", "sym_root", "price", "size"],
        DataKind::Quotes => &[
            "date",
            "time_m",
            "time_m_nano",
            "sym_root",
            "bid",
            "bidsiz",
            "ask",
            "asksiz",
        ],
        DataKind::Nbbo => &[
            "date",
            "time_m",
            "time_m_nano",
            "sym_root",
            "best_bid",
            "best_bidsiz",
            "best_ask",
            "best_asksiz",
        ],
    }
}

fn native_dtype(column: &str) -> DataType {
    match column {
        "date" => DataType::Date,
        "time_m" => DataType::Time,
        "sym_root" => DataType::String,
        "time_m_nano" | "size" | "bidsiz" | "asksiz" | "best_bidsiz" | "best_asksiz" => {
            DataType::Int64
        }
        _ => DataType::Float64,
    }
}

/// Types of the required and derived columns.
pub fn schema(kind: DataKind) -> Schema {
    let mut fields: Vec<Field> = required_columns(kind)
        .iter()
        .map(|c| Field::new((*c).into(), native_dtype(c)))
        .collect();
    fields.extend([
        Field::new("trade_date".into(), DataType::Date),
        Field::new("symbol".into(), DataType::String),
        Field::new("ts_event".into(), utc_dtype()),
        Field::new("extract_run_id".into(), DataType::String),
        Field::new("ingest_ts".into(), utc_dtype()),
    ]);
    Schema::from_iter(fields)
}

/// Check that `df` carries every required and derived column with the declared type.
pub fn validate(kind: DataKind, df: &DataFrame) -> Result<(), SchemaError> {
    let expected = schema(kind);
    let actual = df.schema();
    for field in expected.iter_fields() {
        let actual_dtype = actual
            .get(field.name())
            .ok_or_else(|| SchemaError::MissingColumn(field.name().to_string()))?;
        if actual_dtype != field.dtype() {
            return Err(SchemaError::TypeMismatch {
                column: field.name().to_string(),
                expected: field.dtype().clone(),
                actual: actual_dtype.clone(),
            });
        }
    }
    Ok(())
}
