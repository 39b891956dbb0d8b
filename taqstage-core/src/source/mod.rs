//! Source adapters: where raw TAQ rows come from.
//!
//! Every adapter yields provider-native [`RawRows`] lazily and processes
//! symbols in fixed-size groups. A failing group is logged and skipped so one
//! bad slice never aborts the rest of the date.

pub mod chain;
pub mod csv;
pub mod database;
pub mod http;
pub mod retry;

pub use chain::ChainedSource;
pub use self::csv::{CsvSource, CsvSourceConfig};
pub use database::{DatabaseSource, DatabaseSourceConfig, PostgresClient, SqlClient, SqlError};
pub use http::{HttpSource, HttpSourceConfig, HttpTransport, ReqwestTransport};
pub use retry::RetryPolicy;

use crate::domain::DataKind;
use crate::schema::RawRows;
use chrono::NaiveDate;
use std::io;
use thiserror::Error;
use tracing::{debug, error, info};

/// Lazy sequence of raw batches for one (kind, date).
pub type BatchStream<'a> = Box<dyn Iterator<Item = RawRows> + 'a>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{what} not available for {date}")]
    Unavailable { what: String, date: NaiveDate },

    #[error("{source_name} does not provide {kind}")]
    UnsupportedKind { source_name: String, kind: DataKind },

    #[error("transport: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error("I/O: {0}")]
    Io(#[from] io::Error),

    #[error("configuration: {0}")]
    Config(String),
}

impl SourceError {
    /// The source has nothing for this request; the caller should warn and move on.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            SourceError::Unavailable { .. } | SourceError::UnsupportedKind { .. }
        )
    }
}

/// A provider of raw TAQ rows.
pub trait SourceAdapter {
    /// Human-readable name used in logs and reports.
    fn name(&self) -> &str;

    fn supports(&self, kind: DataKind) -> bool;

    /// Lazily extract rows of `kind` for `symbols` on `date`.
    ///
    /// Fails up front only when the whole request is unservable (missing
    /// table or file, unsupported kind). Per-group failures are logged
    /// inside the stream.
    fn extract<'a>(
        &'a mut self,
        kind: DataKind,
        date: NaiveDate,
        symbols: &[String],
    ) -> Result<BatchStream<'a>, SourceError>;

    /// Whether data for every kind in `kinds` can be served for `date`,
    /// without pulling rows. An unsupported kind is never available, so
    /// callers filter on [`SourceAdapter::supports`] first.
    fn is_available(&mut self, date: NaiveDate, kinds: &[DataKind]) -> Result<bool, SourceError>;

    /// Symbol universe to use when the caller supplies none.
    fn default_symbols(&mut self, date: NaiveDate) -> Result<Vec<String>, SourceError>;
}

impl<S: SourceAdapter + ?Sized> SourceAdapter for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn supports(&self, kind: DataKind) -> bool {
        (**self).supports(kind)
    }

    fn extract<'a>(
        &'a mut self,
        kind: DataKind,
        date: NaiveDate,
        symbols: &[String],
    ) -> Result<BatchStream<'a>, SourceError> {
        (**self).extract(kind, date, symbols)
    }

    fn is_available(&mut self, date: NaiveDate, kinds: &[DataKind]) -> Result<bool, SourceError> {
        (**self).is_available(date, kinds)
    }

    fn default_symbols(&mut self, date: NaiveDate) -> Result<Vec<String>, SourceError> {
        (**self).default_symbols(date)
    }
}

/// Split `symbols` into groups of at most `chunk_size`.
pub fn symbol_groups(symbols: &[String], chunk_size: usize) -> Vec<Vec<String>> {
    symbols
        .chunks(chunk_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

/// Runs one fetch per symbol group and yields each non-empty result.
///
/// A group whose fetch fails is logged and skipped.
pub struct GroupedFetch<F> {
    kind: DataKind,
    groups: Vec<Vec<String>>,
    next: usize,
    rows: usize,
    failed: usize,
    fetch: F,
}

impl<F> GroupedFetch<F>
where
    F: FnMut(&[String]) -> Result<RawRows, SourceError>,
{
    pub fn new(kind: DataKind, groups: Vec<Vec<String>>, fetch: F) -> Self {
        Self {
            kind,
            groups,
            next: 0,
            rows: 0,
            failed: 0,
            fetch,
        }
    }
}

impl<F> Iterator for GroupedFetch<F>
where
    F: FnMut(&[String]) -> Result<RawRows, SourceError>,
{
    type Item = RawRows;

    fn next(&mut self) -> Option<RawRows> {
        let total = self.groups.len();
        while self.next < total {
            let index = self.next;
            self.next += 1;
            let group = &self.groups[index];
            match (self.fetch)(group) {
                Ok(rows) if !rows.is_empty() => {
                    self.rows += rows.len();
                    info!(
                        kind = %self.kind,
                        group = index + 1,
                        groups = total,
                        rows = rows.len(),
                        running_total = self.rows,
                        "fetched group"
                    );
                    return Some(rows);
                }
                Ok(_) => debug!(kind = %self.kind, group = index + 1, groups = total, "group returned no rows"),
                Err(e) => {
                    self.failed += 1;
                    error!(
                        kind = %self.kind,
                        group = index + 1,
                        groups = total,
                        symbols = group.len(),
                        error = %e,
                        "group failed, continuing with the next one"
                    );
                }
            }
        }
        if total > 0 && self.next == total {
            info!(kind = %self.kind, rows = self.rows, failed_groups = self.failed, "extraction finished");
            // Report only once.
            self.next += 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::trade;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("S{i}")).collect()
    }

    #[test]
    fn groups_respect_chunk_size() {
        let groups = symbol_groups(&names(5), 2);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[2], vec!["S4".to_string()]);
        assert_eq!(symbol_groups(&names(3), 0).len(), 3);
        assert!(symbol_groups(&[], 50).is_empty());
    }

    #[test]
    fn failed_group_does_not_stop_the_rest() {
        let groups = symbol_groups(&names(10), 2);
        let mut call = 0;
        let fetch = GroupedFetch::new(DataKind::Trades, groups, |group: &[String]| {
            call += 1;
            if call == 2 {
                return Err(SourceError::Query("relation locked".into()));
            }
            Ok(RawRows::Trades(
                group.iter().map(|s| trade(s, 0, 10.0)).collect(),
            ))
        });
        let batches: Vec<RawRows> = fetch.collect();
        assert_eq!(batches.len(), 4);
        assert_eq!(batches.iter().map(RawRows::len).sum::<usize>(), 8);
    }

    #[test]
    fn unavailable_errors_are_soft() {
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(SourceError::Unavailable { what: "ctm_20240102".into(), date }.is_unavailable());
        assert!(!SourceError::Query("syntax".into()).is_unavailable());
    }
}
