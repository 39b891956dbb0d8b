//! Columnar writer: publishes enriched batches into the partition store.
//!
//! Buffered mode stages every partition file under `{root}/.staging/` and only
//! then moves them into place. Streaming mode writes one `part_NNNN.parquet`
//! per batch and symbol as batches arrive, each through a hidden temp file
//! that is renamed into place. Both touch `_SUCCESS` last and only when rows
//! were written.
//!
//! Before the date marker is withdrawn, symbols it already covers get their own
//! marker, and under the strict policy files no marker covers are swept away.
//! A date marker published afterwards therefore only vouches for this write and
//! for symbols that were already complete.

use crate::domain::{Compression, DataKind, ExistencePolicy};
use crate::schema::{self, RecordBatch, SchemaError};
use crate::store::{data_files, PartitionStore};
use chrono::NaiveDate;
use polars::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("partition I/O: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("parquet I/O on {path}: {source}")]
    Parquet { path: PathBuf, source: PolarsError },

    #[error("{found} batch passed to a {expected} write")]
    KindMismatch { expected: DataKind, found: DataKind },
}

/// `part_0000.parquet`, `part_0001.parquet`, ...
pub fn part_file_name(index: usize) -> String {
    format!("part_{index:04}.parquet")
}

fn part_index(path: &Path) -> Option<usize> {
    path.file_name()?
        .to_str()?
        .strip_prefix("part_")?
        .strip_suffix(".parquet")?
        .parse()
        .ok()
}

/// First unused part index in `dir`.
fn next_part_index(dir: &Path) -> io::Result<usize> {
    Ok(data_files(dir, false)?
        .iter()
        .filter_map(|p| part_index(p))
        .max()
        .map_or(0, |i| i + 1))
}

fn parquet_compression(c: Compression) -> ParquetCompression {
    match c {
        Compression::Snappy => ParquetCompression::Snappy,
        Compression::Zstd => ParquetCompression::Zstd(None),
        Compression::Lz4 => ParquetCompression::Lz4Raw,
        Compression::Gzip => ParquetCompression::Gzip(None),
        Compression::Uncompressed => ParquetCompression::Uncompressed,
    }
}

pub struct ColumnarWriter<'a> {
    store: &'a PartitionStore,
    compression: Compression,
}

impl<'a> ColumnarWriter<'a> {
    pub fn new(store: &'a PartitionStore, compression: Compression) -> Self {
        Self { store, compression }
    }

    /// Concatenate, split per symbol, stage, then publish atomically.
    ///
    /// Returns the number of rows written. Empty input writes nothing at all.
    pub fn write_buffered(
        &self,
        kind: DataKind,
        date: NaiveDate,
        batches: Vec<RecordBatch>,
    ) -> Result<usize, WriteError> {
        for batch in &batches {
            check_kind(kind, batch)?;
        }
        let all = match RecordBatch::concat(batches)? {
            Some(all) if !all.is_empty() => all,
            _ => {
                warn!(%kind, %date, "no rows to write, skipping");
                return Ok(0);
            }
        };
        let total = all.len();
        let parts = self.partitions(all);

        let staging_root = self.store.staging_dir();
        fs::create_dir_all(&staging_root)?;
        let staging = tempfile::Builder::new()
            .prefix(&format!("{kind}-{date}-"))
            .tempdir_in(&staging_root)?;

        let mut staged = Vec::with_capacity(parts.len());
        for (i, (symbol, batch)) in parts.into_iter().enumerate() {
            let path = staging.path().join(part_file_name(i));
            self.write_frame(&batch, &path)?;
            staged.push((symbol, path));
        }
        debug!(%kind, %date, files = staged.len(), "staged partition files");

        self.begin_publish(kind, date)?;
        for (symbol, staged_path) in staged {
            let dir = self.store.partition_dir(kind, date, symbol.as_deref());
            fs::create_dir_all(&dir)?;
            if symbol.is_some() {
                self.store.clear_symbol_marker(&dir)?;
            }
            let target = dir.join(part_file_name(next_part_index(&dir)?));
            fs::rename(&staged_path, &target)?;
        }
        self.store.mark_complete(kind, date)?;

        drop(staging);
        // Only succeeds once no other run is staging.
        if let Err(e) = fs::remove_dir(&staging_root) {
            debug!(path = %staging_root.display(), error = %e, "staging root kept");
        }

        info!(%kind, %date, rows = total, "published buffered partition");
        Ok(total)
    }

    /// Write each batch as it arrives, holding at most one batch in memory.
    ///
    /// The marker is withdrawn before the first file lands and touched once
    /// the sequence is exhausted, only if at least one row was written.
    pub fn write_streaming<I>(
        &self,
        kind: DataKind,
        date: NaiveDate,
        batches: I,
    ) -> Result<usize, WriteError>
    where
        I: IntoIterator<Item = RecordBatch>,
    {
        let mut total = 0usize;
        let mut files = 0usize;
        let mut marker_cleared = false;
        let mut next_index: HashMap<PathBuf, usize> = HashMap::new();

        for batch in batches {
            check_kind(kind, &batch)?;
            if batch.is_empty() {
                continue;
            }
            if !marker_cleared {
                self.begin_publish(kind, date)?;
                marker_cleared = true;
            }

            for (symbol, part) in self.partitions(batch) {
                let dir = self.store.partition_dir(kind, date, symbol.as_deref());
                fs::create_dir_all(&dir)?;
                let index = match next_index.get(&dir) {
                    Some(&i) => i,
                    None => {
                        if symbol.is_some() {
                            self.store.clear_symbol_marker(&dir)?;
                        }
                        next_part_index(&dir)?
                    }
                };
                self.write_atomic(&part, &dir.join(part_file_name(index)))?;
                next_index.insert(dir, index + 1);
                total += part.len();
                files += 1;
            }
            debug!(%kind, %date, rows = total, "streamed batch");
        }

        if total == 0 {
            warn!(%kind, %date, "stream produced no rows, nothing written");
            return Ok(0);
        }
        self.store.mark_complete(kind, date)?;
        info!(%kind, %date, rows = total, files, "published streamed partition");
        Ok(total)
    }

    /// Pin, sweep, then withdraw the date marker. Called once, before the first file lands.
    fn begin_publish(&self, kind: DataKind, date: NaiveDate) -> Result<(), WriteError> {
        self.store.pin_symbol_markers(kind, date)?;
        if self.store.policy() == ExistencePolicy::Strict {
            let swept = self.store.sweep_unverified(kind, date)?;
            if swept > 0 {
                warn!(%kind, %date, swept, "removed unverified partitions left by an earlier write");
            }
        }
        self.store.clear_marker(kind, date)?;
        Ok(())
    }

    fn partitions(&self, batch: RecordBatch) -> Vec<(Option<String>, RecordBatch)> {
        if self.store.partition_by_symbol() {
            batch
                .split_by_symbol()
                .into_iter()
                .map(|(sym, b)| (Some(sym), b))
                .collect()
        } else {
            vec![(None, batch)]
        }
    }

    fn write_atomic(&self, batch: &RecordBatch, path: &Path) -> Result<(), WriteError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp_path = path.with_file_name(format!(".{name}.tmp"));
        self.write_frame(batch, &tmp_path)?;
        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            WriteError::Io(e)
        })
    }

    fn write_frame(&self, batch: &RecordBatch, path: &Path) -> Result<(), WriteError> {
        let mut df = batch.to_dataframe()?;
        schema::validate(batch.kind(), &df)?;
        let file = fs::File::create(path)?;
        ParquetWriter::new(file)
            .with_compression(parquet_compression(self.compression))
            .finish(&mut df)
            .map_err(|source| WriteError::Parquet {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(())
    }
}

fn check_kind(expected: DataKind, batch: &RecordBatch) -> Result<(), WriteError> {
    let found = batch.kind();
    if found != expected {
        return Err(WriteError::KindMismatch { expected, found });
    }
    Ok(())
}

/// Read every data file of a partition into one frame.
///
/// With a symbol on a symbol-partitioned store, both directory encodings are read.
pub fn read_partition(
    store: &PartitionStore,
    kind: DataKind,
    date: NaiveDate,
    symbol: Option<&str>,
) -> Result<Option<DataFrame>, WriteError> {
    let dirs = match symbol {
        Some(sym) if store.partition_by_symbol() => store.resolve_symbol_dirs(kind, date, sym)?,
        _ => vec![store.date_dir(kind, date)],
    };
    let mut frame: Option<DataFrame> = None;
    for dir in dirs {
        for path in data_files(&dir, true)? {
            let file = fs::File::open(&path)?;
            let df = ParquetReader::new(file)
                .finish()
                .map_err(|source| WriteError::Parquet {
                    path: path.clone(),
                    source,
                })?;
            match frame.as_mut() {
                Some(acc) => {
                    acc.vstack_mut(&df).map_err(|source| WriteError::Parquet {
                        path: path.clone(),
                        source,
                    })?;
                }
                None => frame = Some(df),
            }
        }
    }
    Ok(frame)
}
