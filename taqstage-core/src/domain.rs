//! Domain vocabulary shared by every stage of the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// One of the three TAQ datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataKind {
    Trades,
    Quotes,
    Nbbo,
}

impl DataKind {
    pub const ALL: [DataKind; 3] = [DataKind::Trades, DataKind::Quotes, DataKind::Nbbo];

    /// Dataset directory name under the store root.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataKind::Trades => "trades",
            DataKind::Quotes => "quotes",
            DataKind::Nbbo => "nbbo",
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for DataKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trades" => Ok(DataKind::Trades),
            "quotes" => Ok(DataKind::Quotes),
            "nbbo" => Ok(DataKind::Nbbo),
            other => Err(DomainError::UnknownKind(other.to_string())),
        }
    }
}

/// How a run treats partitions that already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// Skip partitions that exist; the whole run is a no-op when nothing is missing.
    #[default]
    Normal,
    /// Delete targeted partitions first, then fetch everything.
    Overwrite,
    /// Continue an earlier attempt, fetching only kinds that are still missing.
    Resume,
}

impl fmt::Display for IngestMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IngestMode::Normal => "normal",
            IngestMode::Overwrite => "overwrite",
            IngestMode::Resume => "resume",
        })
    }
}

/// Which on-disk evidence counts as "this partition is done".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExistencePolicy {
    /// The date-level `_SUCCESS` marker is required.
    #[default]
    Strict,
    /// Marker or any data file. Only for stores written before markers existed.
    Lenient,
}

/// How the writer consumes an adapter's batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Collect everything, stage, then publish atomically.
    Buffered,
    /// Write one part file per batch as it arrives.
    #[default]
    Streaming,
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Snappy,
    Zstd,
    Lz4,
    Gzip,
    Uncompressed,
}

impl FromStr for Compression {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snappy" => Ok(Compression::Snappy),
            "zstd" => Ok(Compression::Zstd),
            "lz4" => Ok(Compression::Lz4),
            "gzip" => Ok(Compression::Gzip),
            "none" | "uncompressed" => Ok(Compression::Uncompressed),
            other => Err(DomainError::UnknownCompression(other.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum DomainError {
    #[error("unknown data kind '{0}' (expected trades, quotes or nbbo)")]
    UnknownKind(String),

    #[error("unknown compression '{0}'")]
    UnknownCompression(String),
}

/// Parse a list of kind names, preserving order and dropping duplicates.
pub fn parse_kinds<S: AsRef<str>>(names: &[S]) -> Result<Vec<DataKind>, DomainError> {
    let mut kinds = Vec::with_capacity(names.len());
    for name in names {
        let kind: DataKind = name.as_ref().parse()?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    Ok(kinds)
}
