//! Partition store model over a Hive-style directory tree.
//!
//! Layout: `{root}/{kind}/trade_date={YYYY-MM-DD}/[symbol={SYMBOL}/]part_NNNN.parquet`
//! with a zero-byte `_SUCCESS` marker directly inside the `trade_date=` directory.
//! A symbol directory may carry its own `_SUCCESS`; that one vouches for the
//! symbol regardless of the date marker.
//!
//! The store knows nothing about the writer or the planner. Both consult it.

use crate::domain::{DataKind, ExistencePolicy};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SUCCESS_MARKER: &str = "_SUCCESS";
pub const STAGING_DIR: &str = ".staging";
const DATA_EXTENSION: &str = "parquet";

/// `{kind -> symbols still to fetch}`. Symbol order follows the request.
pub type MissingSet = BTreeMap<DataKind, Vec<String>>;

/// What is on disk for one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    /// No data files and no marker.
    Absent,
    /// Data files exist but no marker vouches for them.
    Incomplete,
    /// Marker present (and, per symbol, data files present).
    Complete,
}

/// A partition that only passes the existence check on file presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionRef {
    pub kind: DataKind,
    pub trade_date: NaiveDate,
    pub symbol: Option<String>,
}

/// Strip a partition directory name down to its logical symbol.
///
/// Accepts `symbol=AAPL` as well as the tuple renderings `symbol=('AAPL',)`
/// and `symbol=("AAPL",)` that some writers emit for non-scalar keys.
pub fn parse_symbol_dir_name(name: &str) -> Option<String> {
    let value = name.strip_prefix("symbol=")?;
    let inner = value
        .strip_prefix("('")
        .and_then(|v| v.strip_suffix("',)"))
        .or_else(|| {
            value
                .strip_prefix("(\"")
                .and_then(|v| v.strip_suffix("\",)"))
        })
        .unwrap_or(value);
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

/// Visible `*.parquet` file. Hidden names are in-flight temp files.
pub fn is_data_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    !name.starts_with('.')
        && path.extension().and_then(|e| e.to_str()) == Some(DATA_EXTENSION)
}

/// Data files under `dir`, sorted. A missing directory yields nothing.
pub fn data_files(dir: &Path, recursive: bool) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    collect_files(dir, recursive, &mut |p| {
        if is_data_file(p) {
            out.push(p.to_path_buf());
        }
    })?;
    out.sort();
    Ok(out)
}

fn collect_files(dir: &Path, recursive: bool, visit: &mut dyn FnMut(&Path)) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if recursive {
                collect_files(&path, recursive, visit)?;
            }
        } else if file_type.is_file() {
            visit(&path);
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PartitionStore {
    root: PathBuf,
    partition_by_symbol: bool,
    policy: ExistencePolicy,
}

impl PartitionStore {
    pub fn new(root: impl Into<PathBuf>, partition_by_symbol: bool, policy: ExistencePolicy) -> Self {
        Self {
            root: root.into(),
            partition_by_symbol,
            policy,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn partition_by_symbol(&self) -> bool {
        self.partition_by_symbol
    }

    pub fn policy(&self) -> ExistencePolicy {
        self.policy
    }

    /// `{root}/{kind}`
    pub fn dataset_dir(&self, kind: DataKind) -> PathBuf {
        self.root.join(kind.as_str())
    }

    /// `{root}/{kind}/trade_date={YYYY-MM-DD}`
    pub fn date_dir(&self, kind: DataKind, date: NaiveDate) -> PathBuf {
        self.dataset_dir(kind)
            .join(format!("trade_date={}", date.format("%Y-%m-%d")))
    }

    /// Plain-form symbol directory. This is the only form ever written.
    pub fn symbol_dir(&self, kind: DataKind, date: NaiveDate, symbol: &str) -> PathBuf {
        self.date_dir(kind, date).join(format!("symbol={symbol}"))
    }

    /// Directory that receives data files for a (possibly keyless) partition.
    pub fn partition_dir(&self, kind: DataKind, date: NaiveDate, symbol: Option<&str>) -> PathBuf {
        match symbol {
            Some(sym) if self.partition_by_symbol => self.symbol_dir(kind, date, sym),
            _ => self.date_dir(kind, date),
        }
    }

    pub fn marker_path(&self, kind: DataKind, date: NaiveDate) -> PathBuf {
        self.date_dir(kind, date).join(SUCCESS_MARKER)
    }

    /// Scratch space for buffered writes; lives on the same filesystem as the data.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    pub fn has_marker(&self, kind: DataKind, date: NaiveDate) -> bool {
        self.marker_path(kind, date).is_file()
    }

    /// Every directory under the date that holds `symbol`, in either encoding.
    pub fn resolve_symbol_dirs(
        &self,
        kind: DataKind,
        date: NaiveDate,
        symbol: &str,
    ) -> io::Result<Vec<PathBuf>> {
        let date_dir = self.date_dir(kind, date);
        let entries = match fs::read_dir(&date_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if parse_symbol_dir_name(&name.to_string_lossy()).as_deref() == Some(symbol) {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Classify a partition without applying the existence policy.
    pub fn state(
        &self,
        kind: DataKind,
        date: NaiveDate,
        symbol: Option<&str>,
    ) -> io::Result<PartitionState> {
        match symbol {
            Some(sym) if self.partition_by_symbol => {
                let dirs = self.resolve_symbol_dirs(kind, date, sym)?;
                let mut has_files = false;
                for dir in &dirs {
                    // Pinned by a later write, or left by an older layout.
                    if dir.join(SUCCESS_MARKER).is_file() {
                        return Ok(PartitionState::Complete);
                    }
                    has_files |= !data_files(dir, true)?.is_empty();
                }
                Ok(match (has_files, self.has_marker(kind, date)) {
                    (true, true) => PartitionState::Complete,
                    (true, false) => PartitionState::Incomplete,
                    (false, _) => PartitionState::Absent,
                })
            }
            _ => {
                if self.has_marker(kind, date) {
                    return Ok(PartitionState::Complete);
                }
                let files = data_files(&self.date_dir(kind, date), true)?;
                Ok(if files.is_empty() {
                    PartitionState::Absent
                } else {
                    PartitionState::Incomplete
                })
            }
        }
    }

    /// Whether the partition counts as ingested under the store's policy.
    ///
    /// An unreadable partition counts as absent so it gets fetched again.
    pub fn exists(&self, kind: DataKind, date: NaiveDate, symbol: Option<&str>) -> bool {
        match self.state(kind, date, symbol) {
            Ok(PartitionState::Complete) => true,
            Ok(PartitionState::Incomplete) => self.policy == ExistencePolicy::Lenient,
            Ok(PartitionState::Absent) => false,
            Err(e) => {
                warn!(%kind, %date, ?symbol, error = %e, "partition unreadable, treating as absent");
                false
            }
        }
    }

    /// Per kind, the requested symbols that do not exist yet.
    pub fn missing(&self, kinds: &[DataKind], date: NaiveDate, symbols: &[String]) -> MissingSet {
        kinds
            .iter()
            .map(|&kind| {
                let absent = symbols
                    .iter()
                    .filter(|sym| !self.exists(kind, date, Some(sym.as_str())))
                    .cloned()
                    .collect();
                (kind, absent)
            })
            .collect()
    }

    /// Partitions that exist only by file presence (no marker vouches for them).
    pub fn unverified(
        &self,
        kinds: &[DataKind],
        date: NaiveDate,
        symbols: &[String],
    ) -> Vec<PartitionRef> {
        let mut out = Vec::new();
        for &kind in kinds {
            if !self.partition_by_symbol {
                if let Ok(PartitionState::Incomplete) = self.state(kind, date, None) {
                    out.push(PartitionRef {
                        kind,
                        trade_date: date,
                        symbol: None,
                    });
                }
                continue;
            }
            for sym in symbols {
                if let Ok(PartitionState::Incomplete) = self.state(kind, date, Some(sym)) {
                    out.push(PartitionRef {
                        kind,
                        trade_date: date,
                        symbol: Some(sym.clone()),
                    });
                }
            }
        }
        out
    }

    /// Remove a partition in every encoding. Returns whether anything was removed.
    ///
    /// Without a symbol (or without symbol partitioning) the whole date goes.
    pub fn delete(&self, kind: DataKind, date: NaiveDate, symbol: Option<&str>) -> io::Result<bool> {
        let targets = match symbol {
            Some(sym) if self.partition_by_symbol => self.resolve_symbol_dirs(kind, date, sym)?,
            _ => vec![self.date_dir(kind, date)],
        };
        let mut removed = false;
        for dir in targets {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    debug!(path = %dir.display(), "deleted partition");
                    removed = true;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    /// Touch the date-level completion marker.
    pub fn mark_complete(&self, kind: DataKind, date: NaiveDate) -> io::Result<()> {
        fs::create_dir_all(self.date_dir(kind, date))?;
        fs::File::create(self.marker_path(kind, date))?;
        Ok(())
    }

    /// Withdraw the completion marker before the date is written again.
    pub fn clear_marker(&self, kind: DataKind, date: NaiveDate) -> io::Result<bool> {
        match fs::remove_file(self.marker_path(kind, date)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Symbol directories under a date, in any encoding, sorted.
    fn symbol_dirs(&self, kind: DataKind, date: NaiveDate) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(self.date_dir(kind, date)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut dirs = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && parse_symbol_dir_name(&entry.file_name().to_string_lossy()).is_some()
            {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Copy the date marker's guarantee into every symbol directory it covers.
    ///
    /// Runs before the date marker is withdrawn, so symbols published by earlier
    /// runs stay complete while another subset of the date is being written.
    /// No-op without the date marker or without symbol partitioning.
    pub fn pin_symbol_markers(&self, kind: DataKind, date: NaiveDate) -> io::Result<usize> {
        if !self.partition_by_symbol || !self.has_marker(kind, date) {
            return Ok(0);
        }
        let mut pinned = 0;
        for dir in self.symbol_dirs(kind, date)? {
            let marker = dir.join(SUCCESS_MARKER);
            if marker.is_file() || data_files(&dir, true)?.is_empty() {
                continue;
            }
            fs::File::create(&marker)?;
            pinned += 1;
        }
        if pinned > 0 {
            debug!(%kind, %date, pinned, "pinned symbol markers");
        }
        Ok(pinned)
    }

    /// Remove symbol directories that hold data no marker vouches for.
    ///
    /// These are left behind by a write that died before touching the date
    /// marker. Publishing the marker over them would promote them to complete.
    /// No-op while the date marker is present or without symbol partitioning.
    pub fn sweep_unverified(&self, kind: DataKind, date: NaiveDate) -> io::Result<usize> {
        if !self.partition_by_symbol || self.has_marker(kind, date) {
            return Ok(0);
        }
        let mut swept = 0;
        for dir in self.symbol_dirs(kind, date)? {
            if dir.join(SUCCESS_MARKER).is_file() || data_files(&dir, true)?.is_empty() {
                continue;
            }
            fs::remove_dir_all(&dir)?;
            debug!(path = %dir.display(), "swept unverified partition");
            swept += 1;
        }
        Ok(swept)
    }

    /// Withdraw a symbol directory's own marker before new files land in it.
    pub fn clear_symbol_marker(&self, dir: &Path) -> io::Result<bool> {
        match fs::remove_file(dir.join(SUCCESS_MARKER)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Symbols with data on disk for a date, tuple names unwrapped.
    pub fn list_symbols(&self, kind: DataKind, date: NaiveDate) -> io::Result<Vec<String>> {
        let date_dir = self.date_dir(kind, date);
        let entries = match fs::read_dir(&date_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut symbols = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(sym) = parse_symbol_dir_name(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if !data_files(&entry.path(), true)?.is_empty() {
                symbols.insert(sym);
            }
        }
        Ok(symbols.into_iter().collect())
    }

    /// Dates present for a dataset, ascending.
    pub fn list_dates(&self, kind: DataKind) -> io::Result<Vec<NaiveDate>> {
        let entries = match fs::read_dir(self.dataset_dir(kind)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut dates = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(value) = name.to_str().and_then(|n| n.strip_prefix("trade_date=")) else {
                continue;
            };
            if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
                dates.insert(date);
            }
        }
        Ok(dates.into_iter().collect())
    }

    /// Closest stored dates strictly before and after `date`.
    pub fn nearest_dates(
        &self,
        kind: DataKind,
        date: NaiveDate,
    ) -> io::Result<(Option<NaiveDate>, Option<NaiveDate>)> {
        let dates = self.list_dates(kind)?;
        let before = dates.iter().rev().find(|d| **d < date).copied();
        let after = dates.iter().find(|d| **d > date).copied();
        Ok((before, after))
    }

    /// BLAKE3 digest over relative paths and contents of everything under the date.
    ///
    /// `None` when the date directory does not exist.
    pub fn fingerprint(&self, kind: DataKind, date: NaiveDate) -> io::Result<Option<String>> {
        let date_dir = self.date_dir(kind, date);
        if !date_dir.is_dir() {
            return Ok(None);
        }
        let mut files = Vec::new();
        collect_files(&date_dir, true, &mut |p| files.push(p.to_path_buf()))?;
        files.sort();

        let mut hasher = blake3::Hasher::new();
        for path in files {
            let rel = path.strip_prefix(&date_dir).unwrap_or(&path);
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(&[0]);
            hasher.update(&fs::read(&path)?);
        }
        Ok(Some(hasher.finalize().to_hex().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn syms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn layout_is_bit_exact() {
        let store = PartitionStore::new("/data", true, ExistencePolicy::Strict);
        assert_eq!(
            store.symbol_dir(DataKind::Nbbo, date(), "AAPL"),
            PathBuf::from("/data/nbbo/trade_date=2024-01-02/symbol=AAPL")
        );
        assert_eq!(
            store.marker_path(DataKind::Trades, date()),
            PathBuf::from("/data/trades/trade_date=2024-01-02/_SUCCESS")
        );
    }

    #[test]
    fn dir_name_parsing() {
        assert_eq!(parse_symbol_dir_name("symbol=AAPL").as_deref(), Some("AAPL"));
        assert_eq!(parse_symbol_dir_name("symbol=('AAPL',)").as_deref(), Some("AAPL"));
        assert_eq!(parse_symbol_dir_name("symbol=(\"BRK.A\",)").as_deref(), Some("BRK.A"));
        assert_eq!(parse_symbol_dir_name("trade_date=2024-01-02"), None);
        assert_eq!(parse_symbol_dir_name("symbol="), None);
    }

    #[test]
    fn hidden_and_foreign_files_are_not_data() {
        assert!(is_data_file(Path::new("a/part_0000.parquet")));
        assert!(!is_data_file(Path::new("a/.part_0000.parquet")));
        assert!(!is_data_file(Path::new("a/part_0000.parquet.tmp")));
        assert!(!is_data_file(Path::new("a/_SUCCESS")));
    }

    #[test]
    fn strict_requires_marker() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        let file = store
            .symbol_dir(DataKind::Trades, date(), "AAPL")
            .join("part_0000.parquet");
        touch(&file);

        assert_eq!(
            store.state(DataKind::Trades, date(), Some("AAPL")).unwrap(),
            PartitionState::Incomplete
        );
        assert!(!store.exists(DataKind::Trades, date(), Some("AAPL")));

        store.mark_complete(DataKind::Trades, date()).unwrap();
        assert!(store.exists(DataKind::Trades, date(), Some("AAPL")));
        // The marker alone does not vouch for symbols that were never written.
        assert!(!store.exists(DataKind::Trades, date(), Some("MSFT")));
    }

    #[test]
    fn lenient_accepts_files_alone() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Lenient);
        touch(
            &store
                .symbol_dir(DataKind::Trades, date(), "AAPL")
                .join("part_0000.parquet"),
        );
        assert!(store.exists(DataKind::Trades, date(), Some("AAPL")));
        assert_eq!(
            store.unverified(&[DataKind::Trades], date(), &syms(&["AAPL"])),
            vec![PartitionRef {
                kind: DataKind::Trades,
                trade_date: date(),
                symbol: Some("AAPL".into()),
            }]
        );
    }

    #[test]
    fn tuple_directory_counts_as_plain() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        let date_dir = store.date_dir(DataKind::Quotes, date());
        touch(&date_dir.join("symbol=('AAPL',)").join("part_0000.parquet"));
        store.mark_complete(DataKind::Quotes, date()).unwrap();

        assert!(store.exists(DataKind::Quotes, date(), Some("AAPL")));
        let missing = store.missing(&[DataKind::Quotes], date(), &syms(&["AAPL", "MSFT"]));
        assert_eq!(missing[&DataKind::Quotes], syms(&["MSFT"]));
        assert_eq!(store.list_symbols(DataKind::Quotes, date()).unwrap(), syms(&["AAPL"]));
    }

    #[test]
    fn legacy_symbol_marker_is_complete() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        touch(&store.symbol_dir(DataKind::Nbbo, date(), "SPY").join(SUCCESS_MARKER));
        assert!(store.exists(DataKind::Nbbo, date(), Some("SPY")));
    }

    #[test]
    fn unpartitioned_store_uses_date_marker() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), false, ExistencePolicy::Strict);
        touch(&store.date_dir(DataKind::Trades, date()).join("part_0000.parquet"));
        assert!(!store.exists(DataKind::Trades, date(), Some("AAPL")));
        store.mark_complete(DataKind::Trades, date()).unwrap();
        assert!(store.exists(DataKind::Trades, date(), Some("AAPL")));
        assert!(store.exists(DataKind::Trades, date(), None));
    }

    #[test]
    fn empty_symbol_list_has_nothing_missing() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        let missing = store.missing(&DataKind::ALL, date(), &[]);
        assert_eq!(missing.len(), 3);
        assert!(missing.values().all(|v| v.is_empty()));
    }

    #[test]
    fn delete_removes_both_encodings() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Lenient);
        let date_dir = store.date_dir(DataKind::Trades, date());
        touch(&date_dir.join("symbol=AAPL").join("part_0000.parquet"));
        touch(&date_dir.join("symbol=('AAPL',)").join("part_0000.parquet"));
        touch(&date_dir.join("symbol=MSFT").join("part_0000.parquet"));

        assert!(store.delete(DataKind::Trades, date(), Some("AAPL")).unwrap());
        assert!(!store.exists(DataKind::Trades, date(), Some("AAPL")));
        assert!(store.exists(DataKind::Trades, date(), Some("MSFT")));
        assert!(!store.delete(DataKind::Trades, date(), Some("AAPL")).unwrap());
    }

    #[test]
    fn pinned_symbols_survive_marker_withdrawal() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        let aapl = store.symbol_dir(DataKind::Trades, date(), "AAPL");
        touch(&aapl.join("part_0000.parquet"));
        fs::create_dir_all(store.symbol_dir(DataKind::Trades, date(), "EMPTY")).unwrap();

        assert_eq!(store.pin_symbol_markers(DataKind::Trades, date()).unwrap(), 0);
        store.mark_complete(DataKind::Trades, date()).unwrap();
        assert_eq!(store.pin_symbol_markers(DataKind::Trades, date()).unwrap(), 1);
        assert!(aapl.join(SUCCESS_MARKER).is_file());

        store.clear_marker(DataKind::Trades, date()).unwrap();
        assert!(store.exists(DataKind::Trades, date(), Some("AAPL")));
        assert_eq!(store.sweep_unverified(DataKind::Trades, date()).unwrap(), 0);
    }

    #[test]
    fn sweep_removes_files_left_by_a_dead_write() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        let date_dir = store.date_dir(DataKind::Trades, date());
        touch(&date_dir.join("symbol=AAPL").join("part_0000.parquet"));
        touch(&date_dir.join("symbol=('MSFT',)").join("part_0000.parquet"));
        touch(&date_dir.join("symbol=SPY").join("part_0000.parquet"));
        touch(&date_dir.join("symbol=SPY").join(SUCCESS_MARKER));

        assert_eq!(store.sweep_unverified(DataKind::Trades, date()).unwrap(), 2);
        assert_eq!(store.list_symbols(DataKind::Trades, date()).unwrap(), syms(&["SPY"]));

        // Under the date marker nothing counts as unverified.
        touch(&date_dir.join("symbol=AAPL").join("part_0000.parquet"));
        store.mark_complete(DataKind::Trades, date()).unwrap();
        assert_eq!(store.sweep_unverified(DataKind::Trades, date()).unwrap(), 0);
    }

    #[test]
    fn list_dates_ignores_foreign_entries() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        store.mark_complete(DataKind::Trades, date()).unwrap();
        fs::create_dir_all(store.dataset_dir(DataKind::Trades).join("scratch")).unwrap();
        assert_eq!(store.list_dates(DataKind::Trades).unwrap(), vec![date()]);
    }

    #[test]
    fn nearest_dates_bracket_a_gap() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        let day = |d| NaiveDate::from_ymd_opt(2024, 1, d).unwrap();
        for d in [2, 3, 8] {
            store.mark_complete(DataKind::Nbbo, day(d)).unwrap();
        }

        assert_eq!(
            store.nearest_dates(DataKind::Nbbo, day(5)).unwrap(),
            (Some(day(3)), Some(day(8)))
        );
        assert_eq!(store.nearest_dates(DataKind::Nbbo, day(3)).unwrap(), (Some(day(2)), Some(day(8))));
        assert_eq!(store.nearest_dates(DataKind::Nbbo, day(9)).unwrap(), (Some(day(8)), None));
        assert_eq!(store.nearest_dates(DataKind::Trades, day(5)).unwrap(), (None, None));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        assert_eq!(store.fingerprint(DataKind::Trades, date()).unwrap(), None);

        let file = store
            .symbol_dir(DataKind::Trades, date(), "AAPL")
            .join("part_0000.parquet");
        touch(&file);
        let first = store.fingerprint(DataKind::Trades, date()).unwrap();
        assert_eq!(first, store.fingerprint(DataKind::Trades, date()).unwrap());

        fs::write(&file, b"y").unwrap();
        assert_ne!(first, store.fingerprint(DataKind::Trades, date()).unwrap());
    }
}
