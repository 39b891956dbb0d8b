//! Ingestion planner: decides, per kind, which symbols still need fetching.

use crate::domain::{DataKind, ExistencePolicy, IngestMode};
use crate::store::{MissingSet, PartitionState, PartitionStore};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

/// One single-date ingestion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestRequest {
    pub trade_date: NaiveDate,
    pub symbols: Vec<String>,
    pub kinds: Vec<DataKind>,
    pub mode: IngestMode,
}

/// The planner's verdict for one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub mode: IngestMode,
    pub missing: MissingSet,
    /// Nothing to fetch for any kind; no adapter should be invoked.
    pub short_circuit: bool,
    /// Partitions removed up front by an overwrite.
    pub deleted: usize,
    /// Incomplete partitions removed so they can be fetched cleanly.
    pub cleared: usize,
}

impl Plan {
    /// Kinds with symbols left to fetch.
    pub fn pending(&self) -> impl Iterator<Item = (DataKind, &[String])> {
        self.missing
            .iter()
            .filter(|(_, syms)| !syms.is_empty())
            .map(|(k, syms)| (*k, syms.as_slice()))
    }

    /// Kinds skipped because every requested symbol already exists.
    pub fn skipped_kinds(&self) -> Vec<DataKind> {
        self.missing
            .iter()
            .filter(|(_, syms)| syms.is_empty())
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn is_noop(&self) -> bool {
        self.missing.values().all(|syms| syms.is_empty())
    }
}

pub struct Planner;

impl Planner {
    pub fn plan(store: &PartitionStore, request: &IngestRequest) -> Plan {
        let date = request.trade_date;
        match request.mode {
            IngestMode::Overwrite => Self::plan_overwrite(store, request),
            IngestMode::Normal | IngestMode::Resume => {
                let cleared = match store.policy() {
                    ExistencePolicy::Strict => Self::clear_incomplete(store, request),
                    ExistencePolicy::Lenient => {
                        let unverified = store.unverified(&request.kinds, date, &request.symbols);
                        if !unverified.is_empty() {
                            warn!(
                                %date,
                                count = unverified.len(),
                                "partitions exist without a completion marker and will be trusted; \
                                 they may be partial streamed writes"
                            );
                        }
                        0
                    }
                };

                let missing = store.missing(&request.kinds, date, &request.symbols);
                let short_circuit = missing.values().all(|syms| syms.is_empty());
                if short_circuit {
                    match request.mode {
                        IngestMode::Resume => info!(%date, "nothing to resume, all partitions complete"),
                        _ => info!(%date, "already ingested, use overwrite or resume to refetch"),
                    }
                } else {
                    for (kind, syms) in &missing {
                        if syms.is_empty() {
                            info!(%date, %kind, "complete, skipping kind");
                        } else {
                            info!(%date, %kind, missing = syms.len(), "symbols to fetch");
                        }
                    }
                }

                Plan {
                    mode: request.mode,
                    missing,
                    short_circuit,
                    deleted: 0,
                    cleared,
                }
            }
        }
    }

    fn plan_overwrite(store: &PartitionStore, request: &IngestRequest) -> Plan {
        let date = request.trade_date;
        let mut deleted = 0;
        for &kind in &request.kinds {
            if store.partition_by_symbol() {
                for sym in &request.symbols {
                    match store.delete(kind, date, Some(sym)) {
                        Ok(true) => deleted += 1,
                        Ok(false) => {}
                        Err(e) => warn!(%kind, %date, symbol = %sym, error = %e, "delete failed"),
                    }
                }
            } else if !request.symbols.is_empty() {
                match store.delete(kind, date, None) {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(%kind, %date, error = %e, "delete failed"),
                }
            }
        }
        info!(%date, deleted, "overwrite: cleared targeted partitions");

        let missing: MissingSet = request
            .kinds
            .iter()
            .map(|&k| (k, request.symbols.clone()))
            .collect();
        let short_circuit = missing.values().all(|syms| syms.is_empty());
        Plan {
            mode: IngestMode::Overwrite,
            missing,
            short_circuit,
            deleted,
            cleared: 0,
        }
    }

    /// Remove partitions that have files but no marker so a refetch never
    /// appends next to stale parts.
    fn clear_incomplete(store: &PartitionStore, request: &IngestRequest) -> usize {
        let date = request.trade_date;
        let mut cleared = 0;
        for &kind in &request.kinds {
            let targets: Vec<Option<&str>> = if store.partition_by_symbol() {
                request.symbols.iter().map(|s| Some(s.as_str())).collect()
            } else if request.symbols.is_empty() {
                Vec::new()
            } else {
                vec![None]
            };
            for symbol in targets {
                if !matches!(store.state(kind, date, symbol), Ok(PartitionState::Incomplete)) {
                    continue;
                }
                match store.delete(kind, date, symbol) {
                    Ok(true) => {
                        warn!(%kind, %date, ?symbol, "removed incomplete partition before refetch");
                        cleared += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(%kind, %date, ?symbol, error = %e, "could not remove incomplete partition"),
                }
            }
        }
        cleared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn request(symbols: &[&str], kinds: &[DataKind], mode: IngestMode) -> IngestRequest {
        IngestRequest {
            trade_date: date(),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            kinds: kinds.to_vec(),
            mode,
        }
    }

    fn complete(store: &PartitionStore, kind: DataKind, symbol: &str) {
        touch(&store.symbol_dir(kind, date(), symbol).join("part_0000.parquet"));
        store.mark_complete(kind, date()).unwrap();
    }

    #[test]
    fn empty_symbol_list_is_a_noop() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        let plan = Planner::plan(&store, &request(&[], &DataKind::ALL, IngestMode::Normal));
        assert!(plan.short_circuit);
        assert!(plan.missing.values().all(|v| v.is_empty()));
    }

    #[test]
    fn normal_short_circuits_when_complete() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        complete(&store, DataKind::Trades, "AAPL");
        let plan = Planner::plan(&store, &request(&["AAPL"], &[DataKind::Trades], IngestMode::Normal));
        assert!(plan.short_circuit);
        assert_eq!(plan.pending().count(), 0);
    }

    #[test]
    fn resume_skips_only_complete_kinds() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        complete(&store, DataKind::Trades, "AAPL");
        let plan = Planner::plan(
            &store,
            &request(&["AAPL"], &[DataKind::Trades, DataKind::Nbbo], IngestMode::Resume),
        );
        assert!(!plan.short_circuit);
        assert_eq!(plan.skipped_kinds(), vec![DataKind::Trades]);
        let pending: Vec<_> = plan.pending().map(|(k, s)| (k, s.to_vec())).collect();
        assert_eq!(pending, vec![(DataKind::Nbbo, vec!["AAPL".to_string()])]);
    }

    #[test]
    fn overwrite_deletes_and_marks_everything_missing() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        complete(&store, DataKind::Trades, "AAPL");
        complete(&store, DataKind::Trades, "MSFT");

        let plan = Planner::plan(&store, &request(&["AAPL"], &[DataKind::Trades], IngestMode::Overwrite));

        assert_eq!(plan.deleted, 1);
        assert_eq!(plan.missing[&DataKind::Trades], vec!["AAPL".to_string()]);
        assert!(!store.symbol_dir(DataKind::Trades, date(), "AAPL").exists());
        assert!(store.symbol_dir(DataKind::Trades, date(), "MSFT").exists());
        assert!(store.exists(DataKind::Trades, date(), Some("MSFT")));
    }

    #[test]
    fn strict_clears_incomplete_partitions() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Strict);
        touch(&store.symbol_dir(DataKind::Nbbo, date(), "SPY").join("part_0000.parquet"));

        let plan = Planner::plan(&store, &request(&["SPY"], &[DataKind::Nbbo], IngestMode::Resume));

        assert_eq!(plan.cleared, 1);
        assert_eq!(plan.missing[&DataKind::Nbbo], vec!["SPY".to_string()]);
        assert!(!store.symbol_dir(DataKind::Nbbo, date(), "SPY").exists());
    }

    #[test]
    fn lenient_trusts_unmarked_files() {
        let tmp = TempDir::new().unwrap();
        let store = PartitionStore::new(tmp.path(), true, ExistencePolicy::Lenient);
        touch(&store.symbol_dir(DataKind::Nbbo, date(), "SPY").join("part_0000.parquet"));

        let plan = Planner::plan(&store, &request(&["SPY"], &[DataKind::Nbbo], IngestMode::Resume));

        assert!(plan.short_circuit);
        assert_eq!(plan.cleared, 0);
        assert!(store.symbol_dir(DataKind::Nbbo, date(), "SPY").exists());
    }
}
