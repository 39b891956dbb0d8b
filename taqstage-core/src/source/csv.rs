//! Local CSV exports as a source: `{root}/taq_{trade|quote|nbbo}_{YYYYMMDD}.csv`.
//!
//! Headers are matched case-insensitively. Rows that fail to parse are
//! skipped and counted; rows are read lazily in fixed-size chunks.

use super::{BatchStream, SourceAdapter, SourceError};
use crate::calendar::parse_date;
use crate::canonicalize::canonical_symbol;
use crate::domain::DataKind;
use crate::schema::{NbboRow, QuoteRow, RawRows, TradeRow};
use chrono::{NaiveDate, NaiveTime};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CsvSourceConfig {
    pub root: PathBuf,
    /// Rows per yielded batch.
    pub chunk_rows: usize,
}

impl CsvSourceConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            chunk_rows: 1_000_000,
        }
    }
}

fn file_prefix(kind: DataKind) -> &'static str {
    match kind {
        DataKind::Trades => "taq_trade",
        DataKind::Quotes => "taq_quote",
        DataKind::Nbbo => "taq_nbbo",
    }
}

/// Expected CSV path for `kind` on `date`.
pub fn csv_path(root: &Path, kind: DataKind, date: NaiveDate) -> PathBuf {
    root.join(format!("{}_{}.csv", file_prefix(kind), date.format("%Y%m%d")))
}

/// Lowercased header name to column index.
struct Columns(HashMap<String, usize>);

impl Columns {
    fn from_headers(headers: &csv::StringRecord) -> Self {
        Self(
            headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.trim().to_lowercase(), i))
                .collect(),
        )
    }

    fn check(&self, kind: DataKind) -> Result<(), SourceError> {
        let required: &[&str] = match kind {
            DataKind::Trades => &["date", "time_m", "sym_root", "price", "size"],
            DataKind::Quotes => &["date", "time_m", "sym_root", "bid", "bidsiz", "ask", "asksiz"],
            DataKind::Nbbo => &[
                "date",
                "time_m",
                "sym_root",
                "best_bid",
                "best_bidsiz",
                "best_ask",
                "best_asksiz",
            ],
        };
        match required.iter().find(|c| !self.0.contains_key(**c)) {
            Some(missing) => Err(SourceError::Decode(format!("{kind} CSV lacks column {missing}"))),
            None => Ok(()),
        }
    }

    fn text(&self, rec: &csv::StringRecord, name: &str) -> Option<String> {
        self.0
            .get(name)
            .and_then(|&i| rec.get(i))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn required(&self, rec: &csv::StringRecord, name: &str) -> Result<String, String> {
        self.text(rec, name).ok_or_else(|| format!("{name} is empty"))
    }

    fn date(&self, rec: &csv::StringRecord) -> Result<NaiveDate, String> {
        parse_date(&self.required(rec, "date")?).map_err(|e| e.to_string())
    }

    fn time(&self, rec: &csv::StringRecord, name: &str) -> Result<Option<NaiveTime>, String> {
        self.text(rec, name)
            .map(|s| {
                NaiveTime::parse_from_str(&s, "%H:%M:%S%.f")
                    .map_err(|e| format!("{name} {s:?}: {e}"))
            })
            .transpose()
    }

    fn float(&self, rec: &csv::StringRecord, name: &str) -> Result<f64, String> {
        let s = self.required(rec, name)?;
        s.parse().map_err(|_| format!("{name} {s:?} is not a number"))
    }

    fn int(&self, rec: &csv::StringRecord, name: &str) -> Result<Option<i64>, String> {
        self.text(rec, name)
            .map(|s| {
                s.parse::<i64>()
                    .or_else(|_| s.parse::<f64>().map(|f| f as i64))
                    .map_err(|_| format!("{name} {s:?} is not an integer"))
            })
            .transpose()
    }

    fn required_int(&self, rec: &csv::StringRecord, name: &str) -> Result<i64, String> {
        self.int(rec, name)?.ok_or_else(|| format!("{name} is empty"))
    }

    fn time_m(&self, rec: &csv::StringRecord) -> Result<NaiveTime, String> {
        self.time(rec, "time_m")?.ok_or_else(|| "time_m is empty".to_string())
    }

    fn trade(&self, rec: &csv::StringRecord) -> Result<TradeRow, String> {
        Ok(TradeRow {
            date: self.date(rec)?,
            time_m: self.time_m(rec)?,
            time_m_nano: self.int(rec, "time_m_nano")?,
            part_time: self.time(rec, "part_time")?,
            trf_time: self.time(rec, "trf_time")?,
            sym_root: self.required(rec, "sym_root")?,
            sym_suffix: self.text(rec, "sym_suffix"),
            ex: self.text(rec, "ex"),
            price: self.float(rec, "price")?,
            size: self.required_int(rec, "size")?,
            tr_corr: self.text(rec, "tr_corr"),
            tr_id: self.text(rec, "tr_id"),
            tr_rf: self.text(rec, "tr_rf"),
            tr_scond: self.text(rec, "tr_scond"),
            tr_seqnum: self.int(rec, "tr_seqnum")?,
            tr_source: self.text(rec, "tr_source"),
            tr_stop_ind: self.text(rec, "tr_stop_ind"),
            tte_ind: self.text(rec, "tte_ind"),
        })
    }

    fn quote(&self, rec: &csv::StringRecord) -> Result<QuoteRow, String> {
        Ok(QuoteRow {
            date: self.date(rec)?,
            time_m: self.time_m(rec)?,
            time_m_nano: self.int(rec, "time_m_nano")?,
            sym_root: self.required(rec, "sym_root")?,
            sym_suffix: self.text(rec, "sym_suffix"),
            ex: self.text(rec, "ex"),
            bid: self.float(rec, "bid")?,
            bidsiz: self.required_int(rec, "bidsiz")?,
            ask: self.float(rec, "ask")?,
            asksiz: self.required_int(rec, "asksiz")?,
            qu_cond: self.text(rec, "qu_cond"),
            qu_seqnum: self.int(rec, "qu_seqnum")?,
            qu_cancel: self.text(rec, "qu_cancel"),
            qu_source: self.text(rec, "qu_source"),
        })
    }

    fn nbbo(&self, rec: &csv::StringRecord) -> Result<NbboRow, String> {
        Ok(NbboRow {
            date: self.date(rec)?,
            time_m: self.time_m(rec)?,
            time_m_nano: self.int(rec, "time_m_nano")?,
            sym_root: self.required(rec, "sym_root")?,
            sym_suffix: self.text(rec, "sym_suffix"),
            best_bid: self.float(rec, "best_bid")?,
            best_bidsiz: self.required_int(rec, "best_bidsiz")?,
            best_ask: self.float(rec, "best_ask")?,
            best_asksiz: self.required_int(rec, "best_asksiz")?,
            best_bidex: self.text(rec, "best_bidex"),
            best_askex: self.text(rec, "best_askex"),
            nbbo_qu_cond: self.text(rec, "nbbo_qu_cond"),
            secstat_ind: self.text(rec, "secstat_ind"),
            luld_indicator: self.text(rec, "luld_indicator"),
            qu_source: self.text(rec, "qu_source"),
        })
    }

    fn symbol(&self, rec: &csv::StringRecord) -> Option<String> {
        let root = self.text(rec, "sym_root")?;
        Some(canonical_symbol(&root, self.text(rec, "sym_suffix").as_deref()))
    }
}

fn open(path: &Path) -> Result<(csv::Reader<File>, Columns), SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| SourceError::Decode(format!("{}: {e}", path.display())))?;
    let headers = reader
        .headers()
        .map_err(|e| SourceError::Decode(format!("{}: {e}", path.display())))?;
    let columns = Columns::from_headers(headers);
    Ok((reader, columns))
}

/// Lazy reader yielding batches of at most `chunk_rows` matching rows.
struct CsvChunks {
    reader: csv::Reader<File>,
    columns: Columns,
    kind: DataKind,
    keep: HashSet<String>,
    chunk_rows: usize,
    line: u64,
    rows: usize,
    skipped: usize,
    done: bool,
}

impl CsvChunks {
    fn push(&self, out: &mut RawRows, rec: &csv::StringRecord) -> Result<(), String> {
        match out {
            RawRows::Trades(v) => v.push(self.columns.trade(rec)?),
            RawRows::Quotes(v) => v.push(self.columns.quote(rec)?),
            RawRows::Nbbo(v) => v.push(self.columns.nbbo(rec)?),
        }
        Ok(())
    }

    fn skip(&mut self, reason: &str) {
        self.skipped += 1;
        // First few in full, the rest only in the final count.
        if self.skipped <= 5 {
            warn!(kind = %self.kind, line = self.line, %reason, "skipping unparseable row");
        }
    }
}

impl Iterator for CsvChunks {
    type Item = RawRows;

    fn next(&mut self) -> Option<RawRows> {
        if self.done {
            return None;
        }
        let mut out = RawRows::empty(self.kind);
        let mut record = csv::StringRecord::new();
        while out.len() < self.chunk_rows {
            match self.reader.read_record(&mut record) {
                Ok(true) => {
                    self.line += 1;
                    let Some(symbol) = self.columns.symbol(&record) else {
                        self.skip("sym_root is empty");
                        continue;
                    };
                    if !self.keep.contains(&symbol) {
                        continue;
                    }
                    if let Err(reason) = self.push(&mut out, &record) {
                        self.skip(&reason);
                    }
                }
                Ok(false) => {
                    self.done = true;
                    break;
                }
                Err(e) => {
                    self.line += 1;
                    self.skip(&e.to_string());
                    if e.is_io_error() {
                        self.done = true;
                        break;
                    }
                }
            }
        }
        self.rows += out.len();
        if self.done {
            info!(kind = %self.kind, rows = self.rows, skipped = self.skipped, "CSV read finished");
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }
}

pub struct CsvSource {
    config: CsvSourceConfig,
}

impl CsvSource {
    pub fn new(config: CsvSourceConfig) -> Self {
        Self { config }
    }

    pub fn path_for(&self, kind: DataKind, date: NaiveDate) -> PathBuf {
        csv_path(&self.config.root, kind, date)
    }
}

impl SourceAdapter for CsvSource {
    fn name(&self) -> &str {
        "csv"
    }

    fn supports(&self, _kind: DataKind) -> bool {
        true
    }

    fn extract<'a>(
        &'a mut self,
        kind: DataKind,
        date: NaiveDate,
        symbols: &[String],
    ) -> Result<BatchStream<'a>, SourceError> {
        let path = self.path_for(kind, date);
        if !path.is_file() {
            return Err(SourceError::Unavailable {
                what: path.display().to_string(),
                date,
            });
        }
        let (reader, columns) = open(&path)?;
        columns.check(kind)?;
        info!(%kind, %date, path = %path.display(), symbols = symbols.len(), "reading CSV");

        Ok(Box::new(CsvChunks {
            reader,
            columns,
            kind,
            keep: symbols.iter().cloned().collect(),
            chunk_rows: self.config.chunk_rows.max(1),
            line: 1,
            rows: 0,
            skipped: 0,
            done: false,
        }))
    }

    fn is_available(&mut self, date: NaiveDate, kinds: &[DataKind]) -> Result<bool, SourceError> {
        for &kind in kinds {
            let path = self.path_for(kind, date);
            if !path.is_file() {
                debug!(%kind, %date, path = %path.display(), "CSV missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Distinct symbols in the day's trades file.
    fn default_symbols(&mut self, date: NaiveDate) -> Result<Vec<String>, SourceError> {
        let path = self.path_for(DataKind::Trades, date);
        if !path.is_file() {
            return Err(SourceError::Unavailable {
                what: path.display().to_string(),
                date,
            });
        }
        let (mut reader, columns) = open(&path)?;
        let mut symbols = BTreeSet::new();
        for record in reader.records() {
            let record = record.map_err(|e| SourceError::Decode(e.to_string()))?;
            if let Some(symbol) = columns.symbol(&record) {
                symbols.insert(symbol);
            }
        }
        Ok(symbols.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    const TRADES: &str = "\
DATE,TIME_M,TIME_M_NANO,SYM_ROOT,SYM_SUFFIX,EX,PRICE,SIZE,TR_CORR,TR_SCOND
2024-01-02,09:30:00.000123,456,AAPL,,Q,185.50,100,00,@
2024-01-02,09:30:01,0,MSFT,,N,370.10,50,00,@
20240102,09:30:02,0,BRK,A,N,540000,1,00,@
2024-01-02,not-a-time,0,AAPL,,Q,185.60,100,00,@
2024-01-02,09:30:03,0,AAPL,,Q,185.70,200,00,@
";

    fn source_with(files: &[(DataKind, &str)], chunk_rows: usize) -> (TempDir, CsvSource) {
        let tmp = TempDir::new().unwrap();
        for (kind, body) in files {
            fs::write(csv_path(tmp.path(), *kind, date()), body).unwrap();
        }
        let config = CsvSourceConfig {
            root: tmp.path().to_path_buf(),
            chunk_rows,
        };
        (tmp, CsvSource::new(config))
    }

    fn syms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn path_uses_compact_date() {
        let p = csv_path(Path::new("/data"), DataKind::Nbbo, date());
        assert_eq!(p, PathBuf::from("/data/taq_nbbo_20240102.csv"));
    }

    #[test]
    fn filters_symbols_and_skips_bad_rows() {
        let (_tmp, mut src) = source_with(&[(DataKind::Trades, TRADES)], 1_000);
        let batches: Vec<RawRows> = src
            .extract(DataKind::Trades, date(), &syms(&["AAPL", "BRK.A"]))
            .unwrap()
            .collect();
        assert_eq!(batches.len(), 1);
        let RawRows::Trades(rows) = &batches[0] else {
            panic!("expected trades");
        };
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].time_m_nano, Some(456));
        assert_eq!(rows[1].sym_suffix.as_deref(), Some("A"));
        assert!(rows.iter().all(|r| r.sym_root != "MSFT"));
    }

    #[test]
    fn yields_bounded_chunks() {
        let (_tmp, mut src) = source_with(&[(DataKind::Trades, TRADES)], 2);
        let sizes: Vec<usize> = src
            .extract(DataKind::Trades, date(), &syms(&["AAPL", "MSFT", "BRK.A"]))
            .unwrap()
            .map(|b| b.len())
            .collect();
        assert_eq!(sizes, vec![2, 2]);
    }

    #[test]
    fn missing_required_column_is_rejected() {
        let (_tmp, mut src) =
            source_with(&[(DataKind::Nbbo, "date,time_m,sym_root\n2024-01-02,09:30:00,SPY\n")], 10);
        let err = src
            .extract(DataKind::Nbbo, date(), &syms(&["SPY"]))
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::Decode(_)));
    }

    #[test]
    fn availability_and_defaults_follow_files() {
        let (_tmp, mut src) = source_with(&[(DataKind::Trades, TRADES)], 10);
        assert!(src.is_available(date(), &[DataKind::Trades]).unwrap());
        assert!(!src.is_available(date(), &[DataKind::Trades, DataKind::Nbbo]).unwrap());
        assert_eq!(
            src.default_symbols(date()).unwrap(),
            syms(&["AAPL", "BRK.A", "MSFT"])
        );
        let err = src
            .extract(DataKind::Quotes, date(), &syms(&["AAPL"]))
            .err()
            .unwrap();
        assert!(err.is_unavailable());
    }
}
