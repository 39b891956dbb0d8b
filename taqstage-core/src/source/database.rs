//! WRDS TAQ adapter over PostgreSQL.
//!
//! Daily tables are `ctm_YYYYMMDD` (trades), `cqm_YYYYMMDD` (quotes) and
//! `complete_nbbo_YYYYMMDD` (NBBO). Which schema holds them depends on the
//! year, so the adapter probes `taqm_{year}` and then `taqmsec`, caching the
//! answer per table.

use super::{symbol_groups, BatchStream, GroupedFetch, SourceAdapter, SourceError};
use crate::canonicalize::split_symbol;
use crate::domain::DataKind;
use crate::schema::{NbboRow, QuoteRow, RawRows, TradeRow};
use chrono::{Datelike, NaiveDate};
use postgres::error::SqlState;
use postgres::types::FromSql;
use std::collections::{BTreeSet, HashMap};
use thiserror::Error;
use tracing::{debug, info};

pub const WRDS_HOST: &str = "wrds-pgdata.wharton.upenn.edu";
pub const WRDS_PORT: u16 = 9737;
pub const WRDS_DATABASE: &str = "wrds";

/// ETFs added to the S&P 500 default universe.
pub const TOP_ETFS: [&str; 16] = [
    "SPY", "QQQ", "DIA", "IWM", "JETS", "XLE", "XLK", "XLF", "XLU", "XLY", "XLP", "XLI", "XLB",
    "XLV", "XLRE", "XLC",
];

const SESSION_OPEN: &str = "09:30:00";
const SESSION_CLOSE: &str = "16:00:00";

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("undefined relation: {0}")]
    Undefined(String),

    #[error("{0}")]
    Other(String),
}

/// The few statements the adapter needs from a SQL connection.
pub trait SqlClient {
    /// Execute and discard the result. Used to probe for tables.
    fn probe(&mut self, sql: &str) -> Result<(), SqlError>;

    /// Run a TAQ select whose column list is [`select_list`] for `kind`.
    fn query_rows(&mut self, kind: DataKind, sql: &str) -> Result<RawRows, SqlError>;

    /// Run a select returning one text column.
    fn query_strings(&mut self, sql: &str) -> Result<Vec<String>, SqlError>;
}

/// Connection settings for [`PostgresClient`].
#[derive(Debug, Clone)]
pub struct PgConnectOptions {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: Option<String>,
    pub require_tls: bool,
}

impl PgConnectOptions {
    pub fn wrds(user: impl Into<String>, password: Option<String>) -> Self {
        Self {
            host: WRDS_HOST.to_string(),
            port: WRDS_PORT,
            dbname: WRDS_DATABASE.to_string(),
            user: user.into(),
            password,
            require_tls: true,
        }
    }
}

/// Blocking PostgreSQL connection with native TLS.
pub struct PostgresClient {
    client: postgres::Client,
}

impl PostgresClient {
    pub fn connect(opts: &PgConnectOptions) -> Result<Self, SourceError> {
        let mut config = postgres::Config::new();
        config
            .host(&opts.host)
            .port(opts.port)
            .dbname(&opts.dbname)
            .user(&opts.user)
            .ssl_mode(if opts.require_tls {
                postgres::config::SslMode::Require
            } else {
                postgres::config::SslMode::Prefer
            });
        if let Some(password) = &opts.password {
            config.password(password);
        }

        let connector = native_tls::TlsConnector::builder()
            .build()
            .map_err(|e| SourceError::Transport(format!("TLS setup: {e}")))?;
        let tls = postgres_native_tls::MakeTlsConnector::new(connector);

        info!(host = %opts.host, user = %opts.user, "connecting to database");
        let client = config
            .connect(tls)
            .map_err(|e| SourceError::Transport(format!("connect to {}: {e}", opts.host)))?;
        Ok(Self { client })
    }
}

fn classify(e: postgres::Error) -> SqlError {
    let message = e.to_string();
    let undefined = matches!(
        e.code(),
        Some(code) if *code == SqlState::UNDEFINED_TABLE || *code == SqlState::INVALID_SCHEMA_NAME
    );
    let lowered = message.to_lowercase();
    if undefined || lowered.contains("does not exist") || lowered.contains("undefined") {
        SqlError::Undefined(message)
    } else {
        SqlError::Other(message)
    }
}

fn get<'r, T: FromSql<'r>>(row: &'r postgres::Row, column: &str) -> Result<T, SqlError> {
    row.try_get(column)
        .map_err(|e| SqlError::Other(format!("column {column}: {e}")))
}

fn decode_trade(row: &postgres::Row) -> Result<TradeRow, SqlError> {
    Ok(TradeRow {
        date: get(row, "date")?,
        time_m: get(row, "time_m")?,
        time_m_nano: get(row, "time_m_nano")?,
        part_time: get(row, "part_time")?,
        trf_time: get(row, "trf_time")?,
        sym_root: get(row, "sym_root")?,
        sym_suffix: get(row, "sym_suffix")?,
        ex: get(row, "ex")?,
        price: get(row, "price")?,
        size: get(row, "size")?,
        tr_corr: get(row, "tr_corr")?,
        tr_id: get(row, "tr_id")?,
        tr_rf: get(row, "tr_rf")?,
        tr_scond: get(row, "tr_scond")?,
        tr_seqnum: get(row, "tr_seqnum")?,
        tr_source: get(row, "tr_source")?,
        tr_stop_ind: get(row, "tr_stop_ind")?,
        tte_ind: get(row, "tte_ind")?,
    })
}

fn decode_quote(row: &postgres::Row) -> Result<QuoteRow, SqlError> {
    Ok(QuoteRow {
        date: get(row, "date")?,
        time_m: get(row, "time_m")?,
        time_m_nano: get(row, "time_m_nano")?,
        sym_root: get(row, "sym_root")?,
        sym_suffix: get(row, "sym_suffix")?,
        ex: get(row, "ex")?,
        bid: get(row, "bid")?,
        bidsiz: get(row, "bidsiz")?,
        ask: get(row, "ask")?,
        asksiz: get(row, "asksiz")?,
        qu_cond: get(row, "qu_cond")?,
        qu_seqnum: get(row, "qu_seqnum")?,
        qu_cancel: get(row, "qu_cancel")?,
        qu_source: get(row, "qu_source")?,
    })
}

fn decode_nbbo(row: &postgres::Row) -> Result<NbboRow, SqlError> {
    Ok(NbboRow {
        date: get(row, "date")?,
        time_m: get(row, "time_m")?,
        time_m_nano: get(row, "time_m_nano")?,
        sym_root: get(row, "sym_root")?,
        sym_suffix: get(row, "sym_suffix")?,
        best_bid: get(row, "best_bid")?,
        best_bidsiz: get(row, "best_bidsiz")?,
        best_ask: get(row, "best_ask")?,
        best_asksiz: get(row, "best_asksiz")?,
        best_bidex: get(row, "best_bidex")?,
        best_askex: get(row, "best_askex")?,
        nbbo_qu_cond: get(row, "nbbo_qu_cond")?,
        secstat_ind: get(row, "secstat_ind")?,
        luld_indicator: get(row, "luld_indicator")?,
        qu_source: get(row, "qu_source")?,
    })
}

impl SqlClient for PostgresClient {
    fn probe(&mut self, sql: &str) -> Result<(), SqlError> {
        self.client.query(sql, &[]).map(|_| ()).map_err(classify)
    }

    fn query_rows(&mut self, kind: DataKind, sql: &str) -> Result<RawRows, SqlError> {
        let rows = self.client.query(sql, &[]).map_err(classify)?;
        Ok(match kind {
            DataKind::Trades => RawRows::Trades(rows.iter().map(decode_trade).collect::<Result<_, _>>()?),
            DataKind::Quotes => RawRows::Quotes(rows.iter().map(decode_quote).collect::<Result<_, _>>()?),
            DataKind::Nbbo => RawRows::Nbbo(rows.iter().map(decode_nbbo).collect::<Result<_, _>>()?),
        })
    }

    fn query_strings(&mut self, sql: &str) -> Result<Vec<String>, SqlError> {
        let rows = self.client.query(sql, &[]).map_err(classify)?;
        rows.iter()
            .map(|row| {
                row.try_get::<_, String>(0)
                    .map_err(|e| SqlError::Other(e.to_string()))
            })
            .collect()
    }
}

/// Daily TAQ table for `kind` on `date`.
pub fn table_name(kind: DataKind, date: NaiveDate) -> String {
    let ymd = date.format("%Y%m%d");
    match kind {
        DataKind::Trades => format!("ctm_{ymd}"),
        DataKind::Quotes => format!("cqm_{ymd}"),
        DataKind::Nbbo => format!("complete_nbbo_{ymd}"),
    }
}

/// Explicit, typed column list per kind. Every column the row struct reads.
pub fn select_list(kind: DataKind) -> &'static str {
    match kind {
        DataKind::Trades => {
            "date, time_m, time_m_nano::int8 AS time_m_nano, part_time, trf_time, \
             sym_root::text AS sym_root, sym_suffix::text AS sym_suffix, ex::text AS ex, \
             price::float8 AS price, size::int8 AS size, tr_corr::text AS tr_corr, \
             tr_id::text AS tr_id, tr_rf::text AS tr_rf, tr_scond::text AS tr_scond, \
             tr_seqnum::int8 AS tr_seqnum, tr_source::text AS tr_source, \
             tr_stop_ind::text AS tr_stop_ind, tte_ind::text AS tte_ind"
        }
        DataKind::Quotes => {
            "date, time_m, time_m_nano::int8 AS time_m_nano, \
             sym_root::text AS sym_root, sym_suffix::text AS sym_suffix, ex::text AS ex, \
             bid::float8 AS bid, bidsiz::int8 AS bidsiz, ask::float8 AS ask, \
             asksiz::int8 AS asksiz, qu_cond::text AS qu_cond, qu_seqnum::int8 AS qu_seqnum, \
             qu_cancel::text AS qu_cancel, qu_source::text AS qu_source"
        }
        DataKind::Nbbo => {
            "date, time_m, time_m_nano::int8 AS time_m_nano, \
             sym_root::text AS sym_root, sym_suffix::text AS sym_suffix, \
             best_bid::float8 AS best_bid, best_bidsiz::int8 AS best_bidsiz, \
             best_ask::float8 AS best_ask, best_asksiz::int8 AS best_asksiz, \
             best_bidex::text AS best_bidex, best_askex::text AS best_askex, \
             nbbo_qu_cond::text AS nbbo_qu_cond, secstat_ind::text AS secstat_ind, \
             luld_indicator::text AS luld_indicator, qu_source::text AS qu_source"
        }
    }
}

fn quote_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Session-window select for one symbol group, keyed by symbol root.
pub fn build_query(kind: DataKind, full_table: &str, roots: &[String]) -> String {
    let (filter, order) = match kind {
        DataKind::Trades => ("tr_corr = '00'", "sym_root, tr_seqnum"),
        DataKind::Quotes => ("bid > 0 AND ask > 0 AND bid < ask", "sym_root, qu_seqnum"),
        DataKind::Nbbo => (
            "best_bid > 0 AND best_ask > 0 AND best_ask >= best_bid",
            "sym_root, time_m, time_m_nano",
        ),
    };
    let in_list = roots
        .iter()
        .map(|r| quote_literal(r))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT {cols} FROM {full_table} \
         WHERE time_m >= '{SESSION_OPEN}' AND time_m <= '{SESSION_CLOSE}' \
         AND {filter} AND sym_root IN ({in_list}) \
         ORDER BY {order}",
        cols = select_list(kind),
    )
}

/// S&P 500 constituents on `date` from CRSP.
pub fn sp500_query(date: NaiveDate) -> String {
    let d = quote_literal(&date.format("%Y-%m-%d").to_string());
    format!(
        "SELECT DISTINCT t1.ticker::text FROM crsp.msenames AS t1 \
         INNER JOIN crsp.msp500list AS t2 ON t1.permno = t2.permno \
         WHERE t2.start <= {d} AND (t2.ending >= {d} OR t2.ending IS NULL) \
         AND t1.namedt <= {d} AND t1.nameendt >= {d} AND t1.ticker IS NOT NULL \
         ORDER BY 1"
    )
}

#[derive(Debug, Clone)]
pub struct DatabaseSourceConfig {
    /// Symbols per query.
    pub chunk_size: usize,
    /// Appended to the S&P 500 when no symbols are given.
    pub extra_symbols: Vec<String>,
}

impl Default for DatabaseSourceConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            extra_symbols: TOP_ETFS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

pub struct DatabaseSource<C> {
    client: C,
    config: DatabaseSourceConfig,
    schemas: HashMap<(String, i32), Option<String>>,
}

impl<C: SqlClient> DatabaseSource<C> {
    pub fn new(client: C, config: DatabaseSourceConfig) -> Self {
        Self {
            client,
            config,
            schemas: HashMap::new(),
        }
    }

    /// Schema holding `table`, probing only on the first call per (table, year).
    ///
    /// An "undefined" error moves on to the next candidate. Any other probe
    /// error is taken to mean the table is there but the probe itself failed.
    pub fn find_schema(&mut self, table: &str, year: i32) -> Option<String> {
        let key = (table.to_string(), year);
        if let Some(cached) = self.schemas.get(&key) {
            return cached.clone();
        }
        let mut found = None;
        for schema in [format!("taqm_{year}"), "taqmsec".to_string()] {
            match self.client.probe(&format!("SELECT 1 FROM {schema}.{table} LIMIT 1")) {
                Ok(()) => {
                    found = Some(schema);
                    break;
                }
                Err(SqlError::Undefined(_)) => continue,
                Err(SqlError::Other(e)) => {
                    debug!(%schema, %table, error = %e, "probe failed, assuming table exists");
                    found = Some(schema);
                    break;
                }
            }
        }
        match &found {
            Some(schema) => debug!(%schema, %table, "resolved table schema"),
            None => debug!(%table, "table not found in any schema"),
        }
        self.schemas.insert(key, found.clone());
        found
    }
}

impl<C: SqlClient> SourceAdapter for DatabaseSource<C> {
    fn name(&self) -> &str {
        "wrds"
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
        let table = table_name(kind, date);
        let schema = self
            .find_schema(&table, date.year())
            .ok_or_else(|| SourceError::Unavailable {
                what: table.clone(),
                date,
            })?;
        let full_table = format!("{schema}.{table}");

        let roots: Vec<String> = symbols
            .iter()
            .map(|s| split_symbol(s).0.to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let groups = symbol_groups(&roots, self.config.chunk_size);
        info!(%kind, %date, table = %full_table, symbols = symbols.len(), groups = groups.len(), "extracting");

        let client = &mut self.client;
        Ok(Box::new(GroupedFetch::new(kind, groups, move |group: &[String]| {
            let sql = build_query(kind, &full_table, group);
            client
                .query_rows(kind, &sql)
                .map_err(|e| SourceError::Query(e.to_string()))
        })))
    }

    fn is_available(&mut self, date: NaiveDate, kinds: &[DataKind]) -> Result<bool, SourceError> {
        for &kind in kinds {
            if self.find_schema(&table_name(kind, date), date.year()).is_none() {
                debug!(%kind, %date, "table missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn default_symbols(&mut self, date: NaiveDate) -> Result<Vec<String>, SourceError> {
        let tickers = self
            .client
            .query_strings(&sp500_query(date))
            .map_err(|e| SourceError::Query(e.to_string()))?;
        let sp500 = tickers.len();
        let all: BTreeSet<String> = tickers
            .into_iter()
            .chain(self.config.extra_symbols.iter().cloned())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        info!(%date, sp500, total = all.len(), "resolved default symbols");
        Ok(all.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::fixtures::trade;
    use std::collections::VecDeque;

    /// Scripted SQL client: probe results keyed by `schema.table`,
    /// query results served in order.
    #[derive(Default)]
    struct FakeSql {
        probes: HashMap<String, Result<(), SqlError>>,
        responses: VecDeque<Result<RawRows, SqlError>>,
        probe_calls: usize,
        queries: Vec<String>,
        tickers: Vec<String>,
    }

    impl SqlClient for FakeSql {
        fn probe(&mut self, sql: &str) -> Result<(), SqlError> {
            self.probe_calls += 1;
            let target = sql
                .trim_start_matches("SELECT 1 FROM ")
                .trim_end_matches(" LIMIT 1");
            match self.probes.get(target) {
                Some(Ok(())) => Ok(()),
                Some(Err(SqlError::Other(m))) => Err(SqlError::Other(m.clone())),
                _ => Err(SqlError::Undefined(format!("relation {target} does not exist"))),
            }
        }

        fn query_rows(&mut self, _kind: DataKind, sql: &str) -> Result<RawRows, SqlError> {
            self.queries.push(sql.to_string());
            self.responses
                .pop_front()
                .unwrap_or_else(|| Ok(RawRows::Trades(Vec::new())))
        }

        fn query_strings(&mut self, _sql: &str) -> Result<Vec<String>, SqlError> {
            Ok(self.tickers.clone())
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn syms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn table_names_follow_taq_convention() {
        assert_eq!(table_name(DataKind::Trades, date()), "ctm_20240102");
        assert_eq!(table_name(DataKind::Quotes, date()), "cqm_20240102");
        assert_eq!(table_name(DataKind::Nbbo, date()), "complete_nbbo_20240102");
    }

    #[test]
    fn query_filters_session_and_escapes_literals() {
        let sql = build_query(DataKind::Quotes, "taqm_2024.cqm_20240102", &syms(&["AAPL", "O'X"]));
        assert!(sql.contains("time_m >= '09:30:00' AND time_m <= '16:00:00'"));
        assert!(sql.contains("bid > 0 AND ask > 0 AND bid < ask"));
        assert!(sql.contains("sym_root IN ('AAPL', 'O''X')"));
        assert!(sql.ends_with("ORDER BY sym_root, qu_seqnum"));
        assert!(!sql.contains("SELECT *"));
    }

    #[test]
    fn schema_discovery_falls_back_and_caches() {
        let mut fake = FakeSql::default();
        fake.probes.insert("taqmsec.ctm_20240102".into(), Ok(()));
        let mut source = DatabaseSource::new(fake, DatabaseSourceConfig::default());

        assert_eq!(source.find_schema("ctm_20240102", 2024).as_deref(), Some("taqmsec"));
        assert_eq!(source.find_schema("ctm_20240102", 2024).as_deref(), Some("taqmsec"));
        assert_eq!(source.client.probe_calls, 2);
    }

    #[test]
    fn non_undefined_probe_error_assumes_table_exists() {
        let mut fake = FakeSql::default();
        fake.probes.insert(
            "taqm_2024.ctm_20240102".into(),
            Err(SqlError::Other("permission denied".into())),
        );
        let mut source = DatabaseSource::new(fake, DatabaseSourceConfig::default());
        assert_eq!(source.find_schema("ctm_20240102", 2024).as_deref(), Some("taqm_2024"));
    }

    #[test]
    fn missing_table_is_unavailable() {
        let mut source = DatabaseSource::new(FakeSql::default(), DatabaseSourceConfig::default());
        assert!(!source.is_available(date(), &[DataKind::Trades]).unwrap());
        let err = source
            .extract(DataKind::Trades, date(), &syms(&["AAPL"]))
            .err()
            .unwrap();
        assert!(err.is_unavailable());
    }

    #[test]
    fn failing_group_is_isolated() {
        let mut fake = FakeSql::default();
        fake.probes.insert("taqm_2024.ctm_20240102".into(), Ok(()));
        for i in 0..5 {
            if i == 1 {
                fake.responses.push_back(Err(SqlError::Other("canceling statement".into())));
            } else {
                fake.responses.push_back(Ok(RawRows::Trades(vec![
                    trade(&format!("S{i}"), 0, 1.0),
                    trade(&format!("S{i}"), 1, 1.0),
                ])));
            }
        }
        let config = DatabaseSourceConfig {
            chunk_size: 1,
            ..Default::default()
        };
        let mut source = DatabaseSource::new(fake, config);
        let symbols = syms(&["S0", "S1", "S2", "S3", "S4"]);

        let rows: usize = source
            .extract(DataKind::Trades, date(), &symbols)
            .unwrap()
            .map(|b| b.len())
            .sum();

        assert_eq!(rows, 8);
        assert_eq!(source.client.queries.len(), 5);
    }

    #[test]
    fn suffixed_symbols_query_by_root() {
        let mut fake = FakeSql::default();
        fake.probes.insert("taqm_2024.ctm_20240102".into(), Ok(()));
        let mut source = DatabaseSource::new(fake, DatabaseSourceConfig::default());
        let _: Vec<RawRows> = source
            .extract(DataKind::Trades, date(), &syms(&["BRK.A", "BRK.B", "AAPL"]))
            .unwrap()
            .collect();
        assert_eq!(source.client.queries.len(), 1);
        assert!(source.client.queries[0].contains("sym_root IN ('AAPL', 'BRK')"));
    }

    #[test]
    fn default_symbols_merge_etfs() {
        let fake = FakeSql {
            tickers: syms(&["AAPL", "SPY", "MSFT"]),
            ..Default::default()
        };
        let mut source = DatabaseSource::new(fake, DatabaseSourceConfig::default());
        let symbols = source.default_symbols(date()).unwrap();
        assert_eq!(symbols.len(), 2 + TOP_ETFS.len());
        assert!(symbols.windows(2).all(|w| w[0] < w[1]));
    }
}
