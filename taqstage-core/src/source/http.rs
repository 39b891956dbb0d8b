//! Alpaca market-data adapter.
//!
//! Trades come from `/v2/stocks/{symbol}/trades` and the top-of-book quote
//! stream from `/v2/stocks/{symbol}/quotes`, which is the closest thing the
//! API offers to an NBBO feed. Exchange-level quotes are not served.

use super::{symbol_groups, BatchStream, GroupedFetch, RetryPolicy, SourceAdapter, SourceError};
use crate::canonicalize::split_symbol;
use crate::domain::DataKind;
use crate::schema::{NbboRow, RawRows, TradeRow};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const SOURCE_TAG: &str = "ALPACA";

/// Result of one GET.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Minimal blocking GET, so tests can script responses.
pub trait HttpTransport {
    fn get(
        &mut self,
        url: &str,
        query: &[(String, String)],
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, SourceError>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(
        &mut self,
        url: &str,
        query: &[(String, String)],
        headers: &[(&str, &str)],
    ) -> Result<HttpResponse, SourceError> {
        let mut request = self.client.get(url).query(query);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = request
            .send()
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .map_err(|e| SourceError::Transport(format!("reading body: {e}")))?;
        Ok(HttpResponse { status, body })
    }
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub api_key: String,
    pub secret_key: String,
    /// `sip`, `iex`, or `None` for the account default.
    pub feed: Option<String>,
    pub page_limit: u32,
    pub chunk_size: usize,
    /// Zone the session window and local `time_m` are expressed in.
    pub timezone: Tz,
    /// Symbol used to check whether a date has data at all.
    pub probe_symbol: String,
    pub timeout: Duration,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.alpaca.markets".to_string(),
            api_key: String::new(),
            secret_key: String::new(),
            feed: Some("sip".to_string()),
            page_limit: 10_000,
            chunk_size: 50,
            timezone: chrono_tz::America::New_York,
            probe_symbol: "SPY".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TradesPage {
    #[serde(default)]
    trades: Option<Vec<WireTrade>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireTrade {
    t: String,
    #[serde(default)]
    x: Option<String>,
    p: f64,
    s: i64,
    #[serde(default)]
    i: Option<serde_json::Value>,
    #[serde(default)]
    c: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct QuotesPage {
    #[serde(default)]
    quotes: Option<Vec<WireQuote>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireQuote {
    t: String,
    #[serde(default)]
    bx: Option<String>,
    bp: f64,
    bs: i64,
    #[serde(default)]
    ax: Option<String>,
    ap: f64,
    #[serde(rename = "as")]
    asize: i64,
    #[serde(default)]
    c: Option<Vec<String>>,
}

/// Split an RFC 3339 UTC stamp into local date, whole-second local time and
/// the sub-second nanoseconds.
fn local_parts(stamp: &str, tz: Tz) -> Result<(NaiveDate, NaiveTime, i64), SourceError> {
    let utc = DateTime::parse_from_rfc3339(stamp)
        .map_err(|e| SourceError::Decode(format!("timestamp {stamp:?}: {e}")))?
        .with_timezone(&Utc);
    let local = utc.with_timezone(&tz);
    let nanos = i64::from(local.nanosecond() % 1_000_000_000);
    let time = local
        .time()
        .with_nanosecond(0)
        .ok_or_else(|| SourceError::Decode(format!("timestamp {stamp:?}")))?;
    Ok((local.date_naive(), time, nanos))
}

fn join_conditions(c: Option<Vec<String>>) -> Option<String> {
    c.filter(|c| !c.is_empty()).map(|c| c.join(""))
}

fn trade_row(symbol: &str, wire: WireTrade, tz: Tz) -> Result<TradeRow, SourceError> {
    let (date, time_m, nanos) = local_parts(&wire.t, tz)?;
    let (root, suffix) = split_symbol(symbol);
    Ok(TradeRow {
        date,
        time_m,
        time_m_nano: Some(nanos),
        part_time: None,
        trf_time: None,
        sym_root: root.to_string(),
        sym_suffix: suffix.map(str::to_string),
        ex: wire.x,
        price: wire.p,
        size: wire.s,
        tr_corr: None,
        tr_id: wire.i.map(|v| match v {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        }),
        tr_rf: None,
        tr_scond: join_conditions(wire.c),
        tr_seqnum: None,
        tr_source: Some(SOURCE_TAG.to_string()),
        tr_stop_ind: None,
        tte_ind: None,
    })
}

fn nbbo_row(symbol: &str, wire: WireQuote, tz: Tz) -> Result<NbboRow, SourceError> {
    let (date, time_m, nanos) = local_parts(&wire.t, tz)?;
    let (root, suffix) = split_symbol(symbol);
    Ok(NbboRow {
        date,
        time_m,
        time_m_nano: Some(nanos),
        sym_root: root.to_string(),
        sym_suffix: suffix.map(str::to_string),
        best_bid: wire.bp,
        best_bidsiz: wire.bs,
        best_ask: wire.ap,
        best_asksiz: wire.asize,
        best_bidex: wire.bx,
        best_askex: wire.ax,
        nbbo_qu_cond: join_conditions(wire.c),
        secstat_ind: None,
        luld_indicator: None,
        qu_source: Some(SOURCE_TAG.to_string()),
    })
}

fn endpoint(kind: DataKind) -> Option<&'static str> {
    match kind {
        DataKind::Trades => Some("trades"),
        DataKind::Nbbo => Some("quotes"),
        DataKind::Quotes => None,
    }
}

/// Regular session on `date` as UTC RFC 3339 bounds.
fn session_window(date: NaiveDate, tz: Tz) -> Result<(String, String), SourceError> {
    let bound = |h: u32, m: u32| {
        let naive = date
            .and_hms_opt(h, m, 0)
            .ok_or_else(|| SourceError::Config(format!("invalid session time on {date}")))?;
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc).to_rfc3339_opts(SecondsFormat::Secs, true))
            .ok_or_else(|| SourceError::Config(format!("session bound missing on {date} in {tz}")))
    };
    Ok((bound(9, 30)?, bound(16, 0)?))
}

fn is_retryable(e: &SourceError) -> bool {
    match e {
        SourceError::Transport(_) => true,
        SourceError::Http { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

/// One page request with retries on rate limits, server errors and dropped
/// connections.
fn get_page<T: HttpTransport>(
    transport: &mut T,
    config: &HttpSourceConfig,
    retry: &RetryPolicy,
    url: &str,
    query: &[(String, String)],
) -> Result<HttpResponse, SourceError> {
    let headers = [
        ("APCA-API-KEY-ID", config.api_key.as_str()),
        ("APCA-API-SECRET-KEY", config.secret_key.as_str()),
    ];
    retry.run(
        |_| {
            let response = transport.get(url, query, &headers)?;
            if response.status == 429 || response.status >= 500 {
                return Err(SourceError::Http {
                    status: response.status,
                    body: response.body,
                });
            }
            Ok(response)
        },
        is_retryable,
    )
}

/// All pages for one symbol, following `next_page_token`.
///
/// A 404 under a non-IEX feed is retried once without the feed parameter;
/// a 404 after that means the symbol has no data for the day.
fn fetch_symbol<T: HttpTransport>(
    transport: &mut T,
    config: &HttpSourceConfig,
    retry: &RetryPolicy,
    kind: DataKind,
    date: NaiveDate,
    symbol: &str,
    limit: u32,
    max_pages: Option<usize>,
) -> Result<RawRows, SourceError> {
    let path = endpoint(kind).ok_or_else(|| SourceError::UnsupportedKind {
        source_name: "alpaca".to_string(),
        kind,
    })?;
    let url = format!("{}/v2/stocks/{}/{}", config.base_url.trim_end_matches('/'), symbol, path);
    let (start, end) = session_window(date, config.timezone)?;

    let mut out = RawRows::empty(kind);
    let mut feed = config.feed.clone();
    let mut page_token: Option<String> = None;
    let mut pages = 0usize;

    loop {
        let mut query = vec![
            ("start".to_string(), start.clone()),
            ("end".to_string(), end.clone()),
            ("limit".to_string(), limit.to_string()),
        ];
        if let Some(f) = &feed {
            query.push(("feed".to_string(), f.clone()));
        }
        if let Some(token) = &page_token {
            query.push(("page_token".to_string(), token.clone()));
        }

        let response = get_page(transport, config, retry, &url, &query)?;
        match response.status {
            200 => {}
            404 if page_token.is_none() && feed.as_deref().is_some_and(|f| f != "iex") => {
                warn!(%symbol, feed = ?feed, "not found under feed, retrying without it");
                feed = None;
                continue;
            }
            404 => {
                debug!(%symbol, %kind, %date, "no data");
                break;
            }
            status => {
                return Err(SourceError::Http {
                    status,
                    body: response.body,
                })
            }
        }

        let next = match kind {
            DataKind::Trades => {
                let page: TradesPage = serde_json::from_str(&response.body)
                    .map_err(|e| SourceError::Decode(format!("{symbol} trades page: {e}")))?;
                let rows = page
                    .trades
                    .unwrap_or_default()
                    .into_iter()
                    .map(|w| trade_row(symbol, w, config.timezone))
                    .collect::<Result<Vec<_>, _>>()?;
                out.append(RawRows::Trades(rows))
                    .map_err(|e| SourceError::Decode(e.to_string()))?;
                page.next_page_token
            }
            _ => {
                let page: QuotesPage = serde_json::from_str(&response.body)
                    .map_err(|e| SourceError::Decode(format!("{symbol} quotes page: {e}")))?;
                let rows = page
                    .quotes
                    .unwrap_or_default()
                    .into_iter()
                    .map(|w| nbbo_row(symbol, w, config.timezone))
                    .collect::<Result<Vec<_>, _>>()?;
                out.append(RawRows::Nbbo(rows))
                    .map_err(|e| SourceError::Decode(e.to_string()))?;
                page.next_page_token
            }
        };

        pages += 1;
        match next.filter(|t| !t.is_empty()) {
            Some(token) if max_pages.map_or(true, |m| pages < m) => page_token = Some(token),
            _ => break,
        }
    }

    debug!(%symbol, %kind, pages, rows = out.len(), "symbol fetched");
    Ok(out)
}

pub struct HttpSource<T> {
    transport: T,
    config: HttpSourceConfig,
    retry: RetryPolicy,
}

impl HttpSource<ReqwestTransport> {
    pub fn connect(config: HttpSourceConfig, retry: RetryPolicy) -> Result<Self, SourceError> {
        if config.api_key.is_empty() || config.secret_key.is_empty() {
            return Err(SourceError::Config(
                "alpaca source needs both an API key and a secret key".to_string(),
            ));
        }
        let transport = ReqwestTransport::new(config.timeout)?;
        Ok(Self::new(transport, config, retry))
    }
}

impl<T: HttpTransport> HttpSource<T> {
    pub fn new(transport: T, config: HttpSourceConfig, retry: RetryPolicy) -> Self {
        Self {
            transport,
            config,
            retry,
        }
    }
}

impl<T: HttpTransport> SourceAdapter for HttpSource<T> {
    fn name(&self) -> &str {
        "alpaca"
    }

    fn supports(&self, kind: DataKind) -> bool {
        endpoint(kind).is_some()
    }

    fn extract<'a>(
        &'a mut self,
        kind: DataKind,
        date: NaiveDate,
        symbols: &[String],
    ) -> Result<BatchStream<'a>, SourceError> {
        if !self.supports(kind) {
            return Err(SourceError::UnsupportedKind {
                source_name: self.name().to_string(),
                kind,
            });
        }
        let groups = symbol_groups(symbols, self.config.chunk_size);
        info!(%kind, %date, symbols = symbols.len(), groups = groups.len(), "extracting");

        let transport = &mut self.transport;
        let config = &self.config;
        let retry = &self.retry;
        let limit = config.page_limit;
        Ok(Box::new(GroupedFetch::new(kind, groups, move |group: &[String]| {
            let mut rows = RawRows::empty(kind);
            for symbol in group {
                let fetched =
                    fetch_symbol(&mut *transport, config, retry, kind, date, symbol, limit, None)?;
                rows.append(fetched)
                    .map_err(|e| SourceError::Decode(e.to_string()))?;
            }
            Ok(rows)
        })))
    }

    /// One single-row request per kind against the probe symbol.
    fn is_available(&mut self, date: NaiveDate, kinds: &[DataKind]) -> Result<bool, SourceError> {
        for &kind in kinds {
            if !self.supports(kind) {
                return Ok(false);
            }
            let probe = fetch_symbol(
                &mut self.transport,
                &self.config,
                &self.retry,
                kind,
                date,
                &self.config.probe_symbol,
                1,
                Some(1),
            )?;
            if probe.is_empty() {
                debug!(%kind, %date, symbol = %self.config.probe_symbol, "probe returned nothing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn default_symbols(&mut self, _date: NaiveDate) -> Result<Vec<String>, SourceError> {
        Err(SourceError::Config(
            "alpaca has no default universe; pass symbols explicitly".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct ScriptedTransport {
        responses: VecDeque<Result<HttpResponse, SourceError>>,
        requests: Vec<(String, Vec<(String, String)>)>,
    }

    impl ScriptedTransport {
        fn push(&mut self, status: u16, body: &str) {
            self.responses.push_back(Ok(HttpResponse {
                status,
                body: body.to_string(),
            }));
        }
    }

    impl HttpTransport for ScriptedTransport {
        fn get(
            &mut self,
            url: &str,
            query: &[(String, String)],
            headers: &[(&str, &str)],
        ) -> Result<HttpResponse, SourceError> {
            assert!(headers.iter().any(|(k, _)| *k == "APCA-API-KEY-ID"));
            self.requests.push((url.to_string(), query.to_vec()));
            self.responses.pop_front().unwrap_or(Ok(HttpResponse {
                status: 404,
                body: String::new(),
            }))
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    }

    fn source(transport: ScriptedTransport) -> HttpSource<ScriptedTransport> {
        let config = HttpSourceConfig {
            api_key: "key".into(),
            secret_key: "secret".into(),
            ..Default::default()
        };
        HttpSource::new(transport, config, RetryPolicy::immediate(3))
    }

    fn param<'q>(query: &'q [(String, String)], name: &str) -> Option<&'q str> {
        query.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    const TRADE_PAGE_1: &str = r#"{"trades":[{"t":"2024-01-02T14:30:00.123456789Z","x":"V","p":185.5,"s":100,"i":52983525029461,"c":["@"]}],"symbol":"AAPL","next_page_token":"abc"}"#;
    const TRADE_PAGE_2: &str = r#"{"trades":[{"t":"2024-01-02T14:30:01Z","x":"Q","p":185.6,"s":5,"c":["@","I"]}],"symbol":"AAPL","next_page_token":null}"#;

    fn syms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn follows_page_tokens() {
        let mut transport = ScriptedTransport::default();
        transport.push(200, TRADE_PAGE_1);
        transport.push(200, TRADE_PAGE_2);
        let mut src = source(transport);

        let batches: Vec<RawRows> = src
            .extract(DataKind::Trades, date(), &syms(&["AAPL"]))
            .unwrap()
            .collect();

        assert_eq!(batches.iter().map(RawRows::len).sum::<usize>(), 2);
        let requests = &src.transport.requests;
        assert_eq!(requests.len(), 2);
        assert!(requests[0].0.ends_with("/v2/stocks/AAPL/trades"));
        assert_eq!(param(&requests[0].1, "start"), Some("2024-01-02T14:30:00Z"));
        assert_eq!(param(&requests[0].1, "end"), Some("2024-01-02T21:00:00Z"));
        assert_eq!(param(&requests[1].1, "page_token"), Some("abc"));
    }

    #[test]
    fn timestamps_split_into_local_seconds_and_nanos() {
        let mut transport = ScriptedTransport::default();
        transport.push(200, TRADE_PAGE_1.replace("\"abc\"", "null").as_str());
        let mut src = source(transport);

        let batch = src
            .extract(DataKind::Trades, date(), &syms(&["AAPL"]))
            .unwrap()
            .next()
            .unwrap();
        let RawRows::Trades(rows) = batch else {
            panic!("expected trades");
        };
        assert_eq!(rows[0].date, date());
        assert_eq!(rows[0].time_m, NaiveTime::from_hms_opt(9, 30, 0).unwrap());
        assert_eq!(rows[0].time_m_nano, Some(123_456_789));
        assert_eq!(rows[0].tr_id.as_deref(), Some("52983525029461"));
        assert_eq!(rows[0].tr_source.as_deref(), Some("ALPACA"));
    }

    #[test]
    fn not_found_under_sip_retries_without_feed() {
        let mut transport = ScriptedTransport::default();
        transport.push(404, "not found");
        transport.push(200, TRADE_PAGE_2);
        let mut src = source(transport);

        let rows: usize = src
            .extract(DataKind::Trades, date(), &syms(&["AAPL"]))
            .unwrap()
            .map(|b| b.len())
            .sum();

        assert_eq!(rows, 1);
        let requests = &src.transport.requests;
        assert_eq!(param(&requests[0].1, "feed"), Some("sip"));
        assert_eq!(param(&requests[1].1, "feed"), None);
    }

    #[test]
    fn second_not_found_means_empty() {
        let mut transport = ScriptedTransport::default();
        transport.push(404, "");
        transport.push(404, "");
        let mut src = source(transport);
        let rows: Vec<RawRows> = src
            .extract(DataKind::Trades, date(), &syms(&["ZZZZ"]))
            .unwrap()
            .collect();
        assert!(rows.is_empty());
        assert_eq!(src.transport.requests.len(), 2);
    }

    #[test]
    fn rate_limit_is_retried() {
        let mut transport = ScriptedTransport::default();
        transport.push(429, "too many requests");
        transport.push(200, TRADE_PAGE_2);
        let mut src = source(transport);
        let rows: usize = src
            .extract(DataKind::Trades, date(), &syms(&["AAPL"]))
            .unwrap()
            .map(|b| b.len())
            .sum();
        assert_eq!(rows, 1);
        assert_eq!(src.transport.requests.len(), 2);
    }

    #[test]
    fn auth_failure_skips_group() {
        let mut transport = ScriptedTransport::default();
        transport.push(403, "forbidden");
        let mut src = source(transport);
        let rows: Vec<RawRows> = src
            .extract(DataKind::Trades, date(), &syms(&["AAPL"]))
            .unwrap()
            .collect();
        assert!(rows.is_empty());
        assert_eq!(src.transport.requests.len(), 1);
    }

    #[test]
    fn quotes_map_to_nbbo_rows() {
        let mut transport = ScriptedTransport::default();
        transport.push(
            200,
            r#"{"quotes":[{"t":"2024-01-02T15:00:00.5Z","bx":"Q","bp":99.9,"bs":3,"ax":"P","ap":100.1,"as":5,"c":["R"]}],"next_page_token":null}"#,
        );
        let mut src = source(transport);
        let batch = src
            .extract(DataKind::Nbbo, date(), &syms(&["BRK.B"]))
            .unwrap()
            .next()
            .unwrap();
        let RawRows::Nbbo(rows) = batch else {
            panic!("expected nbbo");
        };
        assert_eq!(rows[0].sym_root, "BRK");
        assert_eq!(rows[0].sym_suffix.as_deref(), Some("B"));
        assert_eq!(rows[0].best_asksiz, 5);
        assert_eq!(rows[0].time_m_nano, Some(500_000_000));
        assert!(src.transport.requests[0].0.ends_with("/v2/stocks/BRK.B/quotes"));
    }

    #[test]
    fn exchange_quotes_are_unsupported() {
        let mut src = source(ScriptedTransport::default());
        assert!(!src.supports(DataKind::Quotes));
        let err = src
            .extract(DataKind::Quotes, date(), &syms(&["AAPL"]))
            .err()
            .unwrap();
        assert!(err.is_unavailable());
        assert!(!src.is_available(date(), &[DataKind::Quotes]).unwrap());
    }

    #[test]
    fn availability_probes_one_row() {
        let mut transport = ScriptedTransport::default();
        transport.push(200, TRADE_PAGE_1);
        let mut src = source(transport);
        assert!(src.is_available(date(), &[DataKind::Trades]).unwrap());
        let requests = &src.transport.requests;
        assert_eq!(requests.len(), 1);
        assert_eq!(param(&requests[0].1, "limit"), Some("1"));
        assert!(requests[0].0.contains("/SPY/"));
    }
}
