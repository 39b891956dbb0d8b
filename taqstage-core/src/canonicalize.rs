//! Canonical symbol and event-time derivation, plus the per-run context
//! that attaches the derived columns to raw provider rows.

use crate::schema::{RawRows, RecordBatch};
use chrono::offset::LocalResult;
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use uuid::Uuid;

/// `root` or `root.suffix`, both trimmed. Case is preserved.
pub fn canonical_symbol(root: &str, suffix: Option<&str>) -> String {
    let root = root.trim();
    match suffix.map(str::trim) {
        Some(s) if !s.is_empty() => format!("{root}.{s}"),
        _ => root.to_string(),
    }
}

/// Inverse of [`canonical_symbol`]: `"BRK.A"` is root `BRK`, suffix `A`.
pub fn split_symbol(symbol: &str) -> (&str, Option<&str>) {
    let symbol = symbol.trim();
    match symbol.split_once('.') {
        Some((root, suffix)) if !suffix.is_empty() => (root, Some(suffix)),
        Some((root, _)) => (root, None),
        None => (symbol, None),
    }
}

/// Localize `date + time_of_day` in `tz`, convert to UTC, then add the
/// sub-second remainder in nanoseconds.
///
/// Ambiguous local times (autumn fall-back) resolve to the earlier instant.
/// Local times inside the spring-forward gap are read with the offset in
/// force just before the transition.
pub fn canonical_event_time(
    date: NaiveDate,
    time_of_day: NaiveTime,
    sub_second_ns: Option<i64>,
    tz: Tz,
) -> DateTime<Utc> {
    let naive = NaiveDateTime::new(date, time_of_day);
    let utc = match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let offset = tz
                .from_local_datetime(&(naive - Duration::days(1)))
                .earliest()
                .map(|dt| dt.offset().fix())
                .unwrap_or_else(|| tz.offset_from_utc_datetime(&naive).fix());
            let shifted = naive - Duration::seconds(i64::from(offset.local_minus_utc()));
            Utc.from_utc_datetime(&shifted)
        }
    };
    utc + Duration::nanoseconds(sub_second_ns.unwrap_or(0))
}

/// Identity and settings shared by every batch of one orchestrator invocation.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub timezone: Tz,
}

impl RunContext {
    pub fn new(timezone: Tz) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timezone,
        }
    }

    /// Attach `trade_date`, `symbol`, `ts_event`, `extract_run_id` and `ingest_ts`.
    pub fn enrich(&self, trade_date: NaiveDate, rows: RawRows) -> RecordBatch {
        let n = rows.len();
        let mut symbols = Vec::with_capacity(n);
        let mut ts_event = Vec::with_capacity(n);
        for row in rows.iter() {
            symbols.push(canonical_symbol(row.sym_root(), row.sym_suffix()));
            ts_event.push(canonical_event_time(
                row.date(),
                row.time_m(),
                row.time_m_nano(),
                self.timezone,
            ));
        }
        RecordBatch {
            trade_date,
            extract_run_id: self.run_id,
            symbols,
            ts_event,
            ingest_ts: vec![Utc::now(); n],
            rows,
        }
    }
}
