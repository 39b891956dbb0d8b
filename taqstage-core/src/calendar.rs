//! Trading-day calendar: inclusive date ranges with a weekday filter.
//!
//! There is no holiday calendar. Holidays surface as "unavailable" from the
//! source's availability probe instead.

use chrono::{Datelike, NaiveDate, Weekday};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum CalendarError {
    #[error("start date {start} is after end date {end}")]
    InvertedRange { start: NaiveDate, end: NaiveDate },

    #[error("invalid date '{0}' (expected YYYY-MM-DD or YYYYMMDD)")]
    InvalidDate(String),
}

/// Every calendar date from `start` to `end`, both inclusive.
pub fn get_date_range(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>, CalendarError> {
    if start > end {
        return Err(CalendarError::InvertedRange { start, end });
    }
    Ok(start.iter_days().take_while(|d| *d <= end).collect())
}

pub fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

pub fn filter_trading_days(dates: &[NaiveDate]) -> Vec<NaiveDate> {
    dates.iter().copied().filter(|d| is_weekday(*d)).collect()
}

/// Weekdays in `[start, end]`.
pub fn trading_days(start: NaiveDate, end: NaiveDate) -> Result<Vec<NaiveDate>, CalendarError> {
    Ok(filter_trading_days(&get_date_range(start, end)?))
}

/// Accepts `2024-01-02` and `20240102`.
pub fn parse_date(s: &str) -> Result<NaiveDate, CalendarError> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y%m%d"))
        .map_err(|_| CalendarError::InvalidDate(s.to_string()))
}
