//! Property tests for the pure helpers.
//!
//! 1. Canonical symbol: trimming only, suffix joined with a dot
//! 2. Symbol split inverts the canonical form
//! 3. Directory names: plain and tuple encodings decode to the same symbol
//! 4. Weekday filter: keeps exactly Monday to Friday, in order
//! 5. Event time: sub-second nanos are added after UTC conversion

use chrono::{Datelike, Duration, NaiveDate, NaiveTime, Timelike, Weekday};
use proptest::prelude::*;
use taqstage_core::calendar::{get_date_range, trading_days};
use taqstage_core::canonicalize::{canonical_event_time, canonical_symbol, split_symbol};
use taqstage_core::store::parse_symbol_dir_name;

// ── Strategies ───────────────────────────────────────────────────────

fn arb_root() -> impl Strategy<Value = String> {
    "[A-Z]{1,5}"
}

fn arb_suffix() -> impl Strategy<Value = Option<String>> {
    prop::option::of("[A-Z]{1,2}")
}

fn arb_date() -> impl Strategy<Value = NaiveDate> {
    (0i64..3650).prop_map(|d| NaiveDate::from_ymd_opt(2015, 1, 1).unwrap() + Duration::days(d))
}

// ── 1-3. Symbols ─────────────────────────────────────────────────────

proptest! {
    #[test]
    fn canonical_symbol_trims_and_joins(
        root in arb_root(),
        suffix in arb_suffix(),
        pad_l in " {0,3}",
        pad_r in " {0,3}",
    ) {
        let padded_root = format!("{pad_l}{root}{pad_r}");
        let padded_suffix = suffix.as_ref().map(|s| format!("{pad_r}{s}{pad_l}"));
        let canonical = canonical_symbol(&padded_root, padded_suffix.as_deref());
        let expected = match &suffix {
            Some(s) => format!("{root}.{s}"),
            None => root.clone(),
        };
        prop_assert_eq!(&canonical, &expected);

        let (r, s) = split_symbol(&canonical);
        prop_assert_eq!(r, root.as_str());
        prop_assert_eq!(s, suffix.as_deref());
    }

    #[test]
    fn blank_suffix_is_ignored(root in arb_root(), blank in " {0,4}") {
        prop_assert_eq!(canonical_symbol(&root, Some(blank.as_str())), root.clone());
        prop_assert_eq!(canonical_symbol(&root, None), root);
    }

    #[test]
    fn directory_encodings_agree(root in arb_root(), suffix in arb_suffix()) {
        let symbol = canonical_symbol(&root, suffix.as_deref());
        let plain = parse_symbol_dir_name(&format!("symbol={symbol}"));
        let single = parse_symbol_dir_name(&format!("symbol=('{symbol}',)"));
        let double = parse_symbol_dir_name(&format!("symbol=(\"{symbol}\",)"));
        prop_assert_eq!(plain.as_deref(), Some(symbol.as_str()));
        prop_assert_eq!(single, plain.clone());
        prop_assert_eq!(double, plain);
    }
}

// ── 4. Weekday filter ────────────────────────────────────────────────

proptest! {
    #[test]
    fn trading_days_are_the_weekdays_of_the_range(start in arb_date(), len in 0i64..40) {
        let end = start + Duration::days(len);
        let all = get_date_range(start, end).unwrap();
        let days = trading_days(start, end).unwrap();

        prop_assert_eq!(all.len() as i64, len + 1);
        prop_assert!(days.windows(2).all(|w| w[0] < w[1]));
        prop_assert!(days.iter().all(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun)));
        let expected = all
            .iter()
            .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
            .count();
        prop_assert_eq!(days.len(), expected);
    }

    #[test]
    fn inverted_range_is_rejected(start in arb_date(), back in 1i64..30) {
        prop_assert!(trading_days(start, start - Duration::days(back)).is_err());
    }
}

// ── 5. Event time ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn nanos_are_added_after_conversion(
        date in arb_date(),
        secs in (9 * 3600u32 + 1800)..(16 * 3600u32),
        nanos in 0i64..1_000_000_000,
    ) {
        let tz = chrono_tz::America::New_York;
        let time = NaiveTime::from_num_seconds_from_midnight_opt(secs, 0).unwrap();
        let whole = canonical_event_time(date, time, None, tz);
        let precise = canonical_event_time(date, time, Some(nanos), tz);

        prop_assert_eq!((precise - whole).num_nanoseconds(), Some(nanos));
        prop_assert_eq!(whole.nanosecond(), 0);
        // Session hours never straddle a DST transition.
        let offset_hours = (time.num_seconds_from_midnight() as i64 - whole.time().num_seconds_from_midnight() as i64)
            .rem_euclid(86_400) / 3600;
        prop_assert!(offset_hours == 19 || offset_hours == 20);
    }
}
