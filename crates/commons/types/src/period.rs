//! Calendar-period arithmetic.
//!
//! The accrual and ledger engines reason in whole calendar months (UTC).
//! Periods are half-open: `[month_start(t), next_month_start(t))`.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};

/// First instant of the calendar month containing `t`.
pub fn month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    // The first of an existing month is always a valid date.
    let first = NaiveDate::from_ymd_opt(t.year(), t.month(), 1)
        .expect("first of month")
        .and_hms_opt(0, 0, 0)
        .expect("midnight");
    Utc.from_utc_datetime(&first)
}

/// First instant of the month after the one containing `t`.
pub fn next_month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .expect("first of month")
        .and_hms_opt(0, 0, 0)
        .expect("midnight");
    Utc.from_utc_datetime(&first)
}

/// First instant of the month before the one containing `t`.
pub fn prev_month_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if t.month() == 1 {
        (t.year() - 1, 12)
    } else {
        (t.year(), t.month() - 1)
    };
    let first = NaiveDate::from_ymd_opt(year, month, 1)
        .expect("first of month")
        .and_hms_opt(0, 0, 0)
        .expect("midnight");
    Utc.from_utc_datetime(&first)
}

/// Last instant before the next month, convenient for inclusive queries.
pub fn month_end(t: DateTime<Utc>) -> DateTime<Utc> {
    next_month_start(t) - chrono::Duration::milliseconds(1)
}

pub fn days_in_month(t: DateTime<Utc>) -> i64 {
    (next_month_start(t) - month_start(t)).num_days()
}

pub fn hours_in_month(t: DateTime<Utc>) -> i64 {
    (next_month_start(t) - month_start(t)).num_hours()
}

/// Midnight UTC of the day containing `t`.
pub fn day_start(t: DateTime<Utc>) -> DateTime<Utc> {
    let midnight = t.date_naive().and_hms_opt(0, 0, 0).expect("midnight");
    Utc.from_utc_datetime(&midnight)
}

/// True when `a` and `b` fall in the same calendar month.
pub fn same_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}
