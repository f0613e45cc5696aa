//! Due-instant cursor
//!
//! Every due instant is the end of a local day (23:59:59 in the calendar of the
//! instant passed in). Month and year cadences follow cron calendar rules: the
//! anchor day-of-month (and month, for years) is kept, and periods where that
//! day does not exist are skipped rather than clamped. A loan disbursed on the
//! 31st is therefore billed on Jan 31, Mar 31, May 31, ...; one disbursed on
//! Feb 29 is billed only in leap years.

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, TimeZone};

use super::{ScheduleError, TenureUnit};

/// Months scanned before giving up on an anchor day (day 31 needs at most 2)
const MAX_MONTH_SCAN: u32 = 12;
/// Years scanned before giving up on Feb 29 (the gap across 2100 is 8)
const MAX_YEAR_SCAN: i32 = 8;

/// Normalise an instant to 23:59:59 of the same local day
pub fn end_of_day<Tz: TimeZone>(at: &DateTime<Tz>) -> Result<DateTime<Tz>, ScheduleError> {
    local_end_of_day(&at.timezone(), at.date_naive())
}

/// Next due instant after `from` for the given cadence
///
/// * `Day`: the following day
/// * `Week`: the same weekday one week later
/// * `Month`: the next month containing `from`'s day-of-month
/// * `Year`: the next year containing `from`'s month and day
pub fn next_due<Tz: TimeZone>(
    from: &DateTime<Tz>,
    unit: TenureUnit,
) -> Result<DateTime<Tz>, ScheduleError> {
    let date = from.date_naive();
    let overflow = || ScheduleError::CalendarOverflow {
        unit,
        from: from.naive_local(),
    };

    let next = match unit {
        TenureUnit::Day => date.checked_add_days(Days::new(1)),
        TenureUnit::Week => date.checked_add_days(Days::new(7)),
        TenureUnit::Month => next_month_with_day(date),
        TenureUnit::Year => next_year_with_month_day(date),
    }
    .ok_or_else(overflow)?;

    local_end_of_day(&from.timezone(), next)
}

/// Due instant of the window a payment made at `now` settles
///
/// Starts from the first due instant after disbursement and advances until
/// the instant is no longer before `now`. Skipped windows are not collected
/// here; the caller settles every pending billing due on or before the
/// returned instant.
pub fn settlement_window<Tz: TimeZone>(
    disbursed_at: &DateTime<Tz>,
    unit: TenureUnit,
    now: &DateTime<Tz>,
) -> Result<DateTime<Tz>, ScheduleError> {
    let mut window = next_due(&end_of_day(disbursed_at)?, unit)?;
    while window < *now {
        window = next_due(&window, unit)?;
    }
    Ok(window)
}

fn local_end_of_day<Tz: TimeZone>(tz: &Tz, date: NaiveDate) -> Result<DateTime<Tz>, ScheduleError> {
    let naive = date
        .and_hms_opt(23, 59, 59)
        .ok_or_else(|| ScheduleError::InvalidTerms(format!("no end of day for {}", date)))?;

    tz.from_local_datetime(&naive)
        .earliest()
        .ok_or(ScheduleError::NonexistentLocalTime(naive))
}

fn next_month_with_day(date: NaiveDate) -> Option<NaiveDate> {
    let first_of_month = date.with_day(1)?;
    (1..=MAX_MONTH_SCAN).find_map(|offset| {
        let month = first_of_month.checked_add_months(Months::new(offset))?;
        NaiveDate::from_ymd_opt(month.year(), month.month(), date.day())
    })
}

fn next_year_with_month_day(date: NaiveDate) -> Option<NaiveDate> {
    (1..=MAX_YEAR_SCAN).find_map(|offset| {
        let year = date.year().checked_add(offset)?;
        NaiveDate::from_ymd_opt(year, date.month(), date.day())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, NaiveDateTime, Timelike, Utc, Weekday};

    fn jakarta() -> FixedOffset {
        FixedOffset::east_opt(7 * 3600).unwrap()
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<FixedOffset> {
        jakarta().with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn eod(y: i32, m: u32, d: u32) -> DateTime<FixedOffset> {
        jakarta().with_ymd_and_hms(y, m, d, 23, 59, 59).unwrap()
    }

    #[test]
    fn test_end_of_day_is_idempotent() {
        let normalised = end_of_day(&at(2024, 1, 15, 10, 30)).unwrap();
        assert_eq!(normalised, eod(2024, 1, 15));
        assert_eq!(end_of_day(&normalised).unwrap(), normalised);
    }

    #[test]
    fn test_end_of_day_uses_local_calendar() {
        // 20:00 UTC is already the next day in UTC+7
        let utc = Utc.with_ymd_and_hms(2024, 1, 15, 20, 0, 0).unwrap();
        let local = utc.with_timezone(&jakarta());
        assert_eq!(end_of_day(&local).unwrap(), eod(2024, 1, 16));
    }

    #[test]
    fn test_day_cadence() {
        assert_eq!(next_due(&at(2024, 1, 15, 10, 0), TenureUnit::Day).unwrap(), eod(2024, 1, 16));
        assert_eq!(next_due(&eod(2024, 1, 16), TenureUnit::Day).unwrap(), eod(2024, 1, 17));
        assert_eq!(next_due(&eod(2023, 12, 31), TenureUnit::Day).unwrap(), eod(2024, 1, 1));
        assert_eq!(next_due(&eod(2024, 2, 28), TenureUnit::Day).unwrap(), eod(2024, 2, 29));
    }

    #[test]
    fn test_week_cadence_keeps_weekday() {
        let monday = at(2024, 1, 15, 9, 0);
        assert_eq!(monday.weekday(), Weekday::Mon);

        let next = next_due(&monday, TenureUnit::Week).unwrap();
        assert_eq!(next, eod(2024, 1, 22));
        assert_eq!(next.weekday(), Weekday::Mon);
        assert_eq!(next_due(&eod(2024, 12, 30), TenureUnit::Week).unwrap(), eod(2025, 1, 6));
    }

    #[test]
    fn test_month_cadence() {
        assert_eq!(next_due(&at(2024, 1, 15, 9, 0), TenureUnit::Month).unwrap(), eod(2024, 2, 15));
        assert_eq!(next_due(&eod(2024, 12, 15), TenureUnit::Month).unwrap(), eod(2025, 1, 15));
    }

    #[test]
    fn test_month_cadence_skips_months_without_anchor_day() {
        assert_eq!(next_due(&eod(2024, 1, 31), TenureUnit::Month).unwrap(), eod(2024, 3, 31));
        assert_eq!(next_due(&eod(2024, 3, 31), TenureUnit::Month).unwrap(), eod(2024, 5, 31));
        assert_eq!(next_due(&eod(2024, 1, 30), TenureUnit::Month).unwrap(), eod(2024, 3, 30));
        assert_eq!(next_due(&eod(2023, 1, 29), TenureUnit::Month).unwrap(), eod(2023, 3, 29));
        assert_eq!(next_due(&eod(2024, 1, 29), TenureUnit::Month).unwrap(), eod(2024, 2, 29));
    }

    #[test]
    fn test_year_cadence() {
        assert_eq!(next_due(&at(2024, 3, 10, 8, 0), TenureUnit::Year).unwrap(), eod(2025, 3, 10));
        assert_eq!(next_due(&eod(2024, 2, 29), TenureUnit::Year).unwrap(), eod(2028, 2, 29));
        assert_eq!(next_due(&eod(2096, 2, 29), TenureUnit::Year).unwrap(), eod(2104, 2, 29));
    }

    #[test]
    fn test_due_instants_are_end_of_day() {
        for unit in [TenureUnit::Day, TenureUnit::Week, TenureUnit::Month, TenureUnit::Year] {
            let next = next_due(&at(2024, 5, 5, 1, 2), unit).unwrap();
            assert_eq!((next.hour(), next.minute(), next.second()), (23, 59, 59));
            assert_eq!(next.offset(), &jakarta());
        }
    }

    #[test]
    fn test_calendar_overflow() {
        let last = Utc.from_utc_datetime(&NaiveDate::MAX.and_hms_opt(12, 0, 0).unwrap());
        let err = next_due(&last, TenureUnit::Day).unwrap_err();
        assert!(matches!(err, ScheduleError::CalendarOverflow { unit: TenureUnit::Day, .. }));
    }

    #[test]
    fn test_settlement_window_before_first_due() {
        let disbursed = at(2024, 1, 1, 10, 0);
        let window = settlement_window(&disbursed, TenureUnit::Day, &at(2024, 1, 1, 12, 0)).unwrap();
        assert_eq!(window, eod(2024, 1, 2));
    }

    #[test]
    fn test_settlement_window_advances_past_elapsed_windows() {
        let disbursed = at(2024, 1, 1, 10, 0);
        let window = settlement_window(&disbursed, TenureUnit::Day, &at(2024, 1, 5, 12, 0)).unwrap();
        assert_eq!(window, eod(2024, 1, 5));

        let weekly = settlement_window(&disbursed, TenureUnit::Week, &at(2024, 1, 20, 0, 0)).unwrap();
        assert_eq!(weekly, eod(2024, 1, 22));
    }

    #[test]
    fn test_settlement_window_includes_instant_equal_to_now() {
        let disbursed = at(2024, 1, 1, 10, 0);
        let now = eod(2024, 1, 3);
        assert_eq!(settlement_window(&disbursed, TenureUnit::Day, &now).unwrap(), now);
    }

    #[test]
    fn test_naive_local_reported_on_overflow() {
        let last = Utc.from_utc_datetime(&NaiveDate::MAX.and_hms_opt(12, 0, 0).unwrap());
        match next_due(&last, TenureUnit::Week) {
            Err(ScheduleError::CalendarOverflow { from, .. }) => {
                assert_eq!(from, NaiveDateTime::new(NaiveDate::MAX, last.time()));
            }
            other => panic!("expected overflow, got {:?}", other),
        }
    }
}
