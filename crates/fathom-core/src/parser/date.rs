//! Date heuristics shared by the listing dialects.
//!
//! Short two-field dates are ambiguous (`dd-mm-yy` vs `mm-dd-yy` vs
//! `yyyy-mm-dd`); resolution is by field width and range: a 4-digit field
//! is the year, a field > 12 and ≤ 31 is the day, otherwise the first
//! field is taken as the month. Year-less Unix dates infer the year from
//! whether the implied date would lie more than ~31 days in the future.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

/// Map a month name ("Jan", "JAN", "january") to 1..=12.
pub fn month_from_name(name: &str) -> Option<u32> {
    if name.len() < 3 {
        return None;
    }
    let lower = name[..3].to_ascii_lowercase();
    let months = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    months.iter().position(|m| *m == lower).map(|i| i as u32 + 1)
}

fn expand_two_digit_year(y: u32) -> i32 {
    if y >= 70 {
        1900 + y as i32
    } else {
        2000 + y as i32
    }
}

/// Resolve three short-date fields into (year, month, day).
///
/// The heuristic is inherited from the original listings it was tuned on
/// and is deliberately not authoritative: when both candidate fields are
/// ≤ 12 the first is assumed to be the month.
pub fn resolve_short_date(fields: [&str; 3]) -> Option<(i32, u32, u32)> {
    let nums: [u32; 3] = [
        fields[0].parse().ok()?,
        fields[1].parse().ok()?,
        fields[2].parse().ok()?,
    ];

    let (year, a, b) = if fields[0].len() == 4 {
        (nums[0] as i32, nums[1], nums[2])
    } else if fields[2].len() == 4 {
        (nums[2] as i32, nums[0], nums[1])
    } else {
        (expand_two_digit_year(nums[2]), nums[0], nums[1])
    };

    let (month, day) = if a > 12 && a <= 31 {
        (b, a)
    } else if b > 12 && b <= 31 {
        (a, b)
    } else {
        // Both ≤ 12: assume month-first.
        (a, b)
    };

    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some((year, month, day))
}

/// Infer the year of a year-less date: the current year unless that would
/// place the date more than ~31 days in the future, in which case it is
/// from last year.
pub fn infer_year(month: u32, day: u32, now: DateTime<Utc>) -> i32 {
    let year = now.year();
    let candidate = NaiveDate::from_ymd_opt(year, month, day)
        // Feb 29 in a non-leap current year must be from an earlier year.
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 28).unwrap_or(now.date_naive()));
    if candidate - now.date_naive() > Duration::days(31) {
        year - 1
    } else {
        year
    }
}

/// Parse "HH:MM" or "HH:MM:SS", with an optional trailing AM/PM marker.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let (body, pm) = if let Some(stripped) = strip_meridiem(s, "PM") {
        (stripped, true)
    } else if let Some(stripped) = strip_meridiem(s, "AM") {
        (stripped, false)
    } else {
        (s, false)
    };

    let mut parts = body.split(':');
    let mut hour: u32 = parts.next()?.parse().ok()?;
    let minute: u32 = parts.next()?.parse().ok()?;
    let second: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);

    if pm && hour < 12 {
        hour += 12;
    } else if !pm && s.to_ascii_uppercase().ends_with("AM") && hour == 12 {
        hour = 0;
    }
    NaiveTime::from_hms_opt(hour, minute, second)
}

fn strip_meridiem<'a>(s: &'a str, marker: &str) -> Option<&'a str> {
    let upper = s.to_ascii_uppercase();
    if upper.ends_with(marker) {
        Some(&s[..s.len() - marker.len()])
    } else {
        None
    }
}

/// Combine resolved date parts and an optional time into a UTC timestamp.
pub fn to_utc(year: i32, month: u32, day: u32, time: Option<NaiveTime>) -> Option<DateTime<Utc>> {
    let date = NaiveDate::from_ymd_opt(year, month, day)?;
    let time = time.unwrap_or(NaiveTime::MIN);
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_names() {
        assert_eq!(month_from_name("Jan"), Some(1));
        assert_eq!(month_from_name("DEC"), Some(12));
        assert_eq!(month_from_name("sept"), Some(9));
        assert_eq!(month_from_name("foo"), None);
    }

    #[test]
    fn short_date_month_first_when_ambiguous() {
        assert_eq!(resolve_short_date(["01", "05", "23"]), Some((2023, 1, 5)));
    }

    #[test]
    fn short_date_day_detected_by_range() {
        // 23 can only be a day.
        assert_eq!(resolve_short_date(["23", "05", "99"]), Some((1999, 5, 23)));
        assert_eq!(resolve_short_date(["05", "23", "01"]), Some((2001, 5, 23)));
    }

    #[test]
    fn short_date_four_digit_year() {
        assert_eq!(
            resolve_short_date(["2023", "01", "05"]),
            Some((2023, 1, 5))
        );
        assert_eq!(
            resolve_short_date(["05", "01", "2023"]),
            Some((2023, 5, 1))
        );
    }

    #[test]
    fn year_inference_31_day_rule() {
        let now = Utc.with_ymd_and_hms(2023, 3, 15, 0, 0, 0).unwrap();
        // A date last month: this year.
        assert_eq!(infer_year(2, 20, now), 2023);
        // A date next week: still this year.
        assert_eq!(infer_year(3, 20, now), 2023);
        // A date five months ahead: must be from last year.
        assert_eq!(infer_year(8, 1, now), 2022);
    }

    #[test]
    fn time_meridiem() {
        assert_eq!(parse_time("10:00"), NaiveTime::from_hms_opt(10, 0, 0));
        assert_eq!(parse_time("10:00PM"), NaiveTime::from_hms_opt(22, 0, 0));
        assert_eq!(parse_time("12:30AM"), NaiveTime::from_hms_opt(0, 30, 0));
        assert_eq!(parse_time("23:59:58"), NaiveTime::from_hms_opt(23, 59, 58));
    }
}
