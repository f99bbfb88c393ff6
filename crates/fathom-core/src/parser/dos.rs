//! DOS / IIS listing lines: `MM-DD-YY HH:MM(AM|PM) (<DIR>|size) name`.
//!
//! Sizes may be comma-grouped. The date field order is resolved by the
//! shared short-date heuristics.

use super::date;
use crate::entry::{DirectoryEntry, EntryKind};
use chrono::{DateTime, Utc};

pub fn parse(line: &str, _now: DateTime<Utc>) -> Option<DirectoryEntry> {
    let tokens = super::unix::tokenize(line);
    if tokens.len() < 4 {
        return None;
    }
    let date_tok = tokens[0].1;
    let time_tok = tokens[1].1;
    let size_tok = tokens[2].1;
    // Name is the raw remainder, spaces preserved.
    let filename = line[tokens[3].0..].to_string();

    let parts: Vec<&str> = date_tok.split(['-', '/']).collect();
    if parts.len() != 3 {
        return None;
    }
    let (year, month, day) = date::resolve_short_date([parts[0], parts[1], parts[2]])?;
    let time = date::parse_time(time_tok)?;
    let modified = date::to_utc(year, month, day, Some(time));

    let (kind, size) = if size_tok.eq_ignore_ascii_case("<DIR>") {
        (EntryKind::Dir, 0)
    } else {
        let digits: String = size_tok.chars().filter(|c| *c != ',').collect();
        (EntryKind::File, digits.parse().ok()?)
    };

    Some(DirectoryEntry {
        filename,
        size,
        kind,
        modified,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn directory_line() {
        let e = parse("01-05-23 10:00AM <DIR> sub", now()).unwrap();
        assert_eq!(e.filename, "sub");
        assert_eq!(e.kind, EntryKind::Dir);
        assert_eq!(e.size, 0);
        let m = e.modified.unwrap();
        assert_eq!((m.year(), m.month(), m.day()), (2023, 1, 5));
        assert_eq!(m.hour(), 10);
    }

    #[test]
    fn file_line_with_comma_size() {
        let e = parse("01-05-23 10:00AM 1,234 file.bin", now()).unwrap();
        assert_eq!(e.filename, "file.bin");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 1234);
    }

    #[test]
    fn pm_times_and_spaced_names() {
        let e = parse("12-24-99 11:59PM 7 holiday plan.doc", now()).unwrap();
        assert_eq!(e.filename, "holiday plan.doc");
        let m = e.modified.unwrap();
        assert_eq!((m.year(), m.month(), m.day()), (1999, 12, 24));
        assert_eq!((m.hour(), m.minute()), (23, 59));
    }

    #[test]
    fn rejects_unix_lines() {
        assert!(parse("-rw-r--r-- 1 owner group 1234 Jan 05 12:34 f", now()).is_none());
    }
}
