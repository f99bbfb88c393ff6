//! VMS listing lines: `NAME.EXT;ver blocks d-MMM-yyyy HH:MM[:SS] [OWNER] (prot)`.
//!
//! Directories are recognised by the `.DIR` extension and reported without
//! it. Owner brackets may carry a `GROUP,OWNER` pair. The protection field
//! is accepted but not mapped onto Unix permission bits.

use super::date;
use crate::entry::{DirectoryEntry, EntryKind};
use chrono::{DateTime, Utc};

pub fn parse(line: &str, _now: DateTime<Utc>) -> Option<DirectoryEntry> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 4 {
        return None;
    }

    // The name;version token is the dialect's signature.
    let name_tok = tokens[0];
    let (name, _version) = name_tok.split_once(';')?;
    if name.is_empty() {
        return None;
    }

    let size: u64 = tokens[1].split('/').next()?.parse().ok()?;

    let date_parts: Vec<&str> = tokens[2].split('-').collect();
    if date_parts.len() != 3 {
        return None;
    }
    let day: u32 = date_parts[0].parse().ok()?;
    let month = date::month_from_name(date_parts[1])?;
    let year: i32 = date_parts[2].parse().ok()?;
    let time = date::parse_time(tokens[3])?;
    let modified = date::to_utc(year, month, day, Some(time));

    let (mut owner, mut group) = (String::new(), String::new());
    for tok in &tokens[4..] {
        if tok.starts_with('[') && tok.ends_with(']') {
            let inner = &tok[1..tok.len() - 1];
            match inner.split_once(',') {
                Some((g, o)) => {
                    group = g.to_string();
                    owner = o.to_string();
                }
                None => owner = inner.to_string(),
            }
        }
        // Parenthesised protection masks are ignored.
    }

    let (filename, kind) = match name.strip_suffix(".DIR") {
        Some(stem) => (stem.to_string(), EntryKind::Dir),
        None => (name_tok.to_string(), EntryKind::File),
    };

    Some(DirectoryEntry {
        filename,
        owner,
        group,
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
    fn file_with_owner() {
        let e = parse("README.TXT;1 4 5-JAN-2023 10:00 [OWNER]", now()).unwrap();
        assert_eq!(e.filename, "README.TXT;1");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 4);
        assert_eq!(e.owner, "OWNER");
        let m = e.modified.unwrap();
        assert_eq!((m.year(), m.month(), m.day()), (2023, 1, 5));
        assert_eq!(m.hour(), 10);
    }

    #[test]
    fn directory_drops_extension() {
        let e = parse("SUB.DIR;1 2 5-JAN-2023 10:00 [GRP,USER]", now()).unwrap();
        assert_eq!(e.filename, "SUB");
        assert_eq!(e.kind, EntryKind::Dir);
        assert_eq!(e.group, "GRP");
        assert_eq!(e.owner, "USER");
    }

    #[test]
    fn protection_mask_tolerated() {
        let e = parse(
            "DATA.BIN;3 120/128 5-JAN-2023 23:59:58 [SYS] (RWED,RWED,RE,)",
            now(),
        )
        .unwrap();
        assert_eq!(e.size, 120);
        assert_eq!(e.modified.unwrap().second(), 58);
    }

    #[test]
    fn rejects_other_dialects() {
        assert!(parse("01-05-23 10:00AM <DIR> sub", now()).is_none());
        assert!(parse("-rw-r--r-- 1 o g 1 Jan 05 12:34 f", now()).is_none());
    }
}
