//! Unix `ls -l` style listing lines, including the NetWare variant
//! (single type character followed by a bracketed rights token).
//!
//! Lines are anchored on the month-name token: everything before it is
//! permissions / link count / owner / group / size, everything after the
//! date is the filename (which may contain spaces).

use super::date;
use crate::entry::{DirectoryEntry, EntryKind};
use chrono::{DateTime, Utc};

pub fn parse(line: &str, now: DateTime<Utc>) -> Option<DirectoryEntry> {
    let tokens = tokenize(line);
    if tokens.len() < 7 {
        return None;
    }

    let first = tokens[0].1;
    let kind_char = first.chars().next()?;
    let kind = match kind_char {
        '-' | 'l' | 'p' | 's' => EntryKind::File,
        'd' => EntryKind::Dir,
        'c' => EntryKind::CharDevice,
        'b' => EntryKind::BlockDevice,
        _ => return None,
    };

    // NetWare prints the type alone and the rights in brackets.
    let (permissions, fields_start) = if first.len() == 1
        && tokens.get(1).is_some_and(|(_, t)| t.starts_with('['))
    {
        (0, 2)
    } else if first.len() >= 10 {
        (parse_mode(&first[1..10])?, 1)
    } else {
        return None;
    };

    // The month name anchors the line: its left neighbour is the size (or
    // the minor device number), the two tokens to its right are the day
    // and either a year or an HH:MM time.
    let month_idx = (fields_start + 1..tokens.len().saturating_sub(3)).find(|&i| {
        date::month_from_name(tokens[i].1).is_some()
            && tokens[i + 1].1.chars().all(|c| c.is_ascii_digit())
    })?;
    let month = date::month_from_name(tokens[month_idx].1)?;
    let day: u32 = tokens[month_idx + 1].1.parse().ok()?;
    if !(1..=31).contains(&day) {
        return None;
    }
    let year_or_time = tokens[month_idx + 2].1;
    let modified = if year_or_time.contains(':') {
        let time = date::parse_time(year_or_time)?;
        let year = date::infer_year(month, day, now);
        date::to_utc(year, month, day, Some(time))
    } else {
        let year: i32 = year_or_time.parse().ok()?;
        date::to_utc(year, month, day, None)
    };

    // Device entries carry "major, minor" where plain files carry a size.
    let size_token = tokens[month_idx - 1].1;
    let size: u64 = if matches!(kind, EntryKind::CharDevice | EntryKind::BlockDevice) {
        0
    } else {
        size_token.trim_end_matches(',').parse().ok()?
    };

    // Between the permissions and the size: optional link count, then one
    // to three owner/group tokens.
    let mut meta: Vec<&str> = tokens[fields_start..month_idx - 1]
        .iter()
        .map(|(_, t)| *t)
        .collect();
    if matches!(kind, EntryKind::CharDevice | EntryKind::BlockDevice) && !meta.is_empty() {
        // The major number sits where the size would otherwise be counted.
        meta.pop();
    }
    if meta.len() > 1 && meta[0].chars().all(|c| c.is_ascii_digit()) {
        meta.remove(0); // link count
    }
    if meta.is_empty() || meta.len() > 3 {
        return None;
    }
    let owner = meta[0].to_string();
    let group = if meta.len() > 1 {
        meta[meta.len() - 1].to_string()
    } else {
        String::new()
    };

    // Name is the raw remainder of the line, spaces preserved.
    let name_start = tokens.get(month_idx + 3)?.0;
    let filename = line[name_start..].to_string();
    if filename.is_empty() {
        return None;
    }

    let mut entry = DirectoryEntry {
        filename,
        owner,
        group,
        permissions,
        size,
        kind,
        modified,
        ..Default::default()
    };
    if kind_char == 'l' {
        // Target extraction happens in the shared normalization pass, but
        // mark the entry so a target-less link still reads as one.
        if !entry.filename.contains(" -> ") {
            entry.link_target = entry.filename.clone();
        }
    }
    Some(entry)
}

pub(super) fn tokenize(line: &str) -> Vec<(usize, &str)> {
    let mut out = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                out.push((s, &line[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        out.push((s, &line[s..]));
    }
    out
}

/// "rwxr-xr-x" (with setuid/setgid/sticky letters) → octal mode bits.
fn parse_mode(s: &str) -> Option<u32> {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() != 9 {
        return None;
    }
    const BITS: [u32; 9] = [
        0o400, 0o200, 0o100, 0o040, 0o020, 0o010, 0o004, 0o002, 0o001,
    ];
    let mut mode = 0u32;
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '-' => {}
            's' if i == 2 => mode |= BITS[i] | 0o4000,
            's' if i == 5 => mode |= BITS[i] | 0o2000,
            'S' if i == 2 => mode |= 0o4000,
            'S' if i == 5 => mode |= 0o2000,
            't' if i == 8 => mode |= BITS[i] | 0o1000,
            'T' if i == 8 => mode |= 0o1000,
            'r' | 'w' | 'x' => mode |= BITS[i],
            _ => return None,
        }
    }
    Some(mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn plain_file_with_time() {
        let e = parse("-rw-r--r-- 1 owner group 1234 Jan 05 12:34 file.txt", now()).unwrap();
        assert_eq!(e.filename, "file.txt");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 1234);
        assert_eq!(e.owner, "owner");
        assert_eq!(e.group, "group");
        assert_eq!(e.permissions, 0o644);
        let m = e.modified.unwrap();
        assert_eq!((m.year(), m.month(), m.day()), (2023, 1, 5));
        assert_eq!((m.hour(), m.minute()), (12, 34));
    }

    #[test]
    fn directory_with_year() {
        let e = parse("drwxr-xr-x 2 owner group 4096 Jan 05 2023 dir", now()).unwrap();
        assert_eq!(e.kind, EntryKind::Dir);
        assert_eq!(e.permissions, 0o755);
        assert_eq!(e.modified.unwrap().year(), 2023);
    }

    #[test]
    fn name_with_spaces() {
        let e = parse(
            "-rw-r--r-- 1 u g 9 Feb 10 08:00 a file with spaces.txt",
            now(),
        )
        .unwrap();
        assert_eq!(e.filename, "a file with spaces.txt");
    }

    #[test]
    fn symlink_suffix_preserved() {
        let e = parse("lrwxrwxrwx 1 u g 4 Mar 01 00:01 cur -> /srv/v2", now()).unwrap();
        assert_eq!(e.filename, "cur -> /srv/v2");
    }

    #[test]
    fn owner_without_group() {
        let e = parse("-rw-r--r-- 1 someuser 512 Apr 02 10:00 f", now()).unwrap();
        assert_eq!(e.owner, "someuser");
        assert_eq!(e.group, "");
    }

    #[test]
    fn char_device() {
        let e = parse("crw-rw-rw- 1 root root 1, 3 May 11 09:30 null", now()).unwrap();
        assert_eq!(e.kind, EntryKind::CharDevice);
        assert_eq!(e.filename, "null");
        assert_eq!(e.size, 0);
    }

    #[test]
    fn netware_variant() {
        let e = parse("d [RWCEAFMS] someuser 512 Jan 05 2023 shared", now()).unwrap();
        assert_eq!(e.kind, EntryKind::Dir);
        assert_eq!(e.owner, "someuser");
        assert_eq!(e.filename, "shared");
    }

    #[test]
    fn yearless_date_in_the_future_rolls_back() {
        // now = June 2023; a December date must be December 2022.
        let e = parse("-rw-r--r-- 1 u g 1 Dec 24 18:00 old", now()).unwrap();
        assert_eq!(e.modified.unwrap().year(), 2022);
    }

    #[test]
    fn rejects_non_listing_lines() {
        assert!(parse("total 123", now()).is_none());
        assert!(parse("220 welcome to ftpd", now()).is_none());
    }

    #[test]
    fn setuid_and_sticky_bits() {
        let e = parse("-rwsr-xr-t 1 root root 1 Jan 05 2023 prog", now()).unwrap();
        assert_eq!(e.permissions, 0o4755 | 0o1000 | 0o001);
    }
}
