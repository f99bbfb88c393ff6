//! Machine-readable (MLSD/MLST) fact lines: `fact=value;...; name`.
//!
//! `cdir`/`pdir` entries are dropped. `UNIX.*` facts fill owner, group and
//! permission bits; `modify` is `YYYYMMDDHHMMSS` in UTC. Unknown facts are
//! ignored.

use crate::entry::{DirectoryEntry, EntryKind};
use chrono::{TimeZone, Utc};

pub fn parse(line: &str) -> Option<DirectoryEntry> {
    // Facts end at the first space; the remainder (spaces included) is the
    // name. A line without a fact list is not machine format.
    let (facts, name) = line.split_once(' ')?;
    if name.is_empty() || !facts.contains('=') || !facts.ends_with(';') {
        return None;
    }

    let mut entry = DirectoryEntry {
        filename: name.to_string(),
        ..Default::default()
    };
    let mut seen_type = false;

    for fact in facts.split(';').filter(|f| !f.is_empty()) {
        let (key, value) = fact.split_once('=')?;
        match key.to_ascii_lowercase().as_str() {
            "type" => {
                seen_type = true;
                let value = value.to_ascii_lowercase();
                match value.as_str() {
                    "file" => entry.kind = EntryKind::File,
                    "dir" => entry.kind = EntryKind::Dir,
                    // Current/parent directory pseudo-entries.
                    "cdir" | "pdir" => return None,
                    other => {
                        // "OS.unix=slink:<target>" marks a symlink.
                        if let Some(target) = other.strip_prefix("os.unix=slink:") {
                            entry.kind = EntryKind::File;
                            entry.link_target = target.to_string();
                        } else {
                            entry.kind = EntryKind::File;
                        }
                    }
                }
            }
            "size" | "sizd" => entry.size = value.parse().unwrap_or(0),
            "modify" => entry.modified = parse_timeval(value),
            "unix.mode" => entry.permissions = u32::from_str_radix(value, 8).unwrap_or(0),
            "unix.owner" | "unix.uid" => entry.owner = value.to_string(),
            "unix.group" | "unix.gid" => entry.group = value.to_string(),
            _ => {}
        }
    }

    if !seen_type {
        return None;
    }
    Some(entry)
}

fn parse_timeval(value: &str) -> Option<chrono::DateTime<Utc>> {
    if value.len() < 14 || !value.is_char_boundary(14) {
        return None;
    }
    let (y, mo, d, h, mi, s) = (
        value[0..4].parse().ok()?,
        value[4..6].parse().ok()?,
        value[6..8].parse().ok()?,
        value[8..10].parse().ok()?,
        value[10..12].parse().ok()?,
        value[12..14].parse().ok()?,
    );
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn file_with_unix_facts() {
        let e = parse(
            "type=file;size=1024;modify=20230105123400;UNIX.mode=0644;UNIX.owner=o;UNIX.group=g; data.txt",
        )
        .unwrap();
        assert_eq!(e.filename, "data.txt");
        assert_eq!(e.kind, EntryKind::File);
        assert_eq!(e.size, 1024);
        assert_eq!(e.permissions, 0o644);
        assert_eq!(e.owner, "o");
        assert_eq!(e.group, "g");
        let m = e.modified.unwrap();
        assert_eq!((m.year(), m.month(), m.day()), (2023, 1, 5));
        assert_eq!((m.hour(), m.minute(), m.second()), (12, 34, 0));
    }

    #[test]
    fn directory() {
        let e = parse("type=dir;modify=20230105123400; pub").unwrap();
        assert_eq!(e.kind, EntryKind::Dir);
        assert_eq!(e.filename, "pub");
    }

    #[test]
    fn cdir_and_pdir_dropped() {
        assert!(parse("type=cdir;modify=20230105123400; /pub").is_none());
        assert!(parse("type=pdir;modify=20230105123400; /").is_none());
    }

    #[test]
    fn symlink_fact() {
        let e = parse("type=OS.unix=slink:/srv/v2;size=4; cur").unwrap();
        assert_eq!(e.filename, "cur");
        assert_eq!(e.link_target, "/srv/v2");
        assert!(e.is_symlink());
    }

    #[test]
    fn name_with_spaces() {
        let e = parse("type=file;size=1; a file.txt").unwrap();
        assert_eq!(e.filename, "a file.txt");
    }

    #[test]
    fn rejects_non_machine_lines() {
        assert!(parse("-rw-r--r-- 1 o g 1 Jan 05 12:34 f").is_none());
        assert!(parse("just some text").is_none());
    }
}
