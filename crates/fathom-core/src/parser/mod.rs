//! Incremental directory-listing parser.
//!
//! Raw data-channel bytes are fed in as they arrive; complete lines are
//! decoded with the session's text encoding and matched against the
//! supported dialects in a fixed order:
//!
//! 1. machine format (MLSD facts)
//! 2. Unix `ls -l` (including the NetWare variant)
//! 3. DOS / IIS
//! 4. VMS
//!
//! Unparseable lines are logged and skipped rather than failing the
//! listing. Normalization applied to every parsed entry: `.` / `..` are
//! dropped, a `name -> target` suffix is split into name and link target,
//! and an owner field with an embedded space is split into owner/group.

mod date;
mod dos;
mod machine;
mod unix;
mod vms;

use crate::entry::DirectoryEntry;
use chrono::{DateTime, Utc};
use encoding_rs::Encoding;

pub struct ListingParser {
    buf: Vec<u8>,
    encoding: &'static Encoding,
    now: DateTime<Utc>,
}

impl ListingParser {
    /// `encoding_label` as understood by WHATWG labels ("utf-8", "latin1",
    /// ...); unknown labels fall back to UTF-8.
    pub fn new(encoding_label: &str) -> Self {
        let encoding =
            Encoding::for_label(encoding_label.as_bytes()).unwrap_or(encoding_rs::UTF_8);
        Self {
            buf: Vec::new(),
            encoding,
            now: Utc::now(),
        }
    }

    /// Pin the clock used for year inference on year-less dates.
    #[cfg(test)]
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn encoding_name(&self) -> &'static str {
        self.encoding.name()
    }

    /// Feed a chunk of raw listing bytes; returns the entries completed by
    /// this chunk. Partial trailing lines are buffered.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<DirectoryEntry> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(entry) = self.parse_bytes(&line[..line.len() - 1]) {
                out.push(entry);
            }
        }
        out
    }

    /// Flush: parse any buffered final line without a terminator.
    pub fn finish(&mut self) -> Option<DirectoryEntry> {
        if self.buf.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buf);
        self.parse_bytes(&line)
    }

    fn parse_bytes(&self, raw: &[u8]) -> Option<DirectoryEntry> {
        let (line, _, _) = self.encoding.decode(raw);
        self.parse_line(line.trim_end_matches('\r'))
    }

    /// Parse one decoded line against the dialects in order.
    pub fn parse_line(&self, line: &str) -> Option<DirectoryEntry> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }
        let entry = machine::parse(line)
            .or_else(|| unix::parse(line, self.now))
            .or_else(|| dos::parse(line, self.now))
            .or_else(|| vms::parse(line, self.now));
        match entry {
            Some(e) => normalize(e),
            None => {
                log::debug!("unparsed listing line: {:?}", line);
                None
            }
        }
    }
}

fn normalize(mut entry: DirectoryEntry) -> Option<DirectoryEntry> {
    // Split "name -> target" before the dot check so a link named "." is
    // still dropped.
    if let Some((name, target)) = entry.filename.split_once(" -> ") {
        entry.link_target = target.to_string();
        entry.filename = name.to_string();
    }
    if entry.filename == "." || entry.filename == ".." {
        return None;
    }
    // Some servers merge owner and group into one field.
    if entry.group.is_empty() {
        if let Some((owner, group)) = entry.owner.split_once(' ') {
            entry.group = group.to_string();
            entry.owner = owner.to_string();
        }
    }
    Some(entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryKind;
    use chrono::TimeZone;

    fn parser() -> ListingParser {
        ListingParser::new("utf-8").with_now(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn dialects_detected_per_line() {
        let p = parser();
        let unix = p
            .parse_line("-rw-r--r-- 1 owner group 1234 Jan 05 12:34 file.txt")
            .unwrap();
        assert_eq!((unix.filename.as_str(), unix.size), ("file.txt", 1234));

        let dos = p.parse_line("01-05-23 10:00AM <DIR> sub").unwrap();
        assert_eq!(dos.kind, EntryKind::Dir);

        let vms = p
            .parse_line("README.TXT;1 4 5-JAN-2023 10:00 [OWNER]")
            .unwrap();
        assert_eq!(vms.filename, "README.TXT;1");

        let mlsd = p
            .parse_line("type=file;size=9;modify=20230105123400; m.txt")
            .unwrap();
        assert_eq!(mlsd.filename, "m.txt");
    }

    #[test]
    fn symlink_target_split() {
        let p = parser();
        let e = p
            .parse_line("lrwxrwxrwx 1 u g 4 Mar 01 00:01 current -> /srv/v2")
            .unwrap();
        assert_eq!(e.filename, "current");
        assert_eq!(e.link_target, "/srv/v2");
        assert!(e.is_symlink());
    }

    #[test]
    fn dot_entries_dropped() {
        let p = parser();
        assert!(p
            .parse_line("drwxr-xr-x 2 o g 4096 Jan 05 2023 .")
            .is_none());
        assert!(p
            .parse_line("drwxr-xr-x 2 o g 4096 Jan 05 2023 ..")
            .is_none());
        // Dotfiles other than . and .. survive.
        assert!(p
            .parse_line("-rw------- 1 o g 12 Jan 05 2023 .profile")
            .is_some());
    }

    #[test]
    fn garbage_lines_are_skipped_not_fatal() {
        let mut p = parser();
        let entries = p.feed(
            b"total 2\r\n\
              -rw-r--r-- 1 o g 10 Jan 05 12:34 a.txt\r\n\
              *** broken line ***\r\n\
              -rw-r--r-- 1 o g 20 Jan 05 12:35 b.txt\r\n",
        );
        let names: Vec<&str> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
    }

    #[test]
    fn chunked_feed_reassembles_lines() {
        let mut p = parser();
        let line = b"-rw-r--r-- 1 o g 10 Jan 05 12:34 split.txt\r\n";
        let mut entries = Vec::new();
        for chunk in line.chunks(7) {
            entries.extend(p.feed(chunk));
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "split.txt");
        assert!(p.finish().is_none());
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut p = parser();
        assert!(p
            .feed(b"-rw-r--r-- 1 o g 10 Jan 05 12:34 tail.txt")
            .is_empty());
        let e = p.finish().unwrap();
        assert_eq!(e.filename, "tail.txt");
    }

    #[test]
    fn latin1_names_decoded() {
        let mut p = ListingParser::new("latin1");
        // 0xE9 = é in latin1.
        let mut line = b"-rw-r--r-- 1 o g 10 Jan 05 2023 caf".to_vec();
        line.push(0xE9);
        line.extend_from_slice(b"\r\n");
        let entries = p.feed(&line);
        assert_eq!(entries[0].filename, "café");
    }

    #[test]
    fn unknown_encoding_falls_back_to_utf8() {
        let p = ListingParser::new("no-such-encoding");
        assert_eq!(p.encoding_name(), "UTF-8");
    }
}
