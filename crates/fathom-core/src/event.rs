//! Outbound event vocabulary and wakeup (decision answer) types.
//!
//! Events are emitted asynchronously, ordered per session. Decision
//! requests (`FileExists`, `PubkeyPassword`, `PeerVerify`) suspend the
//! issuing command until the consumer answers via `wakeup` — the contract
//! is that a consumer must always eventually reply or abort the session.

use crate::entry::{DirectoryEntry, DirectoryListing, DirectoryTree};
use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};

/// Consumer's answer to a `FileExists` decision request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileExistsAction {
    Overwrite,
    /// Continue from the existing file's size.
    Resume,
    /// Transfer under a different destination name.
    Rename(String),
    Skip,
}

/// An answer delivered to a suspended command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WakeupEvent {
    FileExists(FileExistsAction),
    /// Password / key passphrase supplied by the consumer.
    Password(String),
    /// Certificate or host-key trust decision: accept / reject.
    PeerVerify(bool),
}

/// Everything a session reports to the outside world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "event", content = "data")]
pub enum SessionEvent {
    // ── Connection lifecycle ─────────────────────────────────────
    Connecting,
    Connected,
    Disconnected,
    /// The session finished a top-level command and can accept another.
    Ready,
    /// The command chain is empty and nothing is queued.
    Idle,

    // ── Protocol trace ───────────────────────────────────────────
    CommandSent(String),
    Response(String),
    MultilineResponse(String),
    RawResponse(String),

    // ── Results ──────────────────────────────────────────────────
    DirectoryListing(DirectoryListing),
    ScanComplete(Box<DirectoryTree>),
    TransferComplete {
        bytes: u64,
    },
    /// A resume was negotiated at the given byte offset.
    ResumeOffset(u64),

    // ── Decision requests (suspend until wakeup) ─────────────────
    /// Destination (and, when available, source) stat of an existing file.
    FileExists {
        source: Option<DirectoryEntry>,
        destination: Option<DirectoryEntry>,
    },
    /// A key passphrase or password is required.
    PubkeyPassword,
    /// Certificate / host-key verification failed; accept or reject.
    PeerVerify {
        detail: String,
    },

    // ── Errors ───────────────────────────────────────────────────
    Error {
        kind: ErrorKind,
        detail: String,
    },
}

impl SessionEvent {
    /// Whether this event suspends the issuing command until a wakeup.
    pub fn is_decision_request(&self) -> bool {
        matches!(
            self,
            SessionEvent::FileExists { .. }
                | SessionEvent::PubkeyPassword
                | SessionEvent::PeerVerify { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn decision_requests_identified() {
        assert!(SessionEvent::PubkeyPassword.is_decision_request());
        assert!(SessionEvent::FileExists {
            source: None,
            destination: None
        }
        .is_decision_request());
        assert!(!SessionEvent::Connected.is_decision_request());
        assert!(!SessionEvent::TransferComplete { bytes: 1 }.is_decision_request());
    }

    #[test]
    fn events_serialize_tagged() {
        let json = serde_json::to_string(&SessionEvent::ResumeOffset(4096)).unwrap();
        assert_eq!(json, r#"{"event":"resumeOffset","data":4096}"#);

        let json = serde_json::to_string(&SessionEvent::Error {
            kind: ErrorKind::ListFailed,
            detail: "550".into(),
        })
        .unwrap();
        assert!(json.contains(r#""event":"error""#));
        assert!(json.contains(r#""kind":"listFailed""#));
    }
}
