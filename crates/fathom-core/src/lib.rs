//! # fathom-core — protocol-independent transfer-engine building blocks
//!
//! Everything in this crate is passive: no sockets, no protocol state.
//! The engine crate layers FTP/SFTP state machines on top of:
//! - `entry` — remote filesystem model (`DirectoryEntry`, listing, tree)
//! - `parser` — LIST output parsing (MLSD facts, Unix, DOS, VMS dialects)
//! - `cache` — URL-keyed listing / resolved-path cache
//! - `limiter` — cross-connection token-bucket bandwidth allocator
//! - `remote_url` — scheme/host/credential handling and cache-key rules
//! - `settings` — per-session key/value configuration surface
//! - `event` — the outbound event vocabulary consumers subscribe to
//! - `error` — the fixed error-kind enumeration carried on error events

pub mod cache;
pub mod entry;
pub mod error;
pub mod event;
pub mod limiter;
pub mod parser;
pub mod remote_url;
pub mod settings;

pub use cache::ListingCache;
pub use entry::{DirectoryEntry, DirectoryListing, DirectoryTree, EntryKind};
pub use error::{Error, ErrorKind, Result};
pub use event::{FileExistsAction, SessionEvent, WakeupEvent};
pub use limiter::{Channel, SpeedLimiter};
pub use parser::ListingParser;
pub use remote_url::RemoteUrl;
pub use settings::SessionSettings;
