//! fathom-engine — the FTP/FTPS/SFTP transfer engine.
//!
//! Protocol operations are suspendable state machines ([`command::Command`])
//! composed into per-session chains; one cooperative task per connection
//! ([`thread`]) drives exactly one step at a time. Consumers submit
//! operations through a [`thread::ThreadHandle`] and observe results on an
//! event channel; decision requests (file exists, host-key trust, password
//! prompts) suspend the issuing command until answered via
//! [`thread::Request::Wakeup`].

pub mod command;
pub mod error;
pub mod ftp;
pub mod retry;
pub mod session;
pub mod sftp;
pub mod thread;

pub use command::{ChainStatus, Command, CommandChain, Flow, ResultCode};
pub use error::{EngineError, EngineResult};
pub use session::EngineShared;
pub use thread::{spawn, Request, ThreadHandle};

pub use fathom_core::{
    DirectoryEntry, DirectoryListing, DirectoryTree, EntryKind, ErrorKind, FileExistsAction,
    RemoteUrl, SessionEvent, SessionSettings, WakeupEvent,
};
