//! Per-connection session state shared by the protocol implementations.
//!
//! A session is one logical transport connection. The protocol-specific
//! contexts (FTP, SFTP) embed a [`SessionCore`] carrying everything that is
//! protocol-independent: settings, directory/URL state, the event channel,
//! clocks, and the handle to the engine-wide shared resources.

use crate::command::ResultCode;
use fathom_core::cache::ListingCache;
use fathom_core::limiter::{self, SpeedLimiter};
use fathom_core::{
    DirectoryEntry, DirectoryListing, ErrorKind, RemoteUrl, SessionEvent, SessionSettings,
};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Engine-wide shared resources: the metadata cache and the bandwidth
/// allocator. One owned instance per engine, cloned (by handle) into each
/// connection thread; all mutation goes through the mutexes, critical
/// sections never await.
#[derive(Clone, Default)]
pub struct EngineShared {
    pub cache: Arc<Mutex<ListingCache>>,
    pub limiter: Arc<Mutex<SpeedLimiter>>,
}

impl EngineShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(download: u64, upload: u64) -> Self {
        Self {
            cache: Arc::new(Mutex::new(ListingCache::new())),
            limiter: Arc::new(Mutex::new(SpeedLimiter::new(download, upload))),
        }
    }

    /// Drive the limiter's refill clock. One ticker per engine.
    pub fn spawn_limiter_ticker(&self) -> JoinHandle<()> {
        let limiter = Arc::clone(&self.limiter);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter::TICK);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                limiter.lock().unwrap_or_else(|p| p.into_inner()).tick();
            }
        })
    }

    pub fn cache(&self) -> std::sync::MutexGuard<'_, ListingCache> {
        self.cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Tokens for one transfer slice. `None` means the transfer never
    /// registered (channel was unlimited at setup time).
    pub fn grant(&self, channel: limiter::Channel, item: Option<limiter::ItemId>, want: usize) -> usize {
        match item {
            Some(id) => {
                let mut limiter = self.limiter();
                if limiter.is_unlimited(channel) {
                    want
                } else {
                    limiter.take(channel, id, want)
                }
            }
            None => want,
        }
    }

    pub fn limiter(&self) -> std::sync::MutexGuard<'_, SpeedLimiter> {
        self.limiter.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Protocol-independent state of one session.
pub struct SessionCore {
    pub settings: SessionSettings,
    pub url: Option<RemoteUrl>,
    /// Directory the server placed us in after login.
    pub home_dir: String,
    pub current_dir: String,
    pub last_listing: Option<DirectoryListing>,
    pub last_stat: Option<DirectoryEntry>,
    pub bytes_transferred: u64,
    /// When false, error events are swallowed (propagation is unaffected);
    /// set around expected-to-fail internal probes.
    pub report_errors: bool,
    pub connected: bool,
    pub shared: EngineShared,
    events: UnboundedSender<SessionEvent>,
    last_activity: Instant,
}

impl SessionCore {
    pub fn new(events: UnboundedSender<SessionEvent>, shared: EngineShared) -> Self {
        Self {
            settings: SessionSettings::new(),
            url: None,
            home_dir: String::new(),
            current_dir: String::new(),
            last_listing: None,
            last_stat: None,
            bytes_transferred: 0,
            report_errors: true,
            connected: false,
            shared,
            events,
            last_activity: Instant::now(),
        }
    }

    /// Emit an event to the consumer. A closed receiver is not an error:
    /// the consumer went away and the session will be torn down shortly.
    pub fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Emit an error event unless reporting is currently suppressed.
    pub fn report_error(&self, kind: ErrorKind, detail: impl Into<String>) {
        let detail = detail.into();
        if self.report_errors {
            self.emit(SessionEvent::Error { kind, detail });
        } else {
            log::debug!("suppressed error: {:?}: {}", kind, detail);
        }
    }

    /// Absolute form of `path`, relative paths anchored at the current
    /// remote directory.
    pub fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else if path.is_empty() {
            self.current_dir.clone()
        } else {
            RemoteUrl::join(&self.current_dir, path)
        }
    }

    /// Report a command failure as an error event with the given kind
    /// fallback, honoring the session's reporting toggle.
    pub fn fail(&self, err: &crate::error::EngineError, fallback: ErrorKind) -> ResultCode {
        let kind = match err.kind() {
            ErrorKind::OperationFailed => fallback,
            specific => specific,
        };
        self.report_error(kind, err.to_string());
        ResultCode::Failed
    }

    /// Record protocol activity, rearming the keepalive clock.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_activity.elapsed()
    }

    /// The URL of the active connection, if any.
    pub fn url(&self) -> Option<&RemoteUrl> {
        self.url.as_ref()
    }

    pub fn reset_after_disconnect(&mut self) {
        self.connected = false;
        self.home_dir.clear();
        self.current_dir.clear();
        self.last_listing = None;
        self.last_stat = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_reporting_toggle_suppresses_events() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut core = SessionCore::new(tx, EngineShared::new());

        core.report_error(ErrorKind::FileNotFound, "probe");
        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::Error { kind: ErrorKind::FileNotFound, .. })
        ));

        core.report_errors = false;
        core.report_error(ErrorKind::FileNotFound, "probe");
        assert!(rx.try_recv().is_err());

        // Non-error events are unaffected by the toggle.
        core.emit(SessionEvent::Connected);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Connected)));
    }

    #[test]
    fn disconnect_reset_clears_session_state() {
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut core = SessionCore::new(tx, EngineShared::new());
        core.connected = true;
        core.home_dir = "/home/u".into();
        core.current_dir = "/home/u/sub".into();
        core.last_stat = Some(DirectoryEntry::default());
        core.reset_after_disconnect();
        assert!(!core.connected);
        assert!(core.home_dir.is_empty());
        assert!(core.last_stat.is_none());
    }
}
