//! Connection thread — one cooperative task per logical connection.
//!
//! The task owns at most one session per protocol and drives exactly one
//! command step at a time, so command code never locks. Requests are
//! serialized through an unbounded queue; `Abort` and `Wakeup` jump the
//! queue while a command is running, everything else waits its turn.

use crate::command::{ChainStatus, ResultCode};
use crate::ftp::{self, fxp, FtpSession};
use crate::retry::ConnectionRetry;
use crate::session::EngineShared;
use crate::sftp::{self, SftpSession};
use fathom_core::settings::keys;
use fathom_core::{ErrorKind, RemoteUrl, SessionEvent, WakeupEvent};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

const DEFAULT_KEEPALIVE_SECS: u32 = 60;

/// One top-level operation, as submitted by the consumer.
pub enum Request {
    Connect(RemoteUrl),
    Disconnect,
    /// Unwind the running command chain; jumps the queue.
    Abort,
    List(String),
    /// Recursive listing into a `DirectoryTree`.
    Scan(String),
    Get { remote: String, local: PathBuf },
    Put { local: PathBuf, remote: String },
    Remove(String),
    Rename { from: String, to: String },
    Chmod { path: String, mode: u32, recursive: bool },
    Mkdir(String),
    /// Verbatim control-channel command; FTP only.
    Raw(String),
    /// Source side of a server-to-server transfer.
    FxpSource(fxp::FxpSourceCmd),
    /// Destination side of a server-to-server transfer.
    FxpServe(fxp::FxpServeCmd),
    /// Answer to a pending decision request; jumps the queue.
    Wakeup(WakeupEvent),
    SetOption { key: String, value: String },
}

/// Cloneable submission handle for one connection thread.
#[derive(Clone)]
pub struct ThreadHandle {
    id: Uuid,
    tx: UnboundedSender<Request>,
}

impl ThreadHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Enqueue a request; false when the thread has shut down.
    pub fn submit(&self, request: Request) -> bool {
        self.tx.send(request).is_ok()
    }

    pub fn connect(&self, url: RemoteUrl) -> bool {
        self.submit(Request::Connect(url))
    }

    pub fn disconnect(&self) -> bool {
        self.submit(Request::Disconnect)
    }

    pub fn abort(&self) -> bool {
        self.submit(Request::Abort)
    }

    pub fn list(&self, path: impl Into<String>) -> bool {
        self.submit(Request::List(path.into()))
    }

    pub fn scan(&self, path: impl Into<String>) -> bool {
        self.submit(Request::Scan(path.into()))
    }

    pub fn get(&self, remote: impl Into<String>, local: impl Into<PathBuf>) -> bool {
        self.submit(Request::Get {
            remote: remote.into(),
            local: local.into(),
        })
    }

    pub fn put(&self, local: impl Into<PathBuf>, remote: impl Into<String>) -> bool {
        self.submit(Request::Put {
            local: local.into(),
            remote: remote.into(),
        })
    }

    pub fn remove(&self, path: impl Into<String>) -> bool {
        self.submit(Request::Remove(path.into()))
    }

    pub fn rename(&self, from: impl Into<String>, to: impl Into<String>) -> bool {
        self.submit(Request::Rename {
            from: from.into(),
            to: to.into(),
        })
    }

    pub fn chmod(&self, path: impl Into<String>, mode: u32, recursive: bool) -> bool {
        self.submit(Request::Chmod {
            path: path.into(),
            mode,
            recursive,
        })
    }

    pub fn mkdir(&self, path: impl Into<String>) -> bool {
        self.submit(Request::Mkdir(path.into()))
    }

    pub fn raw(&self, text: impl Into<String>) -> bool {
        self.submit(Request::Raw(text.into()))
    }

    /// Server-to-server transfer: this thread is the source, `other` the
    /// destination. Both must hold connected FTP sessions.
    pub fn site_to_site(
        &self,
        other: &ThreadHandle,
        source: impl Into<String>,
        dest: impl Into<String>,
    ) -> bool {
        let (source_cmd, serve_cmd) = fxp::fxp_pair(source, dest);
        other.submit(Request::FxpServe(serve_cmd)) && self.submit(Request::FxpSource(source_cmd))
    }

    pub fn wakeup(&self, event: WakeupEvent) -> bool {
        self.submit(Request::Wakeup(event))
    }

    pub fn set_option(&self, key: impl Into<String>, value: impl Into<String>) -> bool {
        self.submit(Request::SetOption {
            key: key.into(),
            value: value.into(),
        })
    }
}

/// Spawn a connection thread; events flow to `events`, requests through
/// the returned handle. The thread exits when every handle is dropped.
pub fn spawn(shared: EngineShared, events: UnboundedSender<SessionEvent>) -> ThreadHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = Uuid::new_v4();
    let thread = ConnectionThread {
        id,
        rx,
        events,
        shared,
        ftp: None,
        sftp: None,
        active: Active::None,
        backlog: VecDeque::new(),
        defaults: Vec::new(),
        retry: None,
        retry_at: None,
        last_url: None,
        connecting: false,
        suspended: false,
    };
    tokio::spawn(thread.run());
    ThreadHandle { id, tx }
}

#[derive(Clone, Copy, PartialEq)]
enum Active {
    None,
    Ftp,
    Sftp,
}

struct ConnectionThread {
    id: Uuid,
    rx: UnboundedReceiver<Request>,
    events: UnboundedSender<SessionEvent>,
    shared: EngineShared,
    ftp: Option<FtpSession>,
    sftp: Option<SftpSession>,
    active: Active,
    /// Requests received while a command was running.
    backlog: VecDeque<Request>,
    /// Options set before any session existed; applied at session creation.
    defaults: Vec<(String, String)>,
    retry: Option<ConnectionRetry>,
    retry_at: Option<tokio::time::Instant>,
    last_url: Option<RemoteUrl>,
    /// The running top-level command is a connect (retry bookkeeping).
    connecting: bool,
    /// Last step left the chain suspended on a decision request.
    suspended: bool,
}

impl ConnectionThread {
    async fn run(mut self) {
        log::debug!("connection thread {} started", self.id);
        loop {
            if self.busy() {
                if self.suspended {
                    // Nothing to step until a wakeup (or abort) arrives.
                    match self.rx.recv().await {
                        Some(request) => self.priority_or_backlog(request).await,
                        None => break,
                    }
                    continue;
                }
                // Jump-the-queue requests are serviced between steps.
                while let Ok(request) = self.rx.try_recv() {
                    self.priority_or_backlog(request).await;
                }
                if self.busy() && !self.suspended {
                    let status = self.step().await;
                    self.after_step(status);
                }
                continue;
            }

            if let Some(request) = self.backlog.pop_front() {
                self.handle(request).await;
                continue;
            }

            let far = tokio::time::Instant::now() + Duration::from_secs(3600);
            let retry_at = self.retry_at.unwrap_or(far);
            let keepalive = self.keepalive_deadline();
            let keepalive_at = keepalive.unwrap_or(far);
            tokio::select! {
                request = self.rx.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(retry_at), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.reconnect();
                }
                _ = tokio::time::sleep_until(keepalive_at), if keepalive.is_some() => {
                    self.start_keepalive();
                }
            }
        }
        log::debug!("connection thread {} stopped", self.id);
    }

    fn busy(&self) -> bool {
        match self.active {
            Active::Ftp => self.ftp.as_ref().is_some_and(|s| s.busy()),
            Active::Sftp => self.sftp.as_ref().is_some_and(|s| s.busy()),
            Active::None => false,
        }
    }

    async fn priority_or_backlog(&mut self, request: Request) {
        match request {
            Request::Abort => self.abort().await,
            Request::Wakeup(event) => {
                let status = self.deliver_wakeup(event).await;
                self.after_step(status);
            }
            other => self.backlog.push_back(other),
        }
    }

    async fn step(&mut self) -> ChainStatus {
        match self.active {
            Active::Ftp => match self.ftp.as_mut() {
                Some(s) => s.step().await,
                None => ChainStatus::Idle,
            },
            Active::Sftp => match self.sftp.as_mut() {
                Some(s) => s.step().await,
                None => ChainStatus::Idle,
            },
            Active::None => ChainStatus::Idle,
        }
    }

    async fn deliver_wakeup(&mut self, event: WakeupEvent) -> ChainStatus {
        self.suspended = false;
        match self.active {
            Active::Ftp => match self.ftp.as_mut() {
                Some(s) => s.wakeup(event).await,
                None => ChainStatus::Idle,
            },
            Active::Sftp => match self.sftp.as_mut() {
                Some(s) => s.wakeup(event).await,
                None => ChainStatus::Idle,
            },
            Active::None => ChainStatus::Idle,
        }
    }

    fn after_step(&mut self, status: ChainStatus) {
        self.suspended = matches!(status, ChainStatus::Suspended);
        if let ChainStatus::Finished(code) = status {
            if self.connecting {
                self.connecting = false;
                match code {
                    ResultCode::Ok => {
                        self.retry = None;
                        self.retry_at = None;
                    }
                    ResultCode::UserAbort => self.retry = None,
                    _ => self.schedule_retry(),
                }
            }
        }
    }

    async fn abort(&mut self) {
        self.retry = None;
        self.retry_at = None;
        self.connecting = false;
        self.suspended = false;
        match self.active {
            Active::Ftp => {
                if let Some(s) = self.ftp.as_mut() {
                    s.abort().await;
                }
            }
            Active::Sftp => {
                if let Some(s) = self.sftp.as_mut() {
                    s.abort().await;
                }
            }
            Active::None => {}
        }
    }

    fn settings_of_active(&self) -> Option<&fathom_core::SessionSettings> {
        match self.active {
            Active::Ftp => self.ftp.as_ref().map(|s| &s.ctx().core.settings),
            Active::Sftp => self.sftp.as_ref().map(|s| &s.ctx().core.settings),
            Active::None => None,
        }
    }

    fn schedule_retry(&mut self) {
        if self.retry.is_none() {
            self.retry = self
                .settings_of_active()
                .and_then(ConnectionRetry::from_settings);
        }
        let Some(retry) = self.retry.as_mut() else {
            return;
        };
        match retry.next_delay() {
            Some(delay) => {
                log::info!("thread {}: reconnecting in {:?}", self.id, delay);
                self.retry_at = Some(tokio::time::Instant::now() + delay);
            }
            None => {
                log::info!("thread {}: retries exhausted", self.id);
                self.retry = None;
            }
        }
    }

    fn reconnect(&mut self) {
        if let Some(url) = self.last_url.clone() {
            log::debug!("thread {}: retrying connect to {}", self.id, url.host);
            self.start_connect(url);
        }
    }

    fn keepalive_deadline(&self) -> Option<tokio::time::Instant> {
        let (connected, settings, idle) = match self.active {
            Active::Ftp => {
                let s = self.ftp.as_ref()?;
                (s.connected(), &s.ctx().core.settings, s.ctx().core.idle_for())
            }
            Active::Sftp => {
                let s = self.sftp.as_ref()?;
                (s.connected(), &s.ctx().core.settings, s.ctx().core.idle_for())
            }
            Active::None => return None,
        };
        if !connected || !settings.get_bool(keys::KEEPALIVE, false) {
            return None;
        }
        let interval = Duration::from_secs(
            settings.get_u32(keys::KEEPALIVE_INTERVAL, DEFAULT_KEEPALIVE_SECS) as u64,
        );
        let remaining = interval.saturating_sub(idle);
        Some(tokio::time::Instant::now() + remaining)
    }

    fn start_keepalive(&mut self) {
        log::debug!("thread {}: keepalive probe", self.id);
        match self.active {
            Active::Ftp => {
                if let Some(s) = self.ftp.as_mut() {
                    s.start(Box::new(ftp::ops::NoopCmd));
                }
            }
            Active::Sftp => {
                if let Some(s) = self.sftp.as_mut() {
                    s.start(Box::new(sftp::ops::NoopCmd));
                }
            }
            Active::None => {}
        }
    }

    fn ftp_session(&mut self) -> &mut FtpSession {
        self.active = Active::Ftp;
        let events = self.events.clone();
        let shared = self.shared.clone();
        let defaults = self.defaults.clone();
        self.ftp.get_or_insert_with(|| {
            let mut session = FtpSession::new(events, shared);
            for (key, value) in &defaults {
                session.ctx_mut().core.settings.set(key, value);
            }
            session
        })
    }

    fn sftp_session(&mut self) -> &mut SftpSession {
        self.active = Active::Sftp;
        let events = self.events.clone();
        let shared = self.shared.clone();
        let defaults = self.defaults.clone();
        self.sftp.get_or_insert_with(|| {
            let mut session = SftpSession::new(events, shared);
            for (key, value) in &defaults {
                session.ctx_mut().core.settings.set(key, value);
            }
            session
        })
    }

    fn start_connect(&mut self, url: RemoteUrl) {
        self.last_url = Some(url.clone());
        self.connecting = true;
        self.suspended = false;
        if url.is_sftp() {
            self.sftp_session()
                .start(Box::new(sftp::connect::ConnectCmd::new(url)));
        } else {
            self.ftp_session()
                .start(Box::new(ftp::connect::ConnectCmd::new(url)));
        }
    }

    fn report(&self, kind: ErrorKind, detail: &str) {
        let _ = self.events.send(SessionEvent::Error {
            kind,
            detail: detail.to_string(),
        });
    }

    async fn disconnect(&mut self) {
        if self.busy() {
            self.abort().await;
        }
        self.retry = None;
        self.retry_at = None;
        match self.active {
            Active::Ftp => {
                if let Some(s) = self.ftp.as_mut() {
                    // Polite close; the server may already be gone.
                    let _ = s.ctx_mut().execute("QUIT").await;
                    s.ctx_mut().drop_connection();
                }
            }
            Active::Sftp => {
                if let Some(s) = self.sftp.as_mut() {
                    s.ctx_mut().drop_connection();
                }
            }
            Active::None => return,
        }
        let _ = self.events.send(SessionEvent::Disconnected);
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Connect(url) => self.start_connect(url),
            Request::Disconnect => self.disconnect().await,
            Request::Abort => self.abort().await,
            Request::Wakeup(event) => {
                let status = self.deliver_wakeup(event).await;
                self.after_step(status);
            }
            Request::SetOption { key, value } => {
                if let Some(s) = self.ftp.as_mut() {
                    s.ctx_mut().core.settings.set(&key, &value);
                }
                if let Some(s) = self.sftp.as_mut() {
                    s.ctx_mut().core.settings.set(&key, &value);
                }
                self.defaults.push((key, value));
            }
            Request::List(path) => match self.active {
                Active::Ftp => self
                    .ftp_session()
                    .start(Box::new(ftp::list::ListCmd::new(path))),
                Active::Sftp => self
                    .sftp_session()
                    .start(Box::new(sftp::ops::ListCmd::new(path))),
                Active::None => self.report(ErrorKind::OperationFailed, "not connected"),
            },
            Request::Scan(path) => match self.active {
                Active::Ftp => self
                    .ftp_session()
                    .start(Box::new(ftp::ops::ScanCmd::new(path))),
                Active::Sftp => self
                    .sftp_session()
                    .start(Box::new(sftp::ops::ScanCmd::new(path))),
                Active::None => self.report(ErrorKind::OperationFailed, "not connected"),
            },
            Request::Get { remote, local } => match self.active {
                Active::Ftp => self
                    .ftp_session()
                    .start(Box::new(ftp::transfer::GetCmd::new(remote, local))),
                Active::Sftp => self
                    .sftp_session()
                    .start(Box::new(sftp::transfer::GetCmd::new(remote, local))),
                Active::None => self.report(ErrorKind::OperationFailed, "not connected"),
            },
            Request::Put { local, remote } => match self.active {
                Active::Ftp => self
                    .ftp_session()
                    .start(Box::new(ftp::transfer::PutCmd::new(local, remote))),
                Active::Sftp => self
                    .sftp_session()
                    .start(Box::new(sftp::transfer::PutCmd::new(local, remote))),
                Active::None => self.report(ErrorKind::OperationFailed, "not connected"),
            },
            Request::Remove(path) => match self.active {
                Active::Ftp => self
                    .ftp_session()
                    .start(Box::new(ftp::ops::RemoveCmd::new(path))),
                Active::Sftp => self
                    .sftp_session()
                    .start(Box::new(sftp::ops::RemoveCmd::new(path))),
                Active::None => self.report(ErrorKind::OperationFailed, "not connected"),
            },
            Request::Rename { from, to } => match self.active {
                Active::Ftp => self
                    .ftp_session()
                    .start(Box::new(ftp::ops::RenameCmd::new(from, to))),
                Active::Sftp => self
                    .sftp_session()
                    .start(Box::new(sftp::ops::RenameCmd::new(from, to))),
                Active::None => self.report(ErrorKind::OperationFailed, "not connected"),
            },
            Request::Chmod {
                path,
                mode,
                recursive,
            } => match self.active {
                Active::Ftp => self
                    .ftp_session()
                    .start(Box::new(ftp::ops::ChmodCmd::new(path, mode, recursive))),
                Active::Sftp => self
                    .sftp_session()
                    .start(Box::new(sftp::ops::ChmodCmd::new(path, mode, recursive))),
                Active::None => self.report(ErrorKind::OperationFailed, "not connected"),
            },
            Request::Mkdir(path) => match self.active {
                Active::Ftp => self
                    .ftp_session()
                    .start(Box::new(ftp::ops::MkdirCmd::new(path))),
                Active::Sftp => self
                    .sftp_session()
                    .start(Box::new(sftp::ops::MkdirCmd::new(path))),
                Active::None => self.report(ErrorKind::OperationFailed, "not connected"),
            },
            Request::Raw(text) => match self.active {
                Active::Ftp => self
                    .ftp_session()
                    .start(Box::new(ftp::ops::RawCmd::new(text))),
                _ => self.report(ErrorKind::OperationFailed, "raw commands are FTP only"),
            },
            Request::FxpSource(cmd) => match self.active {
                Active::Ftp => self.ftp_session().start(Box::new(cmd)),
                _ => self.report(
                    ErrorKind::OperationFailed,
                    "site-to-site requires an FTP session",
                ),
            },
            Request::FxpServe(cmd) => match self.active {
                Active::Ftp => self.ftp_session().start(Box::new(cmd)),
                _ => self.report(
                    ErrorKind::OperationFailed,
                    "site-to-site requires an FTP session",
                ),
            },
        }
    }
}
