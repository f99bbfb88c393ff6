//! FTP / FTPS protocol state machines.
//!
//! - `stream` / `control` — transport and command/reply codec
//! - `connect` — login state machine (TLS, USER/PASS, FEAT, PWD)
//! - `data` — data-channel negotiation (EPSV → PASV → PORT fallback)
//! - `list` — directory listing (cache, STAT, LIST/MLSD)
//! - `transfer` — RETR/STOR with resume and throttling
//! - `ops` — cwd, mkdir, remove, rename, chmod, raw, scan, keepalive
//! - `fxp` — server-to-server transfers between two sessions

pub mod connect;
pub mod control;
pub mod data;
pub mod fxp;
pub mod list;
pub mod ops;
pub mod stream;
pub mod transfer;

use crate::command::{ChainStatus, Command, CommandChain, ResultCode};
use crate::error::{EngineError, EngineResult};
use crate::session::{EngineShared, SessionCore};
use control::{ControlChannel, Reply};
use fathom_core::settings::keys;
use fathom_core::{ErrorKind, SessionEvent, WakeupEvent};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

pub(crate) const DEFAULT_CONTROL_TIMEOUT_SECS: u32 = 60;
pub(crate) const DEFAULT_DATA_TIMEOUT_SECS: u32 = 90;

/// What a chained data-negotiation command should set up.
pub struct DataRequest {
    /// The data command to issue once the channel is negotiated
    /// ("LIST", "MLSD", "RETR name", "STOR name").
    pub command: String,
    /// Resume offset; sent as REST when non-zero and supported.
    pub rest: u64,
    /// TYPE I when true, TYPE A otherwise.
    pub binary: bool,
    /// Error kind reported if the negotiation fails outright.
    pub error_kind: ErrorKind,
}

/// Mutable state shared by all FTP commands of one session.
pub struct FtpCtx {
    pub core: SessionCore,
    pub control: Option<ControlChannel>,
    /// Control channel is TLS-wrapped.
    pub secured: bool,
    /// PROT P is currently active on the data channel.
    pub data_protected: bool,
    /// SSCN ON has been sent and not yet reset.
    pub sscn_active: bool,
    /// Parameter slot for a chained data-negotiation command.
    pub data_request: Option<DataRequest>,
    /// Established data stream left behind by the negotiation command.
    pub data_result: Option<stream::SecurableStream>,
    /// REST offset actually accepted by the server for the last request.
    pub applied_rest: u64,
    /// Control connection endpoints, recorded at dial time; PASV address
    /// substitution and PORT/EPRT need them.
    pub peer_addr: Option<std::net::SocketAddr>,
    pub local_addr: Option<std::net::SocketAddr>,
}

impl FtpCtx {
    pub fn new(events: UnboundedSender<SessionEvent>, shared: EngineShared) -> Self {
        Self {
            core: SessionCore::new(events, shared),
            control: None,
            secured: false,
            data_protected: false,
            sscn_active: false,
            data_request: None,
            data_result: None,
            applied_rest: 0,
            peer_addr: None,
            local_addr: None,
        }
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(
            self.core
                .settings
                .get_u32(keys::CONTROL_TIMEOUT, DEFAULT_CONTROL_TIMEOUT_SECS) as u64,
        )
    }

    pub fn data_timeout(&self) -> Duration {
        Duration::from_secs(
            self.core
                .settings
                .get_u32(keys::DATA_TIMEOUT, DEFAULT_DATA_TIMEOUT_SECS) as u64,
        )
    }

    pub async fn execute(&mut self, cmd: &str) -> EngineResult<Reply> {
        let control = self.control.as_mut().ok_or(EngineError::Disconnected)?;
        control.execute(cmd, &self.core).await
    }

    pub async fn expect(&mut self, cmd: &str, class: u16) -> EngineResult<Reply> {
        let control = self.control.as_mut().ok_or(EngineError::Disconnected)?;
        control.expect(cmd, class, &self.core).await
    }

    pub async fn expect_ok(&mut self, cmd: &str) -> EngineResult<Reply> {
        self.expect(cmd, 2).await
    }

    /// Absolute form of `path`, relative paths anchored at the current
    /// remote directory.
    pub fn resolve_path(&self, path: &str) -> String {
        self.core.resolve_path(path)
    }

    pub async fn read_reply(&mut self) -> EngineResult<Reply> {
        let control = self.control.as_mut().ok_or(EngineError::Disconnected)?;
        control.read_reply(&self.core).await
    }

    /// Tear the transport down and reset connection-scoped state.
    pub fn drop_connection(&mut self) {
        self.control = None;
        self.secured = false;
        self.data_protected = false;
        self.sscn_active = false;
        self.data_request = None;
        self.data_result = None;
        self.peer_addr = None;
        self.local_addr = None;
        self.core.reset_after_disconnect();
    }

    /// Report a command failure as an error event with the given kind
    /// fallback, honoring the session's reporting toggle.
    pub fn fail(&self, err: &EngineError, fallback: ErrorKind) -> ResultCode {
        self.core.fail(err, fallback)
    }

    /// [`fail`](Self::fail) for mid-transfer errors: a timeout or dropped
    /// transport also tears the connection down, since the pending
    /// completion reply would desync the next command's exchange.
    pub fn fail_transport(&mut self, err: &EngineError, fallback: ErrorKind) -> ResultCode {
        let code = self.fail(err, fallback);
        if matches!(err, EngineError::Disconnected | EngineError::Timeout) {
            self.drop_connection();
            self.core.emit(SessionEvent::Disconnected);
        }
        code
    }
}

/// One FTP session: context plus its command chain.
pub struct FtpSession {
    ctx: FtpCtx,
    chain: CommandChain<FtpCtx>,
}

impl FtpSession {
    pub fn new(events: UnboundedSender<SessionEvent>, shared: EngineShared) -> Self {
        Self {
            ctx: FtpCtx::new(events, shared),
            chain: CommandChain::new(),
        }
    }

    pub fn ctx(&self) -> &FtpCtx {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut FtpCtx {
        &mut self.ctx
    }

    pub fn busy(&self) -> bool {
        !self.chain.is_empty()
    }

    pub fn connected(&self) -> bool {
        self.ctx.core.connected
    }

    /// Begin a top-level operation. The thread serializes submissions, so
    /// a busy chain is a caller bug.
    pub fn start(&mut self, cmd: Box<dyn Command<FtpCtx>>) {
        self.ctx.core.touch();
        self.chain.start(cmd);
    }

    pub async fn step(&mut self) -> ChainStatus {
        let status = self.chain.step(&mut self.ctx).await;
        self.finish(status)
    }

    pub async fn wakeup(&mut self, event: WakeupEvent) -> ChainStatus {
        let status = self.chain.wakeup(&mut self.ctx, event).await;
        self.finish(status)
    }

    pub async fn abort(&mut self) {
        if self.chain.is_empty() {
            return;
        }
        // Abort an in-flight transfer on the wire as well; best-effort.
        if self.ctx.data_result.is_some() || self.ctx.data_request.is_some() {
            if let Some(control) = self.ctx.control.as_mut() {
                let _ = control.send_command("ABOR", &self.ctx.core).await;
            }
        }
        self.chain.abort(&mut self.ctx).await;
        self.ctx.data_request = None;
        self.ctx.data_result = None;
        self.ctx.core.emit(SessionEvent::Ready);
    }

    fn finish(&mut self, status: ChainStatus) -> ChainStatus {
        if let ChainStatus::Finished(code) = status {
            log::debug!("command finished: {:?}", code);
            self.ctx.core.touch();
            self.ctx.core.emit(SessionEvent::Ready);
            self.ctx.core.emit(SessionEvent::Idle);
            if code == ResultCode::Ok {
                // Leftover data slots would leak into the next operation.
                debug_assert!(self.ctx.data_request.is_none());
            }
            self.ctx.data_request = None;
            self.ctx.data_result = None;
        }
        status
    }
}
