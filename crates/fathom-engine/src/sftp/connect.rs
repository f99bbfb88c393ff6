//! SFTP connect: TCP + SSH handshake, host-key verification against a
//! pinned fingerprint, then the authentication ladder (agent, key file
//! with passphrase prompt, password, keyboard-interactive).

use super::SftpCtx;
use crate::command::{Command, Flow, ResultCode};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fathom_core::settings::keys;
use fathom_core::{ErrorKind, RemoteUrl, SessionEvent, WakeupEvent};
use ssh2::{HashType, KeyboardInteractivePrompt, Prompt, Session};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};

enum State {
    Dial,
    /// Host key unknown or changed; waiting for a trust decision.
    Verify,
    Auth,
    Open,
}

pub struct ConnectCmd {
    url: RemoteUrl,
    password: String,
    state: State,
    fingerprint: String,
    /// A key passphrase was already requested once; a second failure falls
    /// through to password auth instead of prompting forever.
    passphrase: Option<String>,
    passphrase_prompted: bool,
}

impl ConnectCmd {
    pub fn new(url: RemoteUrl) -> Self {
        let password = url.password.clone();
        Self {
            url,
            password,
            state: State::Dial,
            fingerprint: String::new(),
            passphrase: None,
            passphrase_prompted: false,
        }
    }

    fn dial(&mut self, ctx: &mut SftpCtx) -> EngineResult<()> {
        ctx.core.emit(SessionEvent::Connecting);
        ctx.core.url = Some(self.url.clone());

        let addr = (self.url.host.as_str(), self.url.port)
            .to_socket_addrs()
            .map_err(EngineError::Io)?
            .next()
            .ok_or_else(|| {
                EngineError::protocol(format!("no address for host {}", self.url.host))
            })?;
        let tcp =
            TcpStream::connect_timeout(&addr, ctx.control_timeout()).map_err(EngineError::Io)?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(ctx.control_timeout().as_millis() as u32);
        session.handshake()?;

        let digest = session
            .host_key_hash(HashType::Sha256)
            .ok_or_else(|| EngineError::protocol("server offered no host key"))?;
        self.fingerprint = hex::encode(digest);
        ctx.session = Some(session);
        Ok(())
    }

    /// True when the fingerprint matches the pinned one; false suspends for
    /// a trust decision (first use or a changed key).
    fn verify_host_key(&self, ctx: &SftpCtx) -> bool {
        let pinned = ctx.core.settings.get_str(keys::SFTP_HOST_FINGERPRINT, "");
        !pinned.is_empty() && pinned.eq_ignore_ascii_case(&self.fingerprint)
    }

    fn authenticate(&mut self, ctx: &mut SftpCtx) -> EngineResult<AuthOutcome> {
        let session = ctx.session.as_ref().ok_or(EngineError::Disconnected)?;
        let user = self.url.user.clone();
        if session.authenticated() {
            return Ok(AuthOutcome::Done);
        }

        if session.userauth_agent(&user).is_ok() {
            log::debug!("authenticated via agent");
            return Ok(AuthOutcome::Done);
        }

        let configured = ctx.core.settings.get_str(keys::SFTP_KEY_PATH, "");
        let key_path = if configured.is_empty() {
            default_key_path()
        } else {
            Some(PathBuf::from(&configured))
        };
        if let Some(key_path) = key_path {
            let passphrase = self
                .passphrase
                .clone()
                .or_else(|| ctx.core.settings.get(keys::SFTP_KEY_PASSPHRASE).map(String::from));
            let result =
                session.userauth_pubkey_file(&user, None, &key_path, passphrase.as_deref());
            match result {
                Ok(()) => {
                    log::debug!("authenticated via key file {}", key_path.display());
                    return Ok(AuthOutcome::Done);
                }
                // Only an explicitly configured key is worth a passphrase
                // prompt; a stray default key falls through to passwords.
                Err(e) if !configured.is_empty() && !self.passphrase_prompted => {
                    log::debug!("key file auth failed ({}), requesting passphrase", e);
                    self.passphrase_prompted = true;
                    return Ok(AuthOutcome::NeedSecret);
                }
                Err(e) => log::debug!("key file auth failed: {}", e),
            }
        }

        if self.password.is_empty() {
            return Ok(AuthOutcome::NeedSecret);
        }
        if session.userauth_password(&user, &self.password).is_ok() {
            return Ok(AuthOutcome::Done);
        }

        // Some servers only offer keyboard-interactive; answer every
        // prompt with the password.
        let mut prompter = PasswordPrompter {
            password: &self.password,
        };
        session.userauth_keyboard_interactive(&user, &mut prompter)?;
        Ok(AuthOutcome::Done)
    }

    fn open(&mut self, ctx: &mut SftpCtx) -> EngineResult<()> {
        let session = ctx.session.as_ref().ok_or(EngineError::Disconnected)?;
        let sftp = session.sftp()?;
        let start = if self.url.path == "/" || self.url.path.is_empty() {
            ".".to_string()
        } else {
            self.url.path.clone()
        };
        let home = sftp
            .realpath(Path::new(&start))?
            .to_string_lossy()
            .into_owned();
        ctx.sftp = Some(sftp);
        ctx.core.home_dir = home.clone();
        ctx.core.current_dir = home;
        ctx.core.connected = true;
        ctx.core.emit(SessionEvent::Connected);
        Ok(())
    }

    fn bail(&self, ctx: &mut SftpCtx, e: &EngineError, fallback: ErrorKind) -> Flow<SftpCtx> {
        let code = ctx.fail(e, fallback);
        ctx.drop_connection();
        Flow::Done(code)
    }
}

enum AuthOutcome {
    Done,
    /// A password or key passphrase is needed from the consumer.
    NeedSecret,
}

/// First of the conventional key files that exists on disk.
fn default_key_path() -> Option<PathBuf> {
    let ssh_dir = dirs::home_dir()?.join(".ssh");
    ["id_ed25519", "id_rsa"]
        .iter()
        .map(|name| ssh_dir.join(name))
        .find(|p| p.exists())
}

struct PasswordPrompter<'a> {
    password: &'a str,
}

impl KeyboardInteractivePrompt for PasswordPrompter<'_> {
    fn prompt<'b>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'b>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.password.to_string()).collect()
    }
}

#[async_trait]
impl Command<SftpCtx> for ConnectCmd {
    fn name(&self) -> &'static str {
        "sftp-connect"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        match self.state {
            State::Dial => {
                if let Err(e) = self.dial(ctx) {
                    return self.bail(ctx, &e, ErrorKind::ConnectFailed);
                }
                if self.verify_host_key(ctx) {
                    self.state = State::Auth;
                    return Flow::Continue;
                }
                ctx.core.emit(SessionEvent::PeerVerify {
                    detail: format!("SHA256:{}", self.fingerprint),
                });
                self.state = State::Verify;
                Flow::Suspended
            }
            State::Verify => Flow::Suspended,
            State::Auth => match self.authenticate(ctx) {
                Ok(AuthOutcome::Done) => {
                    self.state = State::Open;
                    Flow::Continue
                }
                Ok(AuthOutcome::NeedSecret) => {
                    ctx.core.emit(SessionEvent::PubkeyPassword);
                    Flow::Suspended
                }
                Err(e) => self.bail(ctx, &e, ErrorKind::LoginFailed),
            },
            State::Open => match self.open(ctx) {
                Ok(()) => Flow::Done(ResultCode::Ok),
                Err(e) => self.bail(ctx, &e, ErrorKind::ConnectFailed),
            },
        }
    }

    async fn wakeup(&mut self, ctx: &mut SftpCtx, event: WakeupEvent) -> Flow<SftpCtx> {
        match event {
            WakeupEvent::PeerVerify(true) if matches!(self.state, State::Verify) => {
                // Pin the accepted key for the rest of the session.
                ctx.core
                    .settings
                    .set(keys::SFTP_HOST_FINGERPRINT, &self.fingerprint);
                self.state = State::Auth;
                self.process(ctx).await
            }
            WakeupEvent::PeerVerify(false) if matches!(self.state, State::Verify) => {
                ctx.drop_connection();
                Flow::Done(ResultCode::UserAbort)
            }
            WakeupEvent::Password(secret) => {
                if self.passphrase_prompted && self.passphrase.is_none() {
                    self.passphrase = Some(secret);
                } else {
                    self.password = secret;
                }
                self.process(ctx).await
            }
            _ => Flow::Suspended,
        }
    }
}
