//! FTP connect/login state machine.
//!
//! Dial → (implicit or explicit TLS) → USER → PASS → PBSZ/PROT when
//! secured → SYST → FEAT capability probe → PWD. A certificate failure
//! suspends on a peer-verify decision; an empty password with a server
//! challenge suspends on a password prompt. Terminal success records the
//! home directory and emits `Connected`.

use super::stream::SecurableStream;
use super::{control::ControlChannel, FtpCtx};
use crate::command::{Command, Flow, ResultCode};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fathom_core::settings::keys;
use fathom_core::{ErrorKind, RemoteUrl, SessionEvent, WakeupEvent};
use tokio::net::TcpStream;

enum State {
    Dial,
    AuthTls,
    User,
    Pass,
    Secure,
    Syst,
    Feat,
    Pwd,
}

pub struct ConnectCmd {
    url: RemoteUrl,
    state: State,
    /// Set once the consumer accepted an invalid certificate.
    accept_invalid: bool,
    password: String,
}

impl ConnectCmd {
    pub fn new(url: RemoteUrl) -> Self {
        let password = url.password.clone();
        Self {
            url,
            state: State::Dial,
            accept_invalid: false,
            password,
        }
    }

    fn wants_tls(&self, ctx: &FtpCtx) -> bool {
        self.url.scheme == "ftps" || ctx.core.settings.get_bool(keys::USE_SSL, false)
    }

    fn implicit_tls(&self, ctx: &FtpCtx) -> bool {
        self.wants_tls(ctx)
            && (self.url.port == 990 || ctx.core.settings.get_bool(keys::SSL_IMPLICIT, false))
    }

    async fn dial(&self, ctx: &mut FtpCtx) -> EngineResult<()> {
        let addr = (self.url.host.as_str(), self.url.port);
        let tcp = tokio::time::timeout(ctx.control_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| EngineError::Timeout)??;
        ctx.peer_addr = tcp.peer_addr().ok();
        ctx.local_addr = tcp.local_addr().ok();
        let mut stream = SecurableStream::Plain(tcp);
        if self.implicit_tls(ctx) {
            let accept = self.accept_invalid
                || ctx.core.settings.get_bool(keys::SSL_IGNORE_ERRORS, false);
            stream = stream.upgrade_tls(&self.url.host, accept).await?;
            ctx.secured = true;
        }
        ctx.control = Some(ControlChannel::new(stream, ctx.control_timeout()));
        let greeting = ctx.read_reply().await?;
        if greeting.code != 220 {
            return Err(greeting.into_error());
        }
        Ok(())
    }

    async fn auth_tls(&self, ctx: &mut FtpCtx) -> EngineResult<()> {
        ctx.expect("AUTH TLS", 2).await?;
        let control = ctx.control.take().ok_or(EngineError::Disconnected)?;
        let accept =
            self.accept_invalid || ctx.core.settings.get_bool(keys::SSL_IGNORE_ERRORS, false);
        let stream = control
            .into_stream()
            .upgrade_tls(&self.url.host, accept)
            .await?;
        ctx.control = Some(ControlChannel::new(stream, ctx.control_timeout()));
        ctx.secured = true;
        Ok(())
    }

    async fn secure_data(&self, ctx: &mut FtpCtx) -> EngineResult<()> {
        ctx.expect_ok("PBSZ 0").await?;
        let mode = ctx.core.settings.get_str(keys::SSL_PROT_MODE, "P");
        ctx.expect_ok(&format!("PROT {}", mode)).await?;
        ctx.data_protected = mode == "P";
        Ok(())
    }

    async fn probe_features(&self, ctx: &mut FtpCtx) -> EngineResult<()> {
        let reply = ctx.execute("FEAT").await?;
        if !reply.is_positive() {
            // No FEAT support: leave the conservative defaults in place.
            return Ok(());
        }
        let body: Vec<String> = reply
            .body()
            .iter()
            .map(|l| l.trim().to_uppercase())
            .collect();
        let has = |token: &str| body.iter().any(|l| l.starts_with(token));

        let feats = [
            (keys::FEAT_MDTM, has("MDTM")),
            (keys::FEAT_PRET, has("PRET")),
            (keys::FEAT_MLSD, has("MLST") || has("MLSD")),
            (keys::FEAT_REST, has("REST")),
            (keys::FEAT_SSCN, has("SSCN")),
            (keys::FEAT_CPSV, has("CPSV")),
            (keys::FEAT_EPSV, has("EPSV")),
            (keys::FEAT_EPRT, has("EPRT")),
        ];
        for (key, supported) in feats {
            // Never re-enable a capability the consumer force-disabled.
            if !ctx.core.settings.get_bool(key, true) {
                continue;
            }
            ctx.core.settings.set(key, supported);
        }
        log::debug!(
            "features: {}",
            body.iter().map(String::as_str).collect::<Vec<_>>().join(" ")
        );

        if has("UTF8") {
            let _ = ctx.execute("OPTS UTF8 ON").await;
            ctx.core.settings.set(keys::ENCODING, "utf-8");
        }
        Ok(())
    }
}

/// Extract the quoted path from a 257 PWD reply.
pub fn parse_pwd(text: &str) -> Option<String> {
    let start = text.find('"')?;
    let end = text[start + 1..].find('"')? + start + 1;
    Some(text[start + 1..end].to_string())
}

#[async_trait]
impl Command<FtpCtx> for ConnectCmd {
    fn name(&self) -> &'static str {
        "connect"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        let step: EngineResult<()> = match self.state {
            State::Dial => {
                ctx.core.emit(SessionEvent::Connecting);
                ctx.core.url = Some(self.url.clone());
                match self.dial(ctx).await {
                    Ok(()) => {
                        self.state = if self.wants_tls(ctx) && !ctx.secured {
                            State::AuthTls
                        } else {
                            State::User
                        };
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            State::AuthTls => match self.auth_tls(ctx).await {
                Ok(()) => {
                    self.state = State::User;
                    Ok(())
                }
                Err(EngineError::Tls(e)) => {
                    // Suspend for a trust decision; on accept we redial
                    // with verification disabled.
                    ctx.drop_connection();
                    ctx.core.emit(SessionEvent::PeerVerify {
                        detail: e.to_string(),
                    });
                    return Flow::Suspended;
                }
                Err(e) => Err(e),
            },
            State::User => {
                let reply = match ctx.execute(&format!("USER {}", self.url.user)).await {
                    Ok(r) => r,
                    Err(e) => return self.bail(ctx, e),
                };
                match reply.code {
                    331 | 332 => {
                        // A challenge with no stored password needs the
                        // consumer (one-time-password schemes put the
                        // challenge in the 331 text).
                        if self.password.is_empty() {
                            ctx.core.emit(SessionEvent::PubkeyPassword);
                            self.state = State::Pass;
                            return Flow::Suspended;
                        }
                        self.state = State::Pass;
                        Ok(())
                    }
                    230 => {
                        self.state = State::Secure;
                        Ok(())
                    }
                    _ => Err(reply.into_error()),
                }
            }
            State::Pass => {
                let cmd = format!("PASS {}", self.password);
                match ctx.execute(&cmd).await {
                    Ok(reply) if reply.class() == 2 => {
                        self.state = State::Secure;
                        Ok(())
                    }
                    Ok(reply) => Err(reply.into_error()),
                    Err(e) => Err(e),
                }
            }
            State::Secure => {
                if ctx.secured {
                    match self.secure_data(ctx).await {
                        Ok(()) => {
                            self.state = State::Syst;
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                } else {
                    self.state = State::Syst;
                    Ok(())
                }
            }
            State::Syst => {
                // Informational only; failure is irrelevant.
                let _ = ctx.execute("SYST").await;
                self.state = State::Feat;
                Ok(())
            }
            State::Feat => match self.probe_features(ctx).await {
                Ok(()) => {
                    self.state = State::Pwd;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            State::Pwd => {
                let reply = match ctx.expect("PWD", 2).await {
                    Ok(r) => r,
                    Err(e) => return self.bail(ctx, e),
                };
                let home = parse_pwd(reply.text()).unwrap_or_else(|| "/".to_string());
                ctx.core.home_dir = home.clone();
                ctx.core.current_dir = home;
                ctx.core.connected = true;
                ctx.core.emit(SessionEvent::Connected);
                return Flow::Done(ResultCode::Ok);
            }
        };

        match step {
            Ok(()) => Flow::Continue,
            Err(e) => self.bail(ctx, e),
        }
    }

    async fn wakeup(&mut self, ctx: &mut FtpCtx, event: WakeupEvent) -> Flow<FtpCtx> {
        match event {
            WakeupEvent::PeerVerify(true) => {
                self.accept_invalid = true;
                self.state = State::Dial;
                Flow::Continue
            }
            WakeupEvent::PeerVerify(false) => {
                ctx.drop_connection();
                Flow::Done(ResultCode::UserAbort)
            }
            WakeupEvent::Password(password) => {
                self.password = password;
                self.process(ctx).await
            }
            other => {
                log::warn!("connect: unexpected wakeup {:?}", other);
                Flow::Suspended
            }
        }
    }
}

impl ConnectCmd {
    fn bail(&self, ctx: &mut FtpCtx, e: EngineError) -> Flow<FtpCtx> {
        let kind = match e.kind() {
            ErrorKind::LoginFailed => ErrorKind::LoginFailed,
            _ => ErrorKind::ConnectFailed,
        };
        ctx.core.report_error(kind, e.to_string());
        ctx.drop_connection();
        Flow::Done(ResultCode::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pwd_reply_paths() {
        assert_eq!(parse_pwd(r#""/home/u" is the current directory"#).unwrap(), "/home/u");
        assert_eq!(parse_pwd(r#""/" is current"#).unwrap(), "/");
        assert!(parse_pwd("no quotes here").is_none());
    }
}
