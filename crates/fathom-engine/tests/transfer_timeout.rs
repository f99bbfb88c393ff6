//! A data channel that goes silent mid-transfer: the pump times out and
//! the session is torn down outright, rather than leaving the pending
//! completion reply to desync the next command's exchange.

mod common;

use common::{drive, login_script, MockFtp, Step};
use fathom_core::settings::keys;
use fathom_engine::ftp::connect::ConnectCmd;
use fathom_engine::ftp::transfer::GetCmd;
use fathom_engine::ftp::FtpSession;
use fathom_engine::{ChainStatus, EngineShared, RemoteUrl, ResultCode, SessionEvent};

#[tokio::test]
async fn stalled_data_channel_disconnects_session() {
    let mut script = login_script("257 \"/home/u\" is the current directory");
    script.extend([
        Step::Expect("TYPE I", "200 binary"),
        Step::Expect("SIZE /home/u/file.bin", "550 no such file"),
        Step::Expect("TYPE I", "200 binary"),
        Step::Expect("EPSV", "500 command not understood"),
        Step::Pasv("PASV"),
        Step::Stall("RETR /home/u/file.bin", b"ABC"),
    ]);
    let server = MockFtp::start(script).await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("file.bin");

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut session = FtpSession::new(tx, EngineShared::new());
    let url = RemoteUrl::parse(&server.url()).unwrap();

    session.start(Box::new(ConnectCmd::new(url)));
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Ok)
    );
    session.ctx_mut().core.settings.set(keys::DATA_TIMEOUT, 1);

    session.start(Box::new(GetCmd::new("file.bin", local)));
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Failed)
    );

    // The timeout must not leave a half-open session behind.
    assert!(!session.connected());
    let mut saw_error = false;
    let mut saw_disconnect = false;
    while let Ok(event) = rx.try_recv() {
        match event {
            SessionEvent::Error { .. } => saw_error = true,
            SessionEvent::Disconnected => saw_disconnect = true,
            _ => {}
        }
    }
    assert!(saw_error);
    assert!(saw_disconnect);

    server.finished().await;
}
