//! Transfers colliding with an existing file: the collision suspends the
//! command, a resume decision turns into REST on the wire, and only the
//! missing tail moves — appended locally on download, appended remotely
//! on upload.

mod common;

use common::{drive, login_script, MockFtp, Step};
use fathom_engine::ftp::connect::ConnectCmd;
use fathom_engine::ftp::transfer::{GetCmd, PutCmd};
use fathom_engine::ftp::FtpSession;
use fathom_engine::{
    ChainStatus, EngineShared, FileExistsAction, RemoteUrl, ResultCode, SessionEvent, WakeupEvent,
};

#[tokio::test]
async fn resume_decision_sends_rest_and_appends() {
    let mut script = login_script("257 \"/home/u\" is the current directory");
    script.extend([
        Step::Expect("TYPE I", "200 binary"),
        Step::Expect("SIZE /home/u/file.bin", "213 10"),
        // Decision pause happens here; nothing on the wire.
        Step::Expect("TYPE I", "200 binary"),
        Step::Expect("EPSV", "500 command not understood"),
        Step::Pasv("PASV"),
        Step::Expect("REST 3", "350 restarting at 3"),
        Step::Deliver("RETR /home/u/file.bin", b"DEFGHIJ"),
    ]);
    let server = MockFtp::start(script).await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("file.bin");
    std::fs::write(&local, b"ABC").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut session = FtpSession::new(tx, EngineShared::new());
    let url = RemoteUrl::parse(&server.url()).unwrap();

    session.start(Box::new(ConnectCmd::new(url)));
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Ok)
    );

    session.start(Box::new(GetCmd::new("file.bin", local.clone())));
    assert_eq!(drive(&mut session).await, ChainStatus::Suspended);

    let status = session
        .wakeup(WakeupEvent::FileExists(FileExistsAction::Resume))
        .await;
    assert_eq!(status, ChainStatus::Running);
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Ok)
    );

    assert_eq!(std::fs::read(&local).unwrap(), b"ABCDEFGHIJ");

    let mut saw_collision = false;
    let mut resume_offset = None;
    let mut completed_bytes = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            SessionEvent::FileExists { source, destination } => {
                saw_collision = true;
                assert_eq!(source.map(|e| e.size), Some(10));
                assert_eq!(destination.map(|e| e.size), Some(3));
            }
            SessionEvent::ResumeOffset(offset) => resume_offset = Some(offset),
            SessionEvent::TransferComplete { bytes } => completed_bytes = Some(bytes),
            _ => {}
        }
    }
    assert!(saw_collision);
    assert_eq!(resume_offset, Some(3));
    assert_eq!(completed_bytes, Some(7));

    let log = server.finished().await;
    assert!(log.iter().any(|l| l == "REST 3"));
}

#[tokio::test]
async fn upload_resume_sends_rest_and_uploads_tail_only() {
    let mut script = login_script("257 \"/home/u\" is the current directory");
    script.extend([
        Step::Expect("TYPE I", "200 binary"),
        Step::Expect("SIZE /home/u/file.bin", "213 5"),
        // Decision pause happens here; nothing on the wire.
        Step::Expect("TYPE I", "200 binary"),
        Step::Expect("EPSV", "500 command not understood"),
        Step::Pasv("PASV"),
        Step::Expect("REST 5", "350 restarting at 5"),
        Step::Receive("STOR /home/u/file.bin", b"FGH"),
    ]);
    let server = MockFtp::start(script).await;

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("file.bin");
    std::fs::write(&local, b"ABCDEFGH").unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut session = FtpSession::new(tx, EngineShared::new());
    let url = RemoteUrl::parse(&server.url()).unwrap();

    session.start(Box::new(ConnectCmd::new(url)));
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Ok)
    );

    session.start(Box::new(PutCmd::new(local, "file.bin")));
    assert_eq!(drive(&mut session).await, ChainStatus::Suspended);

    let status = session
        .wakeup(WakeupEvent::FileExists(FileExistsAction::Resume))
        .await;
    assert_eq!(status, ChainStatus::Running);
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Ok)
    );

    let mut saw_collision = false;
    let mut resume_offset = None;
    let mut completed_bytes = None;
    while let Ok(event) = rx.try_recv() {
        match event {
            SessionEvent::FileExists { source, destination } => {
                saw_collision = true;
                assert_eq!(source.map(|e| e.size), Some(8));
                assert_eq!(destination.map(|e| e.size), Some(5));
            }
            SessionEvent::ResumeOffset(offset) => resume_offset = Some(offset),
            SessionEvent::TransferComplete { bytes } => completed_bytes = Some(bytes),
            _ => {}
        }
    }
    assert!(saw_collision);
    assert_eq!(resume_offset, Some(5));
    assert_eq!(completed_bytes, Some(3));

    // The Receive step already asserted the server saw only the tail.
    let log = server.finished().await;
    assert!(log.iter().any(|l| l == "REST 5"));
}
