//! Server-to-server transfer with a refused source file: the destination
//! must never see a STOR, and its cached parent listing is dropped anyway.

mod common;

use common::{drive, login_script, MockFtp, Step};
use fathom_engine::ftp::connect::ConnectCmd;
use fathom_engine::ftp::fxp::fxp_pair;
use fathom_engine::ftp::FtpSession;
use fathom_engine::{
    ChainStatus, DirectoryEntry, DirectoryListing, EngineShared, RemoteUrl, ResultCode,
    SessionEvent,
};

async fn connect(server: &MockFtp, shared: &EngineShared) -> (FtpSession, EventRx) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let mut session = FtpSession::new(tx, shared.clone());
    let url = RemoteUrl::parse(&server.url()).unwrap();
    session.start(Box::new(ConnectCmd::new(url)));
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Ok)
    );
    (session, rx)
}

type EventRx = tokio::sync::mpsc::UnboundedReceiver<SessionEvent>;

#[tokio::test]
async fn refused_retr_never_reaches_stor() {
    let mut src_script = login_script("257 \"/home/u\" is the current directory");
    src_script.extend([
        Step::Expect("CWD /pub", "250 ok"),
        Step::Expect("TYPE I", "200 binary"),
        Step::Expect("SIZE a.bin", "213 5"),
        Step::Expect("TYPE I", "200 binary"),
        Step::Pasv("PASV"),
        Step::Expect("RETR a.bin", "550 permission denied"),
    ]);
    let src_server = MockFtp::start(src_script).await;

    let mut dst_script = login_script("257 \"/home/u\" is the current directory");
    dst_script.extend([
        Step::Expect("CWD /dst", "250 ok"),
        Step::Expect("TYPE I", "200 binary"),
        Step::Expect("SIZE /dst/a.bin", "550 not found"),
        Step::Expect("TYPE I", "200 binary"),
        Step::Expect("PORT 127,0,0,1,", "200 ok"),
    ]);
    let dst_server = MockFtp::start(dst_script).await;

    let shared = EngineShared::new();
    let (mut src_session, mut src_rx) = connect(&src_server, &shared).await;
    let (mut dst_session, _dst_rx) = connect(&dst_server, &shared).await;

    // Seed a cached listing for the destination directory; a transfer
    // attempt makes it stale whether or not any data moved.
    let dst_url = RemoteUrl::parse(&dst_server.url()).unwrap();
    {
        let mut listing = DirectoryListing::new(dst_url.cache_key("/dst"));
        listing.add_entry(DirectoryEntry {
            filename: "old.bin".to_string(),
            ..Default::default()
        });
        shared.cache().insert_listing(&dst_url, "/dst", listing);
    }
    assert!(shared.cache().find_listing(&dst_url, "/dst").is_some());

    let (source_cmd, serve_cmd) = fxp_pair("/pub/a.bin", "/dst/a.bin");
    let serve_task = tokio::spawn(async move {
        dst_session.start(Box::new(serve_cmd));
        drive(&mut dst_session).await
    });

    src_session.start(Box::new(source_cmd));
    assert_eq!(
        drive(&mut src_session).await,
        ChainStatus::Finished(ResultCode::Failed)
    );
    // The source's unwind sends the serve side its finish request.
    assert_eq!(
        serve_task.await.unwrap(),
        ChainStatus::Finished(ResultCode::Ok)
    );

    while let Ok(event) = src_rx.try_recv() {
        assert!(!matches!(event, SessionEvent::TransferComplete { .. }));
    }
    assert!(shared.cache().find_listing(&dst_url, "/dst").is_none());

    let src_log = src_server.finished().await;
    assert!(src_log.iter().any(|l| l == "RETR a.bin"));
    let dst_log = dst_server.finished().await;
    assert!(!dst_log.iter().any(|l| l.starts_with("STOR")));
}
