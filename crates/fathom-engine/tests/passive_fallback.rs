//! A server that rejects EPSV loses it for the rest of the session: the
//! second listing must go straight to PASV.

mod common;

use common::{drive, login_script, MockFtp, Step};
use fathom_engine::ftp::connect::ConnectCmd;
use fathom_engine::ftp::list::ListCmd;
use fathom_engine::ftp::FtpSession;
use fathom_engine::{ChainStatus, EngineShared, RemoteUrl, ResultCode, SessionEvent};

const LISTING_ONE: &[u8] = b"-rw-r--r--   1 alice staff     1234 Jan  5 12:34 notes.txt\r\ndrwxr-xr-x   2 alice staff     4096 Mar 10  2023 photos\r\n";
const LISTING_TWO: &[u8] = b"-rw-r--r--   1 alice staff       99 Feb  1 09:00 todo.md\r\n";

#[tokio::test]
async fn rejected_epsv_is_not_retried() {
    let mut script = login_script("257 \"/home/u\" is the current directory");
    script.extend([
        Step::Expect("TYPE A", "200 switching to ASCII"),
        Step::Expect("EPSV", "500 command not understood"),
        Step::Pasv("PASV"),
        Step::Deliver("LIST", LISTING_ONE),
        Step::Expect("TYPE A", "200 switching to ASCII"),
        Step::Pasv("PASV"),
        Step::Deliver("LIST", LISTING_TWO),
    ]);
    let server = MockFtp::start(script).await;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut session = FtpSession::new(tx, EngineShared::new());
    let url = RemoteUrl::parse(&server.url()).unwrap();

    session.start(Box::new(ConnectCmd::new(url)));
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Ok)
    );

    session.start(Box::new(ListCmd::new("/home/u")));
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Ok)
    );

    // Refresh: bypasses the cache, so it hits the wire again.
    session.start(Box::new(ListCmd::fresh("/home/u")));
    assert_eq!(
        drive(&mut session).await,
        ChainStatus::Finished(ResultCode::Ok)
    );

    let mut listings = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionEvent::DirectoryListing(listing) = event {
            listings.push(listing);
        }
    }
    assert_eq!(listings.len(), 2);
    assert_eq!(listings[0].entries().len(), 2);
    assert_eq!(listings[0].entries()[0].filename, "notes.txt");
    assert!(listings[0].entries()[1].is_dir());
    assert_eq!(listings[1].entries().len(), 1);

    let log = server.finished().await;
    assert_eq!(log.iter().filter(|l| l.starts_with("EPSV")).count(), 1);
    assert_eq!(log.iter().filter(|l| l.starts_with("PASV")).count(), 2);
}
