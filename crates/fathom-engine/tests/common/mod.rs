//! Scripted single-connection FTP server for integration tests.
//!
//! The script is a fixed sequence of expectations; any deviation panics
//! inside the server task and surfaces when the test joins it.

// Shared by several test binaries; not all of them use every helper.
#![allow(dead_code)]

use fathom_engine::ftp::FtpSession;
use fathom_engine::ChainStatus;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

/// Step a session until it suspends, finishes, or goes idle.
pub async fn drive(session: &mut FtpSession) -> ChainStatus {
    loop {
        match session.step().await {
            ChainStatus::Running => continue,
            other => return other,
        }
    }
}

pub enum Step {
    /// Expect a command starting with the prefix, answer with the reply.
    Expect(&'static str, &'static str),
    /// Expect the prefix, bind a passive data listener and answer 227
    /// pointing at it.
    Pasv(&'static str),
    /// Expect the data command, answer 150, write the payload on the
    /// accepted data connection, close it, then send 226.
    Deliver(&'static str, &'static [u8]),
    /// Expect the data command, answer 150, read the uploaded bytes to
    /// EOF, assert they match, then send 226.
    Receive(&'static str, &'static [u8]),
    /// Expect the data command, answer 150, write a partial payload and
    /// then go silent — no close, no 226 — until the client gives up and
    /// drops the control connection.
    Stall(&'static str, &'static [u8]),
}

pub struct MockFtp {
    pub addr: SocketAddr,
    log: Arc<Mutex<Vec<String>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockFtp {
    pub async fn start(script: Vec<Step>) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock");
        let addr = listener.local_addr().expect("mock addr");
        let log = Arc::new(Mutex::new(Vec::new()));
        let task_log = Arc::clone(&log);

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("control accept");
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            write
                .write_all(b"220 mock ready\r\n")
                .await
                .expect("greeting");

            let mut data_listener: Option<TcpListener> = None;
            for step in script {
                match step {
                    Step::Expect(prefix, reply) => {
                        expect_line(&mut lines, &task_log, prefix).await;
                        write
                            .write_all(format!("{}\r\n", reply).as_bytes())
                            .await
                            .expect("reply");
                    }
                    Step::Pasv(prefix) => {
                        expect_line(&mut lines, &task_log, prefix).await;
                        let dl = TcpListener::bind("127.0.0.1:0").await.expect("data bind");
                        let port = dl.local_addr().expect("data addr").port();
                        data_listener = Some(dl);
                        let reply = format!(
                            "227 Entering Passive Mode (127,0,0,1,{},{})\r\n",
                            port / 256,
                            port % 256
                        );
                        write.write_all(reply.as_bytes()).await.expect("227");
                    }
                    Step::Deliver(prefix, payload) => {
                        expect_line(&mut lines, &task_log, prefix).await;
                        write
                            .write_all(b"150 Opening data connection\r\n")
                            .await
                            .expect("150");
                        let dl = data_listener.take().expect("PASV step must precede");
                        let (mut data, _) = dl.accept().await.expect("data accept");
                        data.write_all(payload).await.expect("payload");
                        data.shutdown().await.expect("data close");
                        drop(data);
                        write
                            .write_all(b"226 Transfer complete\r\n")
                            .await
                            .expect("226");
                    }
                    Step::Receive(prefix, expected) => {
                        expect_line(&mut lines, &task_log, prefix).await;
                        write
                            .write_all(b"150 Opening data connection\r\n")
                            .await
                            .expect("150");
                        let dl = data_listener.take().expect("PASV step must precede");
                        let (mut data, _) = dl.accept().await.expect("data accept");
                        let mut got = Vec::new();
                        data.read_to_end(&mut got).await.expect("data read");
                        drop(data);
                        assert_eq!(got, expected, "uploaded payload mismatch");
                        write
                            .write_all(b"226 Transfer complete\r\n")
                            .await
                            .expect("226");
                    }
                    Step::Stall(prefix, partial) => {
                        expect_line(&mut lines, &task_log, prefix).await;
                        write
                            .write_all(b"150 Opening data connection\r\n")
                            .await
                            .expect("150");
                        let dl = data_listener.take().expect("PASV step must precede");
                        let (mut data, _) = dl.accept().await.expect("data accept");
                        data.write_all(partial).await.expect("partial payload");
                        data.flush().await.expect("partial flush");
                        // Hold both sockets open; the control read returns
                        // once the client tears the connection down.
                        let _ = lines.next_line().await;
                        drop(data);
                    }
                }
            }
        });

        Self { addr, log, handle }
    }

    /// Join the server task, propagating any script-mismatch panic.
    pub async fn finished(self) -> Vec<String> {
        self.handle.await.expect("mock server script");
        self.log.lock().expect("log lock").clone()
    }

    pub fn url(&self) -> String {
        format!("ftp://user:pw@127.0.0.1:{}/", self.addr.port())
    }
}

async fn expect_line(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    log: &Arc<Mutex<Vec<String>>>,
    prefix: &str,
) -> String {
    let line = lines
        .next_line()
        .await
        .expect("control read")
        .expect("client closed early");
    log.lock().expect("log lock").push(line.clone());
    assert!(
        line.starts_with(prefix),
        "mock expected '{}', client sent '{}'",
        prefix,
        line
    );
    line
}

/// The standard login exchange: USER/PASS, SYST, FEAT (refused), PWD.
pub fn login_script(home: &'static str) -> Vec<Step> {
    vec![
        Step::Expect("USER user", "331 password required"),
        Step::Expect("PASS pw", "230 logged in"),
        Step::Expect("SYST", "215 UNIX Type: L8"),
        Step::Expect("FEAT", "500 no extensions"),
        Step::Expect("PWD", home),
    ]
}
