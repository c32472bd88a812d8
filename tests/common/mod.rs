//! In-process nsqd and nsqlookupd stand-ins for integration tests.
//!
//! [`MockNsqd`] speaks enough of the V2 protocol for the client: it answers
//! IDENTIFY, SUB and the publish commands with `OK`, CLS with `CLOSE_WAIT`,
//! and records every command line it receives. Tests push messages and
//! heartbeats to connected clients. [`MockLookupd`] answers lookup queries
//! with a producer list tests can change between polls.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

const FRAME_RESPONSE: u32 = 0;
const FRAME_MESSAGE: u32 = 2;

const IDENTIFY_RESPONSE: &[u8] = br#"{"max_rdy_count":2500,"version":"1.3.0","max_msg_timeout":900000,"msg_timeout":60000}"#;

/// Route client logs to the test output; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One command received by the mock.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub conn: usize,
    pub line: String,
    pub body: Vec<u8>,
}

enum Outbound {
    Frame(Vec<u8>),
    Hangup,
}

#[derive(Default)]
struct State {
    commands: Mutex<Vec<Recorded>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<Outbound>>>,
}

pub struct MockNsqd {
    pub addr: String,
    state: Arc<State>,
}

impl MockNsqd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(State::default());

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut next_conn = 0;
            while let Ok((socket, _)) = listener.accept().await {
                let (tx, rx) = mpsc::unbounded_channel();
                accept_state.clients.lock().unwrap().push(tx.clone());
                tokio::spawn(serve(next_conn, socket, Arc::clone(&accept_state), tx, rx));
                next_conn += 1;
            }
        });

        Self { addr, state }
    }

    /// All command lines received so far, in arrival order.
    pub fn commands(&self) -> Vec<String> {
        self.recorded().into_iter().map(|r| r.line).collect()
    }

    pub fn recorded(&self) -> Vec<Recorded> {
        self.state.commands.lock().unwrap().clone()
    }

    pub fn count(&self, line: &str) -> usize {
        self.commands().iter().filter(|c| c.as_str() == line).count()
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    /// Poll until `check` holds for the recorded commands.
    pub async fn wait_for<F>(&self, timeout: Duration, check: F) -> bool
    where
        F: Fn(&[String]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check(&self.commands()) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_for_line(&self, line: &str, timeout: Duration) -> bool {
        self.wait_for(timeout, |cmds| cmds.iter().any(|c| c == line)).await
    }

    pub fn send_message(&self, id: &[u8; 16], attempts: u16, body: &[u8]) {
        let mut data = Vec::with_capacity(26 + body.len());
        data.extend_from_slice(&1_700_000_000_000_000_000i64.to_be_bytes());
        data.extend_from_slice(&attempts.to_be_bytes());
        data.extend_from_slice(id);
        data.extend_from_slice(body);
        self.broadcast(frame(FRAME_MESSAGE, &data));
    }

    pub fn send_heartbeat(&self) {
        self.broadcast(frame(FRAME_RESPONSE, b"_heartbeat_"));
    }

    /// Drop every client connection from the server side.
    pub fn hang_up(&self) {
        for client in self.state.clients.lock().unwrap().drain(..) {
            let _ = client.send(Outbound::Hangup);
        }
    }

    fn broadcast(&self, bytes: Vec<u8>) {
        let mut clients = self.state.clients.lock().unwrap();
        clients.retain(|c| c.send(Outbound::Frame(bytes.clone())).is_ok());
    }
}

fn frame(frame_type: u32, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + data.len());
    out.extend_from_slice(&(data.len() as u32 + 4).to_be_bytes());
    out.extend_from_slice(&frame_type.to_be_bytes());
    out.extend_from_slice(data);
    out
}

async fn serve(
    conn: usize,
    socket: tokio::net::TcpStream,
    state: Arc<State>,
    tx: mpsc::UnboundedSender<Outbound>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let (read, mut write) = socket.into_split();
    tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(bytes) => {
                    if write.write_all(&bytes).await.is_err() {
                        return;
                    }
                }
                Outbound::Hangup => {
                    let _ = write.shutdown().await;
                    return;
                }
            }
        }
    });

    let mut reader = BufReader::new(read);
    let mut magic = [0u8; 4];
    if reader.read_exact(&mut magic).await.is_err() || &magic != b"  V2" {
        return;
    }

    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        line.pop();
        let line = String::from_utf8_lossy(&line).to_string();
        let verb = line.split(' ').next().unwrap_or_default().to_string();

        let body = if matches!(verb.as_str(), "IDENTIFY" | "AUTH" | "PUB" | "MPUB" | "DPUB") {
            let Ok(len) = reader.read_u32().await else { return };
            let mut body = vec![0u8; len as usize];
            if reader.read_exact(&mut body).await.is_err() {
                return;
            }
            body
        } else {
            Vec::new()
        };

        state.commands.lock().unwrap().push(Recorded {
            conn,
            line,
            body,
        });

        let reply: Option<&[u8]> = match verb.as_str() {
            "IDENTIFY" => Some(IDENTIFY_RESPONSE),
            "SUB" | "PUB" | "MPUB" | "DPUB" => Some(&b"OK"[..]),
            "CLS" => Some(&b"CLOSE_WAIT"[..]),
            _ => None,
        };
        if let Some(reply) = reply {
            if tx.send(Outbound::Frame(frame(FRAME_RESPONSE, reply))).is_err() {
                return;
            }
        }
    }
}

/// HTTP stand-in for nsqlookupd. The listed producers can be changed, and
/// the server can be switched to answer with an error.
pub struct MockLookupd {
    pub addr: String,
    producers: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
}

impl MockLookupd {
    pub async fn start(nsqd_addrs: &[&str]) -> Self {
        let producers = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(AtomicBool::new(false));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let (serve_producers, serve_failing) = (Arc::clone(&producers), Arc::clone(&failing));
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let (status, body) = if serve_failing.load(Ordering::SeqCst) {
                    ("500 Internal Server Error", String::from("{}"))
                } else {
                    let listed = serve_producers.lock().unwrap().join(",");
                    ("200 OK", format!(r#"{{"channels":[],"producers":[{}]}}"#, listed))
                };
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    if socket.read(&mut buf).await.unwrap_or(0) == 0 {
                        return;
                    }
                    let resp = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                });
            }
        });

        let lookupd = Self {
            addr,
            producers,
            failing,
        };
        lookupd.set_producers(nsqd_addrs);
        lookupd
    }

    /// Replace the nsqd addresses listed for every topic.
    pub fn set_producers(&self, nsqd_addrs: &[&str]) {
        let listed: Vec<String> = nsqd_addrs
            .iter()
            .map(|addr| {
                let (host, port) = addr.rsplit_once(':').unwrap();
                format!(
                    r#"{{"broadcast_address":"{}","hostname":"mock","tcp_port":{},"http_port":0}}"#,
                    host, port
                )
            })
            .collect();
        *self.producers.lock().unwrap() = listed;
    }

    /// Answer every following request with HTTP 500.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}
