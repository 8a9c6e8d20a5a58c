/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Ruscello, a seekable network audio stream engine.
 *
 * Ruscello is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Ruscello is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Ruscello.  If not, see <http://www.gnu.org/licenses/>.
 */

//! In-process plain-HTTP server for the integration tests. Runs on its own thread and
//! runtime so tests can block on reads without starving it.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use ruscello_core::{ConnectionPool, StreamConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

/// How the server answers a range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// 206 with Content-Range and Content-Length, keep-alive.
    Range,
    /// 206 with Content-Range, body chunked.
    ChunkedRange,
    /// 200 with the whole resource and Content-Length; Range ignored.
    Whole,
    /// 200 with the whole resource, chunked; Range ignored.
    WholeChunked,
    /// Like Range, but every response carries Connection: close.
    CloseEachResponse,
    /// 206 claiming and sending 70000 bytes from the requested start, whatever was asked.
    OversizedRange,
    /// 206 with the requested Content-Range but a chunked body 70000 bytes long.
    OversizedChunkedBody,
}

const OVERSIZE: u64 = 70_000;

/// Deterministic resource content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

#[derive(Debug, Clone)]
pub struct Request {
    pub path: String,
    pub range: Option<String>,
}

struct ServerState {
    mode: Mode,
    data: Vec<u8>,
    connections: AtomicUsize,
    requests: Mutex<Vec<Request>>,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    stop: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start(mode: Mode, len: usize) -> Self {
        let state = Arc::new(ServerState {
            mode,
            data: pattern(len),
            connections: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        });
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel();
        let server_state = state.clone();
        let thread = std::thread::spawn(move || {
            runtime.block_on(async move {
                tokio::select! {
                    _ = serve(listener, server_state) => {}
                    _ = stop_rx => {}
                }
            });
        });
        Self {
            addr,
            state,
            stop: Some(stop_tx),
            thread: Some(thread),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn data(&self) -> &[u8] {
        &self.state.data
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn serve(listener: TcpListener, state: Arc<ServerState>) {
    loop {
        let (socket, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => break,
        };
        state.connections.fetch_add(1, Ordering::SeqCst);
        let state = state.clone();
        tokio::spawn(async move {
            let _ = handle(socket, state).await;
        });
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_request(head: &str) -> Request {
    let mut lines = head.split("\r\n");
    let path = lines
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .unwrap_or("/")
        .to_string();
    let range = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("range"))
        .map(|(_, value)| value.trim().to_string());
    Request { path, range }
}

/// `bytes=s-e` to (s, e).
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.parse().ok()?, end.parse().ok()?))
}

async fn handle(mut socket: TcpStream, state: Arc<ServerState>) -> io::Result<()> {
    let mut buf = Vec::new();
    loop {
        let head_end = loop {
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos;
            }
            let mut tmp = [0u8; 4096];
            let n = socket.read(&mut tmp).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&tmp[..n]);
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
        buf.drain(..head_end + 4);
        let request = parse_request(&head);
        state.requests.lock().unwrap().push(request.clone());
        if !respond(&mut socket, &state, &request).await? {
            let _ = socket.shutdown().await;
            return Ok(());
        }
    }
}

/// Write one response. Returns false when the connection should close.
async fn respond(socket: &mut TcpStream, state: &ServerState, request: &Request) -> io::Result<bool> {
    if request.path.starts_with("/missing") {
        socket
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .await?;
        return Ok(true);
    }
    let len = state.data.len() as u64;
    match state.mode {
        Mode::Whole => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: audio/mpeg\r\nContent-Length: {}\r\n\r\n",
                len
            );
            socket.write_all(head.as_bytes()).await?;
            socket.write_all(&state.data).await?;
            Ok(true)
        }
        Mode::WholeChunked => {
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: audio/mpeg\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await?;
            write_chunked(socket, &state.data).await?;
            Ok(true)
        }
        Mode::Range | Mode::ChunkedRange | Mode::CloseEachResponse => {
            let (start, end) = match request.range.as_deref().and_then(parse_range) {
                Some(range) => range,
                None => (0, len.saturating_sub(1)),
            };
            if start >= len {
                let head = format!(
                    "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\n\r\n",
                    len
                );
                socket.write_all(head.as_bytes()).await?;
                return Ok(true);
            }
            let end = end.min(len - 1);
            let body = &state.data[start as usize..=end as usize];
            let close = state.mode == Mode::CloseEachResponse;
            let mut head = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Type: audio/mpeg\r\nContent-Range: bytes {}-{}/{}\r\n",
                start, end, len
            );
            if state.mode == Mode::ChunkedRange {
                head.push_str("Transfer-Encoding: chunked\r\n");
            } else {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            if close {
                head.push_str("Connection: close\r\n");
            }
            head.push_str("\r\n");
            socket.write_all(head.as_bytes()).await?;
            if state.mode == Mode::ChunkedRange {
                write_chunked(socket, body).await?;
            } else {
                socket.write_all(body).await?;
            }
            Ok(!close)
        }
        Mode::OversizedRange | Mode::OversizedChunkedBody => {
            let (start, end) = request
                .range
                .as_deref()
                .and_then(parse_range)
                .unwrap_or((0, len - 1));
            let big_end = (start + OVERSIZE - 1).min(len - 1);
            let body = &state.data[start as usize..=big_end as usize];
            if state.mode == Mode::OversizedRange {
                let head = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\n\r\n",
                    start,
                    big_end,
                    len,
                    body.len()
                );
                socket.write_all(head.as_bytes()).await?;
                socket.write_all(body).await?;
            } else {
                let head = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nTransfer-Encoding: chunked\r\n\r\n",
                    start,
                    end.min(len - 1),
                    len
                );
                socket.write_all(head.as_bytes()).await?;
                write_chunked(socket, body).await?;
            }
            Ok(true)
        }
    }
}

async fn write_chunked(socket: &mut TcpStream, data: &[u8]) -> io::Result<()> {
    for chunk in data.chunks(1000) {
        socket
            .write_all(format!("{:x}\r\n", chunk.len()).as_bytes())
            .await?;
        socket.write_all(chunk).await?;
        socket.write_all(b"\r\n").await?;
    }
    socket.write_all(b"0\r\n\r\n").await
}

/// Small ring and blocks so tests cross many block boundaries and wrap the ring.
pub fn test_config() -> StreamConfig {
    StreamConfig {
        buffer_capacity: 64 * 1024,
        block_size: 8 * 1024,
        prefetch_threshold: 16 * 1024,
        heartbeat_interval: Duration::from_secs(60),
        io_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_secs(3600),
        ..StreamConfig::default()
    }
}

pub fn test_pool(config: StreamConfig) -> ConnectionPool {
    ConnectionPool::new(config).unwrap()
}

/// Read until end of stream, failing the test if a read stalls.
pub fn read_to_end(conn: &ruscello_core::StreamConnection) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = conn
            .read_timeout(&mut buf, Duration::from_secs(10))
            .expect("read stalled");
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}
