/*
 * connection.rs
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

//! Stream connection: one socket, one ring buffer, and the range-fetch state machine.
//!
//! The consumer holds a [`StreamConnection`] handle and reads from the ring. A driver task
//! on the reactor owns the socket, the parser, and the range cursor; it resolves, connects,
//! handshakes, then requests one block at a time (`Range: bytes=start-end`), keeping the
//! socket open across blocks. Handle and driver share only the ring, a few flags, and the
//! pending-seek slot.
//!
//! Lock order: `pending_seek`, then `meta` or the ring. Writes into the ring happen under
//! the pending-seek lock so a seek or retarget can never interleave with a commit.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::{interval_at, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::StreamConfig;
use crate::error::{StreamError, StreamResult};
use crate::net::{self, with_deadline, HttpStream, TlsContext};
use crate::protocol::http::{
    H1ResponseHandler, HttpResponseState, Method, ParseState, RangeCursor, RequestBuilder,
    ResponseParser,
};
use crate::ring::RingBuffer;
use crate::stream::state::{BodyMode, ConnState};
use crate::uri::ParsedUrl;

const READ_CHUNK: usize = 16 * 1024;
const CLOSE_NOTIFY_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Meta {
    total_length: Option<u64>,
    content_type: Option<String>,
    last_error: Option<StreamError>,
}

struct Shared {
    id: u64,
    config: Arc<StreamConfig>,
    /// Scheme, host, and port this connection was opened for. Never changes.
    origin: ParsedUrl,
    /// Resource currently streamed; replaced on reuse.
    target: Mutex<ParsedUrl>,
    ring: RingBuffer,
    /// Cancelled by shutdown; every driver step races against it.
    cancel: CancellationToken,
    state: Mutex<ConnState>,
    pending_seek: Mutex<Option<u64>>,
    meta: Mutex<Meta>,
    socket_open: AtomicBool,
    checked_out: AtomicBool,
    last_used: Mutex<Instant>,
    /// Bumped on every retarget; blocks fetched for an older generation are discarded.
    generation: AtomicU64,
    /// Wakes the driver: seek, retarget, release.
    wake: Notify,
}

impl Shared {
    fn superseded(&self, slot: &Option<u64>, generation: u64) -> bool {
        slot.is_some() || self.generation.load(Ordering::Acquire) != generation
    }

    /// Append `data` to the ring unless a seek or retarget happened since the driver
    /// started the request. Returns false when the data was discarded.
    fn commit(&self, generation: u64, data: &[u8]) -> StreamResult<bool> {
        let slot = self.pending_seek.lock();
        if self.superseded(&slot, generation) {
            return Ok(false);
        }
        let available = self.ring.free_space();
        if data.len() > available {
            return Err(StreamError::Capacity {
                needed: data.len(),
                available,
            });
        }
        self.ring.write(data)?;
        Ok(true)
    }

    /// Close the ring (end of stream) unless superseded.
    fn end_stream(&self, generation: u64) -> bool {
        let slot = self.pending_seek.lock();
        if self.superseded(&slot, generation) {
            return false;
        }
        self.ring.close();
        true
    }

    fn publish_meta(&self, generation: u64, total: Option<u64>, content_type: Option<&str>) {
        let _slot = self.pending_seek.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let mut meta = self.meta.lock();
        if total.is_some() {
            meta.total_length = total;
        }
        if let Some(ct) = content_type {
            meta.content_type = Some(ct.to_string());
        }
    }
}

/// Handle to a pooled stream connection. Cloning shares the same connection.
#[derive(Clone)]
pub struct StreamConnection {
    shared: Arc<Shared>,
}

impl StreamConnection {
    /// Create the connection and spawn its driver on the reactor. The driver starts
    /// resolving immediately.
    pub(crate) fn open(
        id: u64,
        url: ParsedUrl,
        config: Arc<StreamConfig>,
        tls: TlsContext,
        reactor: &Handle,
    ) -> Self {
        let conn = Self::new(id, url, config);
        debug!(conn = id, host = %conn.shared.origin.host, "opening stream connection");
        let task_shared = conn.shared.clone();
        reactor.spawn(async move {
            Driver::new(task_shared, tls).run().await;
        });
        conn
    }

    fn new(id: u64, url: ParsedUrl, config: Arc<StreamConfig>) -> Self {
        let capacity = config.buffer_capacity;
        let shared = Arc::new(Shared {
            id,
            config,
            origin: url.clone(),
            target: Mutex::new(url),
            ring: RingBuffer::new(capacity),
            cancel: CancellationToken::new(),
            state: Mutex::new(ConnState::Resolving),
            pending_seek: Mutex::new(None),
            meta: Mutex::new(Meta::default()),
            socket_open: AtomicBool::new(false),
            checked_out: AtomicBool::new(true),
            last_used: Mutex::new(Instant::now()),
            generation: AtomicU64::new(0),
            wake: Notify::new(),
        });
        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn host(&self) -> &str {
        &self.shared.origin.host
    }

    pub fn origin(&self) -> &ParsedUrl {
        &self.shared.origin
    }

    /// URL currently being streamed.
    pub fn url(&self) -> ParsedUrl {
        self.shared.target.lock().clone()
    }

    /// Block until at least one byte is available, then copy up to `dest.len()` bytes.
    /// Returns 0 at end of stream, after a failure, or after shutdown.
    pub fn read(&self, dest: &mut [u8]) -> usize {
        self.shared.ring.read(dest)
    }

    pub fn read_timeout(&self, dest: &mut [u8], timeout: Duration) -> StreamResult<usize> {
        self.shared.ring.read_timeout(dest, timeout)
    }

    /// Copy whatever is buffered without blocking.
    pub fn try_read(&self, dest: &mut [u8]) -> usize {
        self.shared.ring.try_read(dest)
    }

    /// Block until `n` bytes are buffered or the stream ends. `n` is capped at the level
    /// flow control guarantees to reach (capacity minus one block).
    pub fn wait_until_buffered(&self, n: usize, timeout: Option<Duration>) -> StreamResult<usize> {
        let config = &self.shared.config;
        let reachable = config.buffer_capacity.saturating_sub(config.block_size);
        self.shared.ring.wait_for(n.min(reachable), timeout)
    }

    /// Wait for the configured prefetch threshold before starting to decode.
    pub fn wait_for_prefetch(&self, timeout: Option<Duration>) -> StreamResult<usize> {
        self.wait_until_buffered(self.shared.config.prefetch_threshold, timeout)
    }

    /// Seek to byte offset `pos`. Returns true when `pos` was already buffered and the read
    /// cursor simply moved. Otherwise the buffer is emptied, the seek is recorded, and the
    /// next range request starts at `pos`; returns false.
    pub fn seek(&self, pos: u64) -> bool {
        // no driver left to serve a deferred seek
        if !self.is_active() || self.state() == ConnState::Failed {
            return false;
        }
        let mut slot = self.shared.pending_seek.lock();
        if self.shared.ring.skip_to(pos) {
            *slot = None;
            trace!(conn = self.shared.id, pos, "seek within buffer");
            return true;
        }
        *slot = Some(pos);
        self.shared.ring.reset_to(pos);
        drop(slot);
        debug!(conn = self.shared.id, pos, "seek deferred to next request");
        self.shared.wake.notify_one();
        false
    }

    /// Seek to `fraction` (0.0 to 1.0) of the total length. False when the total is unknown
    /// or the seek was deferred.
    pub fn seek_fraction(&self, fraction: f64) -> bool {
        let total = match self.total_length() {
            Some(total) => total,
            None => return false,
        };
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        let pos = ((total as f64) * fraction) as u64;
        self.seek(pos.min(total))
    }

    /// No more bytes will arrive and the buffer is drained.
    pub fn is_end_of_stream(&self) -> bool {
        self.shared.ring.is_finished()
    }

    /// Resource size, once the server has told us.
    pub fn total_length(&self) -> Option<u64> {
        self.shared.meta.lock().total_length
    }

    pub fn content_type(&self) -> Option<String> {
        self.shared.meta.lock().content_type.clone()
    }

    /// Stream offset of the next byte `read` returns.
    pub fn position(&self) -> u64 {
        self.shared.ring.start_offset()
    }

    pub fn buffered(&self) -> usize {
        self.shared.ring.len()
    }

    pub fn state(&self) -> ConnState {
        *self.shared.state.lock()
    }

    /// Error that stopped the driver, if any.
    pub fn last_error(&self) -> Option<StreamError> {
        self.shared.meta.lock().last_error.clone()
    }

    /// Socket still open and connection not shut down.
    pub fn is_reusable(&self) -> bool {
        self.shared.socket_open.load(Ordering::Acquire) && !self.shared.cancel.is_cancelled()
    }

    /// False once shut down.
    pub fn is_active(&self) -> bool {
        !self.shared.cancel.is_cancelled()
    }

    /// Checked out of the pool by a caller.
    pub fn is_checked_out(&self) -> bool {
        self.shared.checked_out.load(Ordering::Acquire)
    }

    pub fn last_used(&self) -> Instant {
        *self.shared.last_used.lock()
    }

    /// True when both handles refer to the same connection.
    pub fn ptr_eq(&self, other: &StreamConnection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Stop the driver, close the socket, and wake blocked readers. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        self.shared.cancel.cancel();
        self.shared.socket_open.store(false, Ordering::Release);
        self.shared.checked_out.store(false, Ordering::Release);
        self.shared.ring.close();
        *self.shared.state.lock() = ConnState::Closed;
        info!(conn = self.shared.id, host = %self.shared.origin.host, "connection shut down");
    }

    /// Point an idle connection at a new resource on the same origin and check it out.
    pub(crate) fn retarget(&self, url: ParsedUrl) {
        {
            let mut slot = self.shared.pending_seek.lock();
            *slot = None;
            debug!(conn = self.shared.id, path = %url.path, "retarget");
            *self.shared.target.lock() = url;
            self.shared.generation.fetch_add(1, Ordering::AcqRel);
            *self.shared.meta.lock() = Meta::default();
            self.shared.ring.reset_to(0);
        }
        self.shared.checked_out.store(true, Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub(crate) fn mark_released(&self) {
        self.shared.checked_out.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }

    pub(crate) fn touch(&self) {
        self.touch_at(Instant::now());
    }

    pub(crate) fn touch_at(&self, when: Instant) {
        *self.shared.last_used.lock() = when;
    }
}

impl std::fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnection")
            .field("id", &self.shared.id)
            .field("host", &self.shared.origin.host)
            .field("state", &self.state())
            .field("ring", &self.shared.ring)
            .finish()
    }
}

/// Collects status and headers, then body bytes, from the H1 parser.
#[derive(Default)]
struct Exchange {
    status: Option<(u16, Option<String>)>,
    headers: Vec<(String, String)>,
    body: BytesMut,
    complete: bool,
}

impl H1ResponseHandler for Exchange {
    fn status(&mut self, code: u16, reason: Option<&str>) {
        self.status = Some((code, reason.map(|s| s.to_string())));
    }

    fn header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn body_chunk(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    fn complete(&mut self) {
        self.complete = true;
    }
}

/// A 206 must answer the requested window: same start, no byte past `end`, and a framed
/// length that fits.
fn check_partial(response: &HttpResponseState, start: u64, end: u64) -> StreamResult<()> {
    let range = response
        .content_range
        .ok_or_else(|| StreamError::protocol("partial response without Content-Range"))?;
    if range.start != start || range.end > end {
        return Err(StreamError::protocol(format!(
            "requested bytes {}-{} but server sent {}-{}",
            start, end, range.start, range.end
        )));
    }
    if let Some(len) = response.framed_length() {
        if len > range.len() {
            return Err(StreamError::protocol(format!(
                "Content-Length {} does not match Content-Range {}-{}",
                len, range.start, range.end
            )));
        }
    }
    Ok(())
}

fn peer_closed() -> StreamError {
    let e = io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed by peer");
    StreamError::transport("read", &e)
}

/// A kept-alive socket the server has since dropped.
fn is_stale_socket(e: &StreamError) -> bool {
    match e {
        StreamError::Transport { kind, .. } => matches!(
            kind,
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}

/// Driver task state. Lives on the reactor; owns everything the handle does not share.
struct Driver {
    shared: Arc<Shared>,
    tls: TlsContext,
    stream: Option<HttpStream>,
    read_buf: BytesMut,
    parser: ResponseParser,
    response: HttpResponseState,
    cursor: RangeCursor,
    target: ParsedUrl,
    generation: u64,
    /// The current socket has completed at least one response.
    reused: bool,
    /// A status line arrived for the request in flight.
    response_seen: bool,
    /// Everything up to the end of the resource has been delivered.
    finished: bool,
    heartbeat: Interval,
}

impl Driver {
    fn new(shared: Arc<Shared>, tls: TlsContext) -> Self {
        let period = shared.config.heartbeat_interval;
        let mut heartbeat = interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let target = shared.target.lock().clone();
        let generation = shared.generation.load(Ordering::Acquire);
        let cursor = RangeCursor::new(shared.config.block_size as u64);
        Self {
            shared,
            tls,
            stream: None,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            parser: ResponseParser::new(),
            response: HttpResponseState::default(),
            cursor,
            target,
            generation,
            reused: false,
            response_seen: false,
            finished: false,
            heartbeat,
        }
    }

    async fn run(mut self) {
        let cancel = self.shared.cancel.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = self.drive() => result,
        };
        if let Err(e) = outcome {
            self.fail(e);
        }
        self.close_socket().await;
        if cancel.is_cancelled() {
            *self.shared.state.lock() = ConnState::Closed;
        }
        trace!(conn = self.shared.id, "driver stopped");
    }

    async fn drive(&mut self) -> StreamResult<()> {
        loop {
            self.sync_target();
            let seek_pending = self.shared.pending_seek.lock().is_some();
            let parked = !self.shared.checked_out.load(Ordering::Acquire);
            if parked || (self.finished && !seek_pending) {
                self.idle().await;
                continue;
            }
            if !seek_pending && !self.wait_for_space().await {
                continue;
            }
            self.fetch_block().await?;
        }
    }

    fn set_state(&self, next: ConnState) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        let mut state = self.shared.state.lock();
        let from = *state;
        if from != next {
            trace!(conn = self.shared.id, from = %from, to = %next, "state");
            *state = next;
        }
    }

    /// Pick up a retarget done by the pool.
    fn sync_target(&mut self) {
        let generation = self.shared.generation.load(Ordering::Acquire);
        if generation == self.generation {
            return;
        }
        self.generation = generation;
        self.target = self.shared.target.lock().clone();
        self.cursor.reset();
        self.response.reset();
        self.finished = false;
        debug!(conn = self.shared.id, path = %self.target.path, "now streaming");
    }

    /// Nothing to fetch: wait for a seek, retarget, or release, and keep the socket warm.
    async fn idle(&mut self) {
        self.set_state(ConnState::Idle);
        let shared = self.shared.clone();
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = self.heartbeat.tick() => self.send_heartbeat().await,
        }
    }

    fn block_len(&self) -> usize {
        let (start, end) = self.cursor.window();
        (end.saturating_sub(start) + 1) as usize
    }

    /// Flow control: true once the ring can take the whole next block.
    async fn wait_for_space(&mut self) -> bool {
        let needed = self.block_len();
        if self.shared.ring.free_space() >= needed {
            return true;
        }
        self.set_state(ConnState::Idle);
        trace!(conn = self.shared.id, needed, "waiting for buffer space");
        let shared = self.shared.clone();
        tokio::select! {
            _ = shared.ring.wait_for_space(needed) => true,
            _ = shared.wake.notified() => false,
            _ = self.heartbeat.tick() => {
                self.send_heartbeat().await;
                false
            }
        }
    }

    async fn ensure_connected(&mut self) -> StreamResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let limit = self.shared.config.io_timeout;
        let host = self.target.host.clone();
        let port = self.target.port;

        self.set_state(ConnState::Resolving);
        let addrs = net::resolve(&host, port, limit).await?;
        self.set_state(ConnState::Connecting);
        let tcp = net::connect(&addrs, limit).await?;
        let stream = if self.target.scheme.is_secure() {
            self.set_state(ConnState::Handshaking);
            net::handshake(&self.tls, &host, tcp, limit).await?
        } else {
            HttpStream::Plain(tcp)
        };
        info!(conn = self.shared.id, host = %host, port, tls = stream.is_tls(), "connected");
        self.stream = Some(stream);
        self.read_buf.clear();
        self.parser.reset();
        self.reused = false;
        self.shared.socket_open.store(true, Ordering::Release);
        self.heartbeat.reset();
        Ok(())
    }

    /// Fetch the next block, reconnecting once when a kept-alive socket turns out to have
    /// been closed by the server before it answered.
    async fn fetch_block(&mut self) -> StreamResult<()> {
        let mut retried = false;
        loop {
            self.ensure_connected().await?;
            let (start, end) = match self.begin_range_request() {
                Some(window) => window,
                None => return Ok(()),
            };
            let reused = self.reused;
            match self.fetch_range(start, end).await {
                Ok(()) => break,
                Err(e) if !retried && reused && !self.response_seen && is_stale_socket(&e) => {
                    info!(conn = self.shared.id, host = %self.target.host, "keep-alive socket closed by server, reconnecting");
                    retried = true;
                    self.drop_socket();
                    self.set_state(ConnState::Reconnecting);
                    self.cursor.seek(start);
                }
                Err(e) => return Err(e),
            }
        }
        if self.cursor.is_complete() {
            self.finish();
        }
        Ok(())
    }

    /// Apply a pending seek, then take the next window and advance the cursor past it.
    /// None when the resource is exhausted.
    fn begin_range_request(&mut self) -> Option<(u64, u64)> {
        {
            let mut slot = self.shared.pending_seek.lock();
            if let Some(pos) = slot.take() {
                debug!(conn = self.shared.id, pos, "applying seek");
                self.shared.ring.reset_to(pos);
                self.cursor.seek(pos);
                self.finished = false;
            }
        }
        if self.cursor.is_complete() {
            self.finish();
            return None;
        }
        let window = self.cursor.window();
        self.cursor.move_to_next_block();
        Some(window)
    }

    async fn fetch_range(&mut self, start: u64, end: u64) -> StreamResult<()> {
        self.response_seen = false;
        let req = RequestBuilder::range(&self.target, start, end, &self.shared.config.user_agent);
        debug!(conn = self.shared.id, host = %self.target.host, start, end, "range request");
        self.set_state(ConnState::RequestSent);
        self.send(&req).await?;

        self.set_state(ConnState::HeaderParsing);
        let mut ex = Exchange::default();
        self.read_head(&mut ex, req.method).await?;
        self.response_seen = true;

        let status = self.response.status_code;
        if status == 416 {
            info!(conn = self.shared.id, start, "range not satisfiable, ending stream");
            while !self.fill(&mut ex).await? {}
            self.after_response().await;
            self.finish();
            return Ok(());
        }
        if !self.response.is_success() {
            return Err(StreamError::protocol(format!(
                "unexpected status {} {}",
                status,
                self.response.reason.as_deref().unwrap_or("")
            )));
        }

        if let Some(total) = self.response.total_length() {
            self.cursor.set_total_length(total);
        }
        self.shared.publish_meta(
            self.generation,
            self.cursor.total_length,
            self.response.content_type.as_deref(),
        );

        if self.response.is_partial {
            check_partial(&self.response, start, end)?;
            self.read_range_body(start, end, &mut ex).await?;
        } else {
            self.stream_whole_body(start, &mut ex).await?;
        }
        self.after_response().await;
        Ok(())
    }

    /// 206: read the whole window, then commit it to the ring in one piece. The head has
    /// already been checked against the window; a chunked body is bounded as it arrives.
    async fn read_range_body(&mut self, start: u64, end: u64, ex: &mut Exchange) -> StreamResult<()> {
        let window = end - start + 1;
        let mode = if self.response.is_chunked {
            BodyMode::Chunked
        } else {
            BodyMode::Range
        };
        self.set_state(ConnState::BodyStreaming(mode));
        loop {
            let done = self.fill(ex).await?;
            if ex.body.len() as u64 > window {
                return Err(StreamError::protocol(format!(
                    "range body exceeds requested {} bytes",
                    window
                )));
            }
            if done {
                break;
            }
        }

        let received = ex.body.len() as u64;
        if received == 0 {
            return Err(StreamError::protocol("empty range body"));
        }
        match self.shared.commit(self.generation, &ex.body) {
            Ok(true) => {
                trace!(conn = self.shared.id, start, len = received, "block committed");
                self.cursor.content_length = received;
                let next = start + received;
                if next != self.cursor.range_start {
                    // short block: continue where the server stopped
                    self.cursor.seek(next);
                }
            }
            Ok(false) => {
                debug!(conn = self.shared.id, start, "block superseded by seek, discarded");
            }
            Err(e) => return Err(e),
        }
        ex.body.clear();
        Ok(())
    }

    /// 200: the server ignored Range and sends the whole resource. Skip up to `start`,
    /// then hand bytes to the ring as space frees up.
    async fn stream_whole_body(&mut self, start: u64, ex: &mut Exchange) -> StreamResult<()> {
        let mode = if self.response.is_chunked {
            BodyMode::Chunked
        } else {
            BodyMode::Identity
        };
        self.set_state(ConnState::BodyStreaming(mode));
        if start > 0 {
            debug!(conn = self.shared.id, start, "server ignored Range, skipping to offset");
        }
        let mut skip = start;
        let mut delivered = 0u64;
        loop {
            let done = self.fill(ex).await?;
            while !ex.body.is_empty() {
                if skip > 0 {
                    let n = skip.min(ex.body.len() as u64) as usize;
                    ex.body.advance(n);
                    skip -= n as u64;
                    continue;
                }
                let free = self.shared.ring.free_space();
                if free == 0 {
                    let shared = self.shared.clone();
                    tokio::select! {
                        _ = shared.ring.wait_for_space(1) => {}
                        _ = shared.wake.notified() => {}
                    }
                    continue;
                }
                let n = free.min(ex.body.len());
                if !self.shared.commit(self.generation, &ex.body[..n])? {
                    debug!(conn = self.shared.id, "whole-body response superseded, dropping socket");
                    self.drop_socket();
                    return Ok(());
                }
                ex.body.advance(n);
                delivered += n as u64;
            }
            if done {
                break;
            }
        }
        let total = start - skip + delivered;
        self.cursor.set_total_length(total);
        self.cursor.seek(total);
        self.shared
            .publish_meta(self.generation, Some(total), self.response.content_type.as_deref());
        Ok(())
    }

    /// Keep or drop the socket once a response has been fully read.
    async fn after_response(&mut self) {
        if self.stream.is_none() {
            return;
        }
        self.reused = true;
        if self.response.connection_close || self.shared.config.reconnect_each_block {
            trace!(conn = self.shared.id, "closing socket after response");
            self.close_socket().await;
            self.set_state(ConnState::Reconnecting);
        }
    }

    async fn send(&mut self, req: &RequestBuilder) -> StreamResult<()> {
        let limit = self.shared.config.io_timeout;
        let bytes = req.to_bytes();
        let stream = self.stream.as_mut().ok_or(StreamError::Closed)?;
        with_deadline("write", limit, async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        })
        .await?;
        self.heartbeat.reset();
        Ok(())
    }

    async fn read_more(&mut self) -> StreamResult<usize> {
        let limit = self.shared.config.io_timeout;
        let stream = self.stream.as_mut().ok_or(StreamError::Closed)?;
        self.read_buf.reserve(READ_CHUNK);
        let n = with_deadline("read", limit, stream.read_buf(&mut self.read_buf)).await?;
        Ok(n)
    }

    /// Read up to the blank line and load status and headers into `self.response`.
    async fn read_head(&mut self, ex: &mut Exchange, method: Method) -> StreamResult<()> {
        self.parser.reset();
        self.response.reset();
        loop {
            self.parser.receive(&mut self.read_buf, ex)?;
            if self.parser.state() == ParseState::HeadersComplete {
                break;
            }
            if self.read_more().await? == 0 {
                let nothing_received = ex.status.is_none() && self.read_buf.is_empty();
                self.drop_socket();
                return Err(if nothing_received {
                    peer_closed()
                } else {
                    StreamError::protocol("connection closed in response headers")
                });
            }
        }
        let (code, reason) = ex.status.take().unwrap_or((0, None));
        self.response.record_status(code, reason.as_deref());
        for (name, value) in ex.headers.drain(..) {
            self.response.record_header(&name, &value)?;
        }
        if method == Method::Head || code == 204 || code == 304 {
            self.parser.set_no_body();
        } else {
            self.parser
                .set_body_mode(self.response.framed_length(), self.response.is_chunked);
        }
        if self.parser.state() == ParseState::Idle {
            ex.complete = true;
        }
        trace!(conn = self.shared.id, status = code, "headers parsed");
        Ok(())
    }

    /// Parse buffered body bytes into `ex`, reading once more from the socket when the
    /// response is still incomplete. Returns true when the body is done.
    async fn fill(&mut self, ex: &mut Exchange) -> StreamResult<bool> {
        self.parser.receive(&mut self.read_buf, ex)?;
        if ex.complete {
            return Ok(true);
        }
        if self.read_more().await? == 0 {
            let result = self.parser.finish_on_close(ex);
            self.drop_socket();
            result?;
            return Ok(true);
        }
        Ok(false)
    }

    async fn send_heartbeat(&mut self) {
        if self.stream.is_none() {
            return;
        }
        trace!(conn = self.shared.id, "heartbeat");
        if let Err(e) = self.heartbeat_exchange().await {
            warn!(conn = self.shared.id, host = %self.target.host, "heartbeat failed: {}", e);
            self.drop_socket();
        }
    }

    /// Ask for the first byte of the resource and drain the answer.
    async fn heartbeat_exchange(&mut self) -> StreamResult<()> {
        let req = RequestBuilder::heartbeat(&self.target, &self.shared.config.user_agent);
        self.send(&req).await?;
        let mut ex = Exchange::default();
        self.read_head(&mut ex, req.method).await?;
        if !self.response.is_partial && !ex.complete {
            debug!(
                conn = self.shared.id,
                status = self.response.status_code,
                "heartbeat answered with a full body, dropping socket"
            );
            self.drop_socket();
            return Ok(());
        }
        while !self.fill(&mut ex).await? {
            if ex.body.len() > 1 {
                debug!(conn = self.shared.id, "heartbeat answered with more than one byte, dropping socket");
                self.drop_socket();
                return Ok(());
            }
        }
        if self.stream.is_some() {
            self.reused = true;
        }
        if self.response.connection_close {
            self.close_socket().await;
        }
        Ok(())
    }

    /// Mark the stream complete (ring closed) unless a seek or retarget superseded it.
    fn finish(&mut self) {
        if !self.shared.end_stream(self.generation) {
            return;
        }
        if !self.finished {
            info!(conn = self.shared.id, host = %self.target.host, total = ?self.cursor.total_length, "end of stream");
        }
        self.finished = true;
    }

    fn fail(&mut self, e: StreamError) {
        error!(conn = self.shared.id, host = %self.target.host, "stream failed: {}", e);
        self.set_state(ConnState::Failed);
        self.shared.meta.lock().last_error = Some(e);
        self.shared.socket_open.store(false, Ordering::Release);
        self.shared.ring.close();
    }

    fn drop_socket(&mut self) {
        if self.stream.take().is_some() {
            trace!(conn = self.shared.id, "socket dropped");
        }
        self.read_buf.clear();
        self.parser.reset();
        self.reused = false;
        self.shared.socket_open.store(false, Ordering::Release);
    }

    /// Orderly close: TLS close_notify (best effort), then drop.
    async fn close_socket(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = tokio::time::timeout(CLOSE_NOTIFY_TIMEOUT, stream.shutdown()).await;
        }
        self.drop_socket();
    }
}
