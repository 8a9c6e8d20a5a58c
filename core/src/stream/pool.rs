/*
 * pool.rs
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

//! Connection pool: checked-out and idle stream connections, reuse by origin, TTL
//! eviction. Owns the reactor thread and the TLS context every connection shares.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::error::{StreamError, StreamResult};
use crate::net::TlsContext;
use crate::stream::connection::StreamConnection;
use crate::stream::reactor::Reactor;
use crate::uri::parse_url;

#[derive(Default)]
struct PoolState {
    /// Checked out, keyed by connection id.
    active: HashMap<u64, StreamConnection>,
    /// Available for reuse, most recently used first.
    idle: VecDeque<StreamConnection>,
    closed: bool,
}

struct PoolInner {
    config: Arc<StreamConfig>,
    tls: TlsContext,
    reactor: Reactor,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

impl PoolInner {
    fn evict_expired_at(&self, now: Instant) -> usize {
        let ttl = self.config.idle_ttl;
        let evicted: Vec<StreamConnection> = {
            let mut state = self.state.lock();
            let (keep, evict): (VecDeque<_>, VecDeque<_>) =
                state.idle.drain(..).partition(|conn| {
                    conn.is_reusable() && now.saturating_duration_since(conn.last_used()) <= ttl
                });
            state.idle = keep;
            evict.into()
        };
        for conn in &evicted {
            debug!(conn = conn.id(), host = conn.host(), "evicting idle connection");
            conn.shutdown();
        }
        evicted.len()
    }
}

/// Registry of stream connections. Construct one at startup and pass it to call sites.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Validate `config`, start the reactor thread, and schedule the eviction sweep.
    pub fn new(config: StreamConfig) -> StreamResult<Self> {
        config.validate()?;
        let sweep = config.sweep_interval;
        let inner = Arc::new(PoolInner {
            config: Arc::new(config),
            tls: TlsContext::new(),
            reactor: Reactor::start()?,
            state: Mutex::new(PoolState::default()),
            next_id: AtomicU64::new(1),
        });
        let weak = Arc::downgrade(&inner);
        inner.reactor.spawn(sweep_task(weak, sweep));
        info!("connection pool started");
        Ok(Self { inner })
    }

    pub fn with_default() -> StreamResult<Self> {
        Self::new(StreamConfig::default())
    }

    pub fn config(&self) -> &StreamConfig {
        &self.inner.config
    }

    /// Check out a connection for `url`: an idle connection to the same scheme, host, and
    /// port whose socket is still open, or a new one.
    pub fn acquire(&self, url: &str) -> StreamResult<StreamConnection> {
        let target = parse_url(url)?;
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(StreamError::Closed);
        }
        let reusable = state
            .idle
            .iter()
            .position(|conn| conn.origin().same_origin(&target) && conn.is_reusable());
        if let Some(conn) = reusable.and_then(|idx| state.idle.remove(idx)) {
            debug!(conn = conn.id(), host = %target.host, path = %target.path, "reusing idle connection");
            conn.retarget(target);
            state.active.insert(conn.id(), conn.clone());
            return Ok(conn);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(conn = id, host = %target.host, path = %target.path, "new connection");
        let conn = StreamConnection::open(
            id,
            target,
            self.inner.config.clone(),
            self.inner.tls.clone(),
            self.inner.reactor.handle(),
        );
        state.active.insert(id, conn.clone());
        Ok(conn)
    }

    /// Return a connection. Reusable connections go to the front of the idle list; the
    /// rest are shut down.
    pub fn release(&self, conn: StreamConnection) {
        let discard = {
            let mut state = self.inner.state.lock();
            if state.active.remove(&conn.id()).is_none() {
                warn!(conn = conn.id(), "release of a connection that is not checked out");
                return;
            }
            conn.mark_released();
            if conn.is_reusable() && !state.closed {
                conn.touch();
                state.idle.push_front(conn);
                None
            } else {
                Some(conn)
            }
        };
        if let Some(conn) = discard {
            debug!(conn = conn.id(), "released connection not reusable, shutting down");
            conn.shutdown();
        }
    }

    /// Shut down idle connections unused for longer than the idle TTL, and any whose socket
    /// has closed. Returns how many were evicted. Checked-out connections are never touched.
    pub fn evict_expired(&self) -> usize {
        self.evict_expired_at(Instant::now())
    }

    pub fn evict_expired_at(&self, now: Instant) -> usize {
        self.inner.evict_expired_at(now)
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Shut down every connection, then stop the reactor and join its thread. Idempotent.
    pub fn shutdown(&self) {
        let conns: Vec<StreamConnection> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let active: Vec<StreamConnection> = state.active.drain().map(|(_, c)| c).collect();
            active.into_iter().chain(state.idle.drain(..)).collect()
        };
        for conn in &conns {
            conn.shutdown();
        }
        self.inner.reactor.shutdown();
        info!(connections = conns.len(), "connection pool shut down");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("active", &state.active.len())
            .field("idle", &state.idle.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Periodic eviction on the reactor. Holds the pool weakly so it never keeps it alive.
async fn sweep_task(pool: Weak<PoolInner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let inner = match pool.upgrade() {
            Some(inner) => inner,
            None => break,
        };
        let evicted = inner.evict_expired_at(Instant::now());
        if evicted > 0 {
            debug!(evicted, "sweep evicted idle connections");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn test_config() -> StreamConfig {
        StreamConfig {
            buffer_capacity: 64 * 1024,
            block_size: 16 * 1024,
            prefetch_threshold: 32 * 1024,
            io_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(3600),
            ..StreamConfig::default()
        }
    }

    /// Listener that accepts TCP connections into its backlog but never answers, so
    /// drivers connect and then wait for a response.
    fn silent_server() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, format!("http://127.0.0.1:{}", port))
    }

    fn wait_reusable(conn: &StreamConnection) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !conn.is_reusable() {
            assert!(Instant::now() < deadline, "connection never opened its socket");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn concurrent_acquires_get_distinct_connections() {
        let (_server, base) = silent_server();
        let pool = ConnectionPool::new(test_config()).unwrap();
        let a = pool.acquire(&format!("{}/a.mp3", base)).unwrap();
        let b = pool.acquire(&format!("{}/a.mp3", base)).unwrap();
        assert!(!a.ptr_eq(&b));
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.active_count(), 2);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn release_then_acquire_same_host_reuses() {
        let (_server, base) = silent_server();
        let pool = ConnectionPool::new(test_config()).unwrap();
        let a = pool.acquire(&format!("{}/a.mp3", base)).unwrap();
        wait_reusable(&a);
        let id = a.id();
        pool.release(a.clone());
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_count(), 0);
        assert!(!a.is_checked_out());

        let b = pool.acquire(&format!("{}/b.mp3", base)).unwrap();
        assert!(b.ptr_eq(&a));
        assert_eq!(b.id(), id);
        assert_eq!(b.url().path, "/b.mp3");
        assert!(b.is_checked_out());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn different_port_is_not_reused() {
        let (_s1, base1) = silent_server();
        let (_s2, base2) = silent_server();
        let pool = ConnectionPool::new(test_config()).unwrap();
        let a = pool.acquire(&format!("{}/a.mp3", base1)).unwrap();
        wait_reusable(&a);
        pool.release(a.clone());
        let b = pool.acquire(&format!("{}/a.mp3", base2)).unwrap();
        assert!(!b.ptr_eq(&a));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn unopened_connection_is_shut_down_on_release() {
        let pool = ConnectionPool::new(test_config()).unwrap();
        // port 1 on loopback refuses; the driver never opens a socket
        let a = pool.acquire("http://127.0.0.1:1/a.mp3").unwrap();
        pool.release(a.clone());
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 0);
        assert!(!a.is_active());
    }

    #[test]
    fn double_release_is_ignored() {
        let (_server, base) = silent_server();
        let pool = ConnectionPool::new(test_config()).unwrap();
        let a = pool.acquire(&format!("{}/a.mp3", base)).unwrap();
        wait_reusable(&a);
        pool.release(a.clone());
        pool.release(a.clone());
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn idle_past_ttl_is_evicted() {
        let (_server, base) = silent_server();
        let pool = ConnectionPool::new(test_config()).unwrap();
        let a = pool.acquire(&format!("{}/a.mp3", base)).unwrap();
        wait_reusable(&a);
        pool.release(a.clone());
        let ttl = pool.config().idle_ttl;

        assert_eq!(pool.evict_expired_at(a.last_used() + ttl), 0);
        assert_eq!(pool.idle_count(), 1);

        let later = a.last_used() + ttl + Duration::from_secs(1);
        assert_eq!(pool.evict_expired_at(later), 1);
        assert_eq!(pool.idle_count(), 0);
        assert!(!a.is_active());
    }

    #[test]
    fn active_connections_are_never_evicted() {
        let (_server, base) = silent_server();
        let pool = ConnectionPool::new(test_config()).unwrap();
        let a = pool.acquire(&format!("{}/a.mp3", base)).unwrap();
        a.touch_at(Instant::now());
        let much_later = Instant::now() + Duration::from_secs(24 * 3600);
        assert_eq!(pool.evict_expired_at(much_later), 0);
        assert_eq!(pool.active_count(), 1);
        assert!(a.is_active());
    }

    #[test]
    fn bad_url_is_rejected() {
        let pool = ConnectionPool::new(test_config()).unwrap();
        assert!(matches!(
            pool.acquire("not a url"),
            Err(StreamError::UrlFormat { .. })
        ));
        assert_eq!(pool.active_count(), 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = StreamConfig {
            block_size: 1024,
            buffer_capacity: 1024,
            ..StreamConfig::default()
        };
        assert!(matches!(
            ConnectionPool::new(config),
            Err(StreamError::Config(_))
        ));
    }

    #[test]
    fn shutdown_closes_everything() {
        let (_server, base) = silent_server();
        let pool = ConnectionPool::new(test_config()).unwrap();
        let a = pool.acquire(&format!("{}/a.mp3", base)).unwrap();
        let b = pool.acquire(&format!("{}/b.mp3", base)).unwrap();
        wait_reusable(&b);
        pool.release(b.clone());
        pool.shutdown();
        assert!(pool.is_closed());
        assert!(!a.is_active());
        assert!(!b.is_active());
        assert!(a.is_end_of_stream());
        assert!(matches!(
            pool.acquire(&format!("{}/c.mp3", base)),
            Err(StreamError::Closed)
        ));
        pool.shutdown();
    }
}
