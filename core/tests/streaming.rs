/*
 * streaming.rs
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

//! End-to-end streaming against the in-process server: block fetching, keep-alive,
//! seeking, pool reuse and eviction, failures.

mod common;

use std::time::{Duration, Instant};

use rstest::rstest;
use ruscello_core::{ConnState, StreamConfig, StreamError};

use common::{read_to_end, test_config, test_pool, Mode, TestServer};

const LEN: usize = 100_000;
const BIG: usize = 200_000;

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[rstest]
#[case(Mode::Range)]
#[case(Mode::ChunkedRange)]
#[case(Mode::Whole)]
#[case(Mode::WholeChunked)]
#[case(Mode::CloseEachResponse)]
#[timeout(Duration::from_secs(30))]
fn streams_resource_in_order(#[case] mode: Mode) {
    let server = TestServer::start(mode, LEN);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/audio/track.mp3")).unwrap();

    let got = read_to_end(&conn);
    assert_eq!(got.len(), LEN);
    assert!(got == server.data(), "stream content differs");
    assert!(conn.is_end_of_stream());
    assert_eq!(conn.total_length(), Some(LEN as u64));
    assert_eq!(conn.content_type().as_deref(), Some("audio/mpeg"));
    assert!(conn.last_error().is_none());
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn keep_alive_fetches_every_block_on_one_socket() {
    let server = TestServer::start(Mode::Range, LEN);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    read_to_end(&conn);

    let block = test_config().block_size;
    let requests = server.requests();
    assert_eq!(requests.len(), (LEN + block - 1) / block);
    assert_eq!(server.connections(), 1);
    for (i, req) in requests.iter().enumerate() {
        let start = i * block;
        let end = (start + block - 1).min(LEN - 1);
        assert_eq!(req.range.as_deref(), Some(format!("bytes={}-{}", start, end).as_str()));
        assert_eq!(req.path, "/track.mp3");
    }
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn reconnect_each_block_opens_a_socket_per_request() {
    let server = TestServer::start(Mode::Range, LEN);
    let config = StreamConfig {
        reconnect_each_block: true,
        ..test_config()
    };
    let pool = test_pool(config);
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    assert!(read_to_end(&conn) == server.data());
    assert_eq!(server.connections(), server.requests().len());
    assert!(!conn.is_reusable());
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn server_closing_each_response_is_followed() {
    let server = TestServer::start(Mode::CloseEachResponse, LEN);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    read_to_end(&conn);
    assert_eq!(server.connections(), server.requests().len());
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn prefetch_then_seek_inside_buffer() {
    let server = TestServer::start(Mode::Range, BIG);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();

    let buffered = conn.wait_for_prefetch(Some(Duration::from_secs(10))).unwrap();
    assert!(buffered >= test_config().prefetch_threshold);
    assert!(conn.seek(1000));
    assert_eq!(conn.position(), 1000);
    let got = read_to_end(&conn);
    assert!(got == server.data()[1000..]);
}

#[rstest]
#[case(Mode::Range)]
#[case(Mode::ChunkedRange)]
#[case(Mode::Whole)]
#[timeout(Duration::from_secs(30))]
fn seek_outside_buffer_restarts_at_offset(#[case] mode: Mode) {
    let server = TestServer::start(mode, BIG);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    conn.wait_until_buffered(16 * 1024, Some(Duration::from_secs(10)))
        .unwrap();

    assert!(!conn.seek(150_000));
    assert_eq!(conn.position(), 150_000);
    let got = read_to_end(&conn);
    assert!(got == server.data()[150_000..], "data after seek differs");
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn seek_fraction_uses_total_length() {
    let server = TestServer::start(Mode::Range, BIG);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    conn.wait_until_buffered(16 * 1024, Some(Duration::from_secs(10)))
        .unwrap();
    assert_eq!(conn.total_length(), Some(BIG as u64));

    assert!(!conn.seek_fraction(0.5));
    let got = read_to_end(&conn);
    assert!(got == server.data()[BIG / 2..]);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn seek_past_end_ends_stream() {
    let server = TestServer::start(Mode::Range, LEN);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    assert!(!conn.seek(LEN as u64 + 10));
    assert!(read_to_end(&conn).is_empty());
    assert!(conn.is_end_of_stream());
    assert!(conn.last_error().is_none());
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn released_connection_is_reused_for_same_host() {
    let server = TestServer::start(Mode::Range, LEN);
    let pool = test_pool(test_config());

    let first = pool.acquire(&server.url("/one.mp3")).unwrap();
    read_to_end(&first);
    let id = first.id();
    pool.release(first.clone());
    assert_eq!(pool.idle_count(), 1);
    assert_eq!(pool.active_count(), 0);

    let second = pool.acquire(&server.url("/two.mp3")).unwrap();
    assert!(second.ptr_eq(&first));
    assert_eq!(second.id(), id);
    assert_eq!(second.position(), 0);
    assert!(read_to_end(&second) == server.data());
    assert_eq!(server.connections(), 1);
    assert_eq!(server.requests().last().map(|r| r.path.as_str()), Some("/two.mp3"));
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn concurrent_connections_stream_independently() {
    let server = TestServer::start(Mode::Range, LEN);
    let pool = test_pool(test_config());
    let a = pool.acquire(&server.url("/a.mp3")).unwrap();
    let b = pool.acquire(&server.url("/b.mp3")).unwrap();
    assert!(!a.ptr_eq(&b));

    let reader = {
        let b = b.clone();
        std::thread::spawn(move || read_to_end(&b))
    };
    let got_a = read_to_end(&a);
    let got_b = reader.join().unwrap();
    assert!(got_a == server.data());
    assert!(got_b == server.data());
    assert_eq!(server.connections(), 2);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn sweep_evicts_idle_connection_after_ttl() {
    let server = TestServer::start(Mode::Range, LEN);
    let config = StreamConfig {
        idle_ttl: Duration::from_millis(100),
        sweep_interval: Duration::from_millis(50),
        ..test_config()
    };
    let pool = test_pool(config);
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    read_to_end(&conn);
    pool.release(conn.clone());
    assert_eq!(pool.idle_count(), 1);

    wait_until("eviction", || pool.idle_count() == 0);
    assert!(!conn.is_active());
    assert_eq!(conn.state(), ConnState::Closed);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn heartbeat_exercises_idle_socket() {
    let server = TestServer::start(Mode::Range, LEN);
    let config = StreamConfig {
        heartbeat_interval: Duration::from_millis(50),
        ..test_config()
    };
    let pool = test_pool(config);
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    read_to_end(&conn);

    wait_until("heartbeat", || {
        server
            .requests()
            .iter()
            .any(|r| r.range.as_deref() == Some("bytes=0-0"))
    });
    assert_eq!(server.connections(), 1);
    assert!(conn.is_reusable());
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn error_status_fails_the_stream() {
    let server = TestServer::start(Mode::Range, LEN);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/missing.mp3")).unwrap();
    assert!(read_to_end(&conn).is_empty());
    assert!(conn.is_end_of_stream());
    assert_eq!(conn.state(), ConnState::Failed);
    assert!(matches!(conn.last_error(), Some(StreamError::Protocol(_))));

    pool.release(conn.clone());
    assert_eq!(pool.idle_count(), 0);
    assert!(!conn.is_active());
}

#[rstest]
#[case(Mode::OversizedRange)]
#[case(Mode::OversizedChunkedBody)]
#[timeout(Duration::from_secs(30))]
fn partial_response_larger_than_requested_fails_once(#[case] mode: Mode) {
    let server = TestServer::start(mode, BIG);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    assert!(read_to_end(&conn).is_empty());
    assert!(conn.is_end_of_stream());
    assert_eq!(conn.state(), ConnState::Failed);
    assert!(matches!(conn.last_error(), Some(StreamError::Protocol(_))));
    assert_eq!(server.requests().len(), 1);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn refused_connection_is_transport_error() {
    let pool = test_pool(test_config());
    let conn = pool.acquire("http://127.0.0.1:1/track.mp3").unwrap();
    assert!(read_to_end(&conn).is_empty());
    let err = conn.last_error().expect("error recorded");
    assert!(err.is_transport() || err.is_timeout(), "unexpected {:?}", err);
}

#[rstest]
#[case("no-scheme.example/track.mp3")]
#[case("ftp://host/track.mp3")]
#[case("https:///track.mp3")]
fn malformed_url_never_starts(#[case] url: &str) {
    let pool = test_pool(test_config());
    assert!(matches!(
        pool.acquire(url),
        Err(StreamError::UrlFormat { .. })
    ));
    assert_eq!(pool.active_count(), 0);
}

#[rstest]
#[timeout(Duration::from_secs(30))]
fn pool_shutdown_wakes_blocked_reader() {
    let server = TestServer::start(Mode::Range, BIG);
    let pool = test_pool(test_config());
    let conn = pool.acquire(&server.url("/track.mp3")).unwrap();
    conn.wait_until_buffered(1, Some(Duration::from_secs(10))).unwrap();

    let reader = {
        let conn = conn.clone();
        std::thread::spawn(move || {
            let mut total = 0usize;
            let mut buf = [0u8; 1024];
            loop {
                let n = conn.read(&mut buf);
                if n == 0 {
                    return total;
                }
                total += n;
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };
    std::thread::sleep(Duration::from_millis(50));
    pool.shutdown();
    let total = reader.join().unwrap();
    assert!(total < BIG);
    assert!(!conn.is_active());
}
