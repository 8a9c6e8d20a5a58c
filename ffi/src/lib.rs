/*
 * lib.rs
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

//! C FFI for ruscello core. A pool is created with ruscello_pool_new and freed with
//! ruscello_pool_free; streams come from ruscello_acquire and are handed back with
//! ruscello_release, which also frees the handle.
//! All string parameters are UTF-8 NUL-terminated. Functions returning a signed count
//! return -1 on failure; ruscello_last_error then describes the failure.

use libc::{c_char, c_int, size_t, ssize_t};
use std::ffi::{CStr, CString};
use std::path::PathBuf;
use std::ptr;
use std::time::Duration;

use once_cell::sync::OnceCell;
use ruscello_core::config::default_config_path;
use ruscello_core::{ConnectionPool, StreamConfig, StreamConnection, StreamError};
use tracing_subscriber::EnvFilter;

/// Opaque pool handle.
pub type RuscelloPool = ConnectionPool;
/// Opaque stream handle.
pub type RuscelloStream = StreamConnection;

thread_local! {
    static LAST_ERROR: std::cell::RefCell<Option<CString>> = const { std::cell::RefCell::new(None) };
}

fn set_last_error_message(msg: &str) {
    let msg = CString::new(msg.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

fn set_last_error(err: &StreamError) {
    set_last_error_message(&err.to_string());
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

fn ptr_to_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string()) }
}

/// Negative milliseconds mean "wait forever".
fn timeout_from_ms(ms: i64) -> Option<Duration> {
    u64::try_from(ms).ok().map(Duration::from_millis)
}

fn count_result(result: Result<usize, StreamError>) -> ssize_t {
    match result {
        Ok(n) => {
            clear_last_error();
            n as ssize_t
        }
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

fn new_pool(config: StreamConfig) -> *mut RuscelloPool {
    match ConnectionPool::new(config) {
        Ok(pool) => {
            clear_last_error();
            Box::into_raw(Box::new(pool))
        }
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Version string (static, do not free).
#[no_mangle]
pub extern "C" fn ruscello_version() -> *const c_char {
    b"0.1.0\0".as_ptr() as *const c_char
}

/// Last error message from a failed call on this thread. Valid until the next FFI call.
/// Do not free. NULL when the last call succeeded.
#[no_mangle]
pub extern "C" fn ruscello_last_error() -> *const c_char {
    LAST_ERROR.with(|e| {
        e.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(ptr::null())
    })
}

/// Install a stderr log subscriber. `level` is an EnvFilter directive such as "debug" or
/// "ruscello_core=trace" (NULL means "info"); RUST_LOG overrides it when set.
/// Only the first call installs anything. Returns 0 on success, -1 if already installed
/// or the directive is invalid.
#[no_mangle]
pub unsafe extern "C" fn ruscello_init_logging(level: *const c_char) -> c_int {
    static INSTALLED: OnceCell<()> = OnceCell::new();
    let directive = ptr_to_str(level).unwrap_or_else(|| "info".to_string());
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => match EnvFilter::try_new(&directive) {
            Ok(filter) => filter,
            Err(e) => {
                set_last_error_message(&format!("invalid log filter {:?}: {}", directive, e));
                return -1;
            }
        },
    };
    if INSTALLED.set(()).is_err() {
        set_last_error_message("logging already initialised");
        return -1;
    }
    match tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        Ok(()) => {
            clear_last_error();
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "logging initialised");
            0
        }
        Err(e) => {
            set_last_error_message(&e.to_string());
            -1
        }
    }
}

/// Create a pool with the default configuration. Returns NULL on failure.
/// Free with ruscello_pool_free.
#[no_mangle]
pub extern "C" fn ruscello_pool_new() -> *mut RuscelloPool {
    new_pool(StreamConfig::default())
}

/// Create a pool configured from an XML file. `path` NULL means ~/.ruscello/config.xml.
/// A missing file yields the defaults. Returns NULL on failure.
#[no_mangle]
pub unsafe extern "C" fn ruscello_pool_new_from_config(path: *const c_char) -> *mut RuscelloPool {
    let path = match ptr_to_str(path) {
        Some(p) => Some(PathBuf::from(p)),
        None if !path.is_null() => {
            set_last_error_message("config path is not valid UTF-8");
            return ptr::null_mut();
        }
        None => default_config_path(),
    };
    let config = match path {
        Some(p) => match StreamConfig::load(&p) {
            Ok(c) => c,
            Err(e) => {
                set_last_error(&e);
                return ptr::null_mut();
            }
        },
        None => StreamConfig::default(),
    };
    new_pool(config)
}

/// Shut down every connection, stop the I/O thread and free the pool.
/// Stream handles still held by the caller read as ended streams; free them with
/// ruscello_release(NULL, stream). No-op if pool is NULL.
#[no_mangle]
pub unsafe extern "C" fn ruscello_pool_free(pool: *mut RuscelloPool) {
    if !pool.is_null() {
        let pool = Box::from_raw(pool);
        pool.shutdown();
    }
}

/// Check out a connection streaming `url` (http:// or https://). Returns NULL on failure.
/// Hand the stream back with ruscello_release.
#[no_mangle]
pub unsafe extern "C" fn ruscello_acquire(
    pool: *const RuscelloPool,
    url: *const c_char,
) -> *mut RuscelloStream {
    let pool = match pool.as_ref() {
        Some(p) => p,
        None => {
            set_last_error_message("pool is NULL");
            return ptr::null_mut();
        }
    };
    let url = match ptr_to_str(url) {
        Some(u) => u,
        None => {
            set_last_error_message("url is NULL or not valid UTF-8");
            return ptr::null_mut();
        }
    };
    match pool.acquire(&url) {
        Ok(conn) => {
            clear_last_error();
            Box::into_raw(Box::new(conn))
        }
        Err(e) => {
            set_last_error(&e);
            ptr::null_mut()
        }
    }
}

/// Return a stream to its pool and free the handle. With a NULL pool the connection is
/// shut down instead. No-op if stream is NULL.
#[no_mangle]
pub unsafe extern "C" fn ruscello_release(pool: *const RuscelloPool, stream: *mut RuscelloStream) {
    if stream.is_null() {
        return;
    }
    let conn = *Box::from_raw(stream);
    match pool.as_ref() {
        Some(pool) => pool.release(conn),
        None => conn.shutdown(),
    }
}

/// Blocking read of up to `len` bytes into `buf`. Returns the number of bytes copied,
/// 0 at end of stream, -1 on bad arguments.
#[no_mangle]
pub unsafe extern "C" fn ruscello_read(
    stream: *const RuscelloStream,
    buf: *mut u8,
    len: size_t,
) -> ssize_t {
    let conn = match stream.as_ref() {
        Some(c) => c,
        None => {
            set_last_error_message("stream is NULL");
            return -1;
        }
    };
    if buf.is_null() {
        set_last_error_message("buffer is NULL");
        return -1;
    }
    let dest = std::slice::from_raw_parts_mut(buf, len);
    clear_last_error();
    conn.read(dest) as ssize_t
}

/// Like ruscello_read but gives up after `timeout_ms` milliseconds; returns -1 and sets
/// the last error on timeout.
#[no_mangle]
pub unsafe extern "C" fn ruscello_read_timeout(
    stream: *const RuscelloStream,
    buf: *mut u8,
    len: size_t,
    timeout_ms: u64,
) -> ssize_t {
    let conn = match stream.as_ref() {
        Some(c) => c,
        None => {
            set_last_error_message("stream is NULL");
            return -1;
        }
    };
    if buf.is_null() {
        set_last_error_message("buffer is NULL");
        return -1;
    }
    let dest = std::slice::from_raw_parts_mut(buf, len);
    count_result(conn.read_timeout(dest, Duration::from_millis(timeout_ms)))
}

/// Block until at least `n` bytes are buffered or the stream ends. `timeout_ms` < 0 waits
/// forever. Returns the number of bytes buffered, or -1 on timeout.
#[no_mangle]
pub unsafe extern "C" fn ruscello_wait_until_buffered(
    stream: *const RuscelloStream,
    n: size_t,
    timeout_ms: i64,
) -> ssize_t {
    match stream.as_ref() {
        Some(conn) => count_result(conn.wait_until_buffered(n, timeout_from_ms(timeout_ms))),
        None => {
            set_last_error_message("stream is NULL");
            -1
        }
    }
}

/// Seek to byte offset `pos`. Returns 1 when the offset was already buffered, 0 when the
/// seek was deferred to the next range request, -1 if stream is NULL.
#[no_mangle]
pub unsafe extern "C" fn ruscello_seek(stream: *const RuscelloStream, pos: u64) -> c_int {
    match stream.as_ref() {
        Some(conn) => c_int::from(conn.seek(pos)),
        None => -1,
    }
}

/// Seek to a fraction (0.0 to 1.0) of the total length. Same return values as ruscello_seek;
/// 0 also when the total length is not yet known.
#[no_mangle]
pub unsafe extern "C" fn ruscello_seek_fraction(stream: *const RuscelloStream, fraction: f64) -> c_int {
    match stream.as_ref() {
        Some(conn) => c_int::from(conn.seek_fraction(fraction)),
        None => -1,
    }
}

/// 1 when the stream has ended (completed, failed or closed) and every byte has been read.
#[no_mangle]
pub unsafe extern "C" fn ruscello_is_end_of_stream(stream: *const RuscelloStream) -> c_int {
    match stream.as_ref() {
        Some(conn) => c_int::from(conn.is_end_of_stream()),
        None => 1,
    }
}

/// Total resource length in bytes, 0 when not (yet) known.
#[no_mangle]
pub unsafe extern "C" fn ruscello_total_length(stream: *const RuscelloStream) -> u64 {
    stream
        .as_ref()
        .and_then(|conn| conn.total_length())
        .unwrap_or(0)
}
