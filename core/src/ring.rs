/*
 * ring.rs
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

//! Fixed-capacity circular byte buffer between the I/O thread (single writer) and the
//! decoder (single reader).
//!
//! Positions, size, and storage live under one `parking_lot::Mutex`. The writer signals
//! `data_available` after every write; the reader waits on it. Readers signal
//! `space_available` (a tokio `Notify`) so the async writer can apply flow control without
//! blocking the reactor. No lock is held across an await.
//!
//! The buffer also tracks the stream offset of the byte at the read position, so a seek
//! that lands inside the buffered window can be served by moving the read cursor.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::{StreamError, StreamResult};

struct RingState {
    storage: Box<[u8]>,
    read_pos: usize,
    write_pos: usize,
    size: usize,
    /// Stream offset of the byte at `read_pos`.
    start_offset: u64,
    /// Writer is finished (end of stream, failure, or shutdown).
    closed: bool,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn copy_in(&mut self, data: &[u8]) {
        let cap = self.capacity();
        let first = data.len().min(cap - self.write_pos);
        self.storage[self.write_pos..self.write_pos + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        if rest > 0 {
            self.storage[..rest].copy_from_slice(&data[first..]);
        }
        self.write_pos = (self.write_pos + data.len()) % cap;
        self.size += data.len();
    }

    fn copy_out(&mut self, dest: &mut [u8]) -> usize {
        let n = dest.len().min(self.size);
        if n == 0 {
            return 0;
        }
        let cap = self.capacity();
        let first = n.min(cap - self.read_pos);
        dest[..first].copy_from_slice(&self.storage[self.read_pos..self.read_pos + first]);
        if n > first {
            dest[first..n].copy_from_slice(&self.storage[..n - first]);
        }
        self.discard(n);
        n
    }

    fn discard(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.size -= n;
        self.start_offset += n as u64;
    }

    fn reset(&mut self, offset: u64) {
        self.read_pos = 0;
        self.write_pos = 0;
        self.size = 0;
        self.start_offset = offset;
    }
}

/// Single-writer, single-reader circular byte store.
pub struct RingBuffer {
    state: Mutex<RingState>,
    data_available: Condvar,
    space_available: Notify,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                storage: vec![0u8; capacity].into_boxed_slice(),
                read_pos: 0,
                write_pos: 0,
                size: 0,
                start_offset: 0,
                closed: false,
            }),
            data_available: Condvar::new(),
            space_available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Bytes currently held.
    pub fn len(&self) -> usize {
        self.state.lock().size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Space a whole block may occupy: capacity minus size minus a one-byte margin.
    pub fn free_space(&self) -> usize {
        let state = self.state.lock();
        state.capacity().saturating_sub(state.size + 1)
    }

    /// Stream offset of the next byte a reader will get.
    pub fn start_offset(&self) -> u64 {
        self.state.lock().start_offset
    }

    /// Stream offset one past the last buffered byte.
    pub fn end_offset(&self) -> u64 {
        let state = self.state.lock();
        state.start_offset + state.size as u64
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Closed and drained: readers will only ever see zero-byte reads.
    pub fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.size == 0
    }

    /// Append `data` at the write position, wrapping at capacity. Fails without writing
    /// anything if it would exceed capacity.
    pub fn write(&self, data: &[u8]) -> StreamResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.state.lock();
            let available = state.capacity() - state.size;
            if data.len() > available {
                return Err(StreamError::Capacity {
                    needed: data.len(),
                    available,
                });
            }
            state.copy_in(data);
        }
        self.data_available.notify_all();
        Ok(())
    }

    /// Block until at least one byte is available or the writer has closed, then copy up to
    /// `dest.len()` bytes. Returns 0 only at end of stream.
    pub fn read(&self, dest: &mut [u8]) -> usize {
        if dest.is_empty() {
            return 0;
        }
        let n = {
            let mut state = self.state.lock();
            while state.size == 0 && !state.closed {
                self.data_available.wait(&mut state);
            }
            state.copy_out(dest)
        };
        if n > 0 {
            self.space_available.notify_one();
        }
        n
    }

    /// Like [`read`](Self::read) but gives up after `timeout`.
    pub fn read_timeout(&self, dest: &mut [u8], timeout: Duration) -> StreamResult<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout;
        let n = {
            let mut state = self.state.lock();
            while state.size == 0 && !state.closed {
                if self
                    .data_available
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    if state.size == 0 && !state.closed {
                        return Err(StreamError::Timeout);
                    }
                    break;
                }
            }
            state.copy_out(dest)
        };
        if n > 0 {
            self.space_available.notify_one();
        }
        Ok(n)
    }

    /// Non-blocking poll: copy whatever is buffered, possibly nothing.
    pub fn try_read(&self, dest: &mut [u8]) -> usize {
        let n = self.state.lock().copy_out(dest);
        if n > 0 {
            self.space_available.notify_one();
        }
        n
    }

    /// Block until `required` bytes are buffered or the writer has closed. Returns the
    /// buffered byte count. `None` waits without a deadline.
    pub fn wait_for(&self, required: usize, timeout: Option<Duration>) -> StreamResult<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.size < required && !state.closed {
            match deadline {
                Some(deadline) => {
                    if self
                        .data_available
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.size < required
                        && !state.closed
                    {
                        return Err(StreamError::Timeout);
                    }
                }
                None => self.data_available.wait(&mut state),
            }
        }
        Ok(state.size)
    }

    /// Move the read cursor to stream offset `pos` when it lies within the buffered window.
    pub fn skip_to(&self, pos: u64) -> bool {
        {
            let mut state = self.state.lock();
            let start = state.start_offset;
            if pos < start || pos >= start + state.size as u64 {
                return false;
            }
            let delta = (pos - start) as usize;
            state.discard(delta);
        }
        self.space_available.notify_one();
        true
    }

    /// Drop all buffered bytes, keeping the current stream offset.
    pub fn clear(&self) {
        {
            let mut state = self.state.lock();
            let offset = state.start_offset;
            state.reset(offset);
        }
        self.space_available.notify_one();
    }

    /// Drop all buffered bytes and restart at stream offset `offset`. Reopens a closed buffer.
    pub fn reset_to(&self, offset: u64) {
        {
            let mut state = self.state.lock();
            state.reset(offset);
            state.closed = false;
        }
        self.space_available.notify_one();
    }

    /// Mark the writer finished and wake every blocked reader.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.data_available.notify_all();
        self.space_available.notify_one();
    }

    /// Wait (asynchronously) until `needed` bytes fit within [`free_space`](Self::free_space)
    /// or the buffer is closed.
    pub async fn wait_for_space(&self, needed: usize) {
        loop {
            let notified = self.space_available.notified();
            {
                let state = self.state.lock();
                if state.closed || state.capacity().saturating_sub(state.size + 1) >= needed {
                    return;
                }
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RingBuffer")
            .field("capacity", &state.capacity())
            .field("size", &state.size)
            .field("read_pos", &state.read_pos)
            .field("write_pos", &state.write_pos)
            .field("start_offset", &state.start_offset)
            .field("closed", &state.closed)
            .finish()
    }
}
