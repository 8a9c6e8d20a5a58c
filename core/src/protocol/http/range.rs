/*
 * range.rs
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

//! Byte-range cursor: which `Range: bytes=start-end` window to request next.

/// Window of the next range request. Both ends inclusive.
///
/// Until the resource size is known the window is a full block; once the first
/// Content-Range teaches the total, `range_end` never passes `total_length - 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeCursor {
    pub range_start: u64,
    pub range_end: u64,
    /// Bytes in the block last received.
    pub content_length: u64,
    pub total_length: Option<u64>,
    block_size: u64,
}

impl RangeCursor {
    pub fn new(block_size: u64) -> Self {
        let block_size = block_size.max(1);
        Self {
            range_start: 0,
            range_end: block_size - 1,
            content_length: 0,
            total_length: None,
            block_size,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Start over at offset 0, forgetting the total (new target).
    pub fn reset(&mut self) {
        self.total_length = None;
        self.content_length = 0;
        self.seek(0);
    }

    /// Point the next window at `pos`.
    pub fn seek(&mut self, pos: u64) {
        self.range_start = pos;
        self.range_end = self.clamp_end(pos.saturating_add(self.block_size - 1));
    }

    /// Record the resource size and re-clamp the current window.
    pub fn set_total_length(&mut self, total: u64) {
        self.total_length = Some(total);
        self.range_end = self.clamp_end(self.range_end);
    }

    fn clamp_end(&self, end: u64) -> u64 {
        match self.total_length {
            Some(total) if total > 0 => end.min(total - 1),
            _ => end,
        }
    }

    /// The window as (start, end).
    pub fn window(&self) -> (u64, u64) {
        (self.range_start, self.range_end)
    }

    /// True when every byte of a known-size resource has been requested.
    pub fn is_complete(&self) -> bool {
        match self.total_length {
            Some(total) => self.range_start >= total,
            None => false,
        }
    }

    /// Advance past the window just fetched. Called once per completed range request.
    pub fn move_to_next_block(&mut self) {
        self.content_length = self.range_end - self.range_start + 1;
        self.range_start = self.range_end + 1;
        self.range_end = self.clamp_end(self.range_start.saturating_add(self.block_size - 1));
    }
}
