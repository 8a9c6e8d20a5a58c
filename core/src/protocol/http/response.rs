/*
 * response.rs
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

//! Per-fetch response state: status, the headers the stream engine acts on, and the body
//! framing they imply. Reset at the start of every header parse.

use crate::error::{StreamError, StreamResult};

/// Parsed `Content-Range: bytes <start>-<end>/<total>`. `total` is None for `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(value: &str) -> StreamResult<Self> {
        let bad = || StreamError::protocol(format!("bad Content-Range {:?}", value));
        let spec = value.trim().strip_prefix("bytes").ok_or_else(bad)?.trim_start();
        let (range, total) = spec.split_once('/').ok_or_else(bad)?;
        let (start, end) = range.trim().split_once('-').ok_or_else(bad)?;
        let start = start.trim().parse::<u64>().map_err(|_| bad())?;
        let end = end.trim().parse::<u64>().map_err(|_| bad())?;
        if end < start {
            return Err(bad());
        }
        let total = match total.trim() {
            "*" => None,
            t => Some(t.parse::<u64>().map_err(|_| bad())?),
        };
        Ok(Self { start, end, total })
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

fn is_unsatisfied_range(value: &str) -> bool {
    value
        .trim()
        .strip_prefix("bytes")
        .map_or(false, |rest| rest.trim_start().starts_with('*'))
}

/// Status and headers of the response currently being read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponseState {
    pub status_code: u16,
    pub reason: Option<String>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub is_chunked: bool,
    /// Response carried a Content-Range (a partial body).
    pub is_partial: bool,
    pub content_range: Option<ContentRange>,
    /// Server asked to close the connection after this response.
    pub connection_close: bool,
}

impl HttpResponseState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn record_status(&mut self, code: u16, reason: Option<&str>) {
        self.status_code = code;
        self.reason = reason.map(|r| r.to_string());
    }

    /// Apply one header. Unknown headers are ignored; a malformed length or range fails
    /// the cycle.
    pub fn record_header(&mut self, name: &str, value: &str) -> StreamResult<()> {
        if name.eq_ignore_ascii_case("content-length") {
            let len = value.trim().parse::<u64>().map_err(|_| {
                StreamError::protocol(format!("bad Content-Length {:?}", value))
            })?;
            self.content_length = Some(len);
        } else if name.eq_ignore_ascii_case("content-type") {
            self.content_type = Some(value.trim().to_string());
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            if value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
            {
                self.is_chunked = true;
            }
        } else if name.eq_ignore_ascii_case("content-range") {
            // `bytes */<total>` accompanies 416 and carries no range
            if is_unsatisfied_range(value) {
                return Ok(());
            }
            let range = ContentRange::parse(value)?;
            self.is_partial = true;
            self.content_range = Some(range);
        } else if name.eq_ignore_ascii_case("connection") {
            self.connection_close = value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("close"));
        }
        Ok(())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Total resource size: from Content-Range when partial, else Content-Length of a 200.
    pub fn total_length(&self) -> Option<u64> {
        match self.content_range {
            Some(range) => range.total,
            None if self.status_code == 200 && !self.is_chunked => self.content_length,
            None => None,
        }
    }

    /// Length of the body to read when it is framed by Content-Length.
    pub fn framed_length(&self) -> Option<u64> {
        if self.is_chunked {
            None
        } else {
            self.content_length
        }
    }
}
