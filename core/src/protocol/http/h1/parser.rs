/*
 * parser.rs
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

//! HTTP/1.1 response push parser: status line, headers, body (Content-Length, chunked,
//! or read-until-close).

use bytes::Buf;
use bytes::BytesMut;

use crate::error::{StreamError, StreamResult};

/// Upper bound on status line plus headers (and, separately, on the trailer section).
pub const MAX_HEAD_SIZE: usize = 32 * 1024;
/// Upper bound on a chunk-size line, extensions included.
const MAX_CHUNK_LINE: usize = 1024;

/// Callback for HTTP/1.1 response events. The stream connection implements this to
/// collect headers and land body bytes.
pub trait H1ResponseHandler {
    fn status(&mut self, code: u16, reason: Option<&str>);
    fn header(&mut self, name: &str, value: &str);
    fn body_chunk(&mut self, data: &[u8]);
    fn trailer(&mut self, _name: &str, _value: &str) {}
    fn complete(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Idle,
    StatusLine,
    Headers,
    /// Headers done; connection must call set_body_mode().
    HeadersComplete,
    Body,
    ChunkSize,
    ChunkData,
    ChunkTrailer,
}

/// Push parser for HTTP/1.1 responses. Feed bytes via `receive`; the handler is invoked as
/// complete tokens are parsed. Bytes past the end of a response stay in the buffer for the
/// next one.
pub struct ResponseParser {
    state: ParseState,
    /// Content-Length when known (None for chunked or read-until-close).
    content_length: Option<u64>,
    bytes_received: u64,
    chunk_remaining: u64,
    /// Head (or trailer) bytes consumed so far in this response.
    head_bytes: usize,
    /// Prefix of the buffer already searched for CRLF without a match.
    scanned: usize,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self {
            state: ParseState::StatusLine,
            content_length: None,
            bytes_received: 0,
            chunk_remaining: 0,
            head_bytes: 0,
            scanned: 0,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = ParseState::StatusLine;
        self.content_length = None;
        self.bytes_received = 0;
        self.chunk_remaining = 0;
        self.head_bytes = 0;
        self.scanned = 0;
    }

    /// Length of the next line before its CRLF, or None if no full line is buffered yet.
    /// The search resumes where the previous one stopped. A line that cannot end within
    /// `limit` bytes is a protocol error.
    fn next_line(&mut self, buf: &[u8], limit: usize, what: &str) -> StreamResult<Option<usize>> {
        // the CR of a CRLF may be the last byte already scanned
        let from = self.scanned.saturating_sub(1).min(buf.len());
        let found = buf[from..].windows(2).position(|w| w == b"\r\n");
        let too_long = || StreamError::protocol(format!("{} longer than {} bytes", what, limit));
        match found {
            Some(n) => {
                let line_end = from + n;
                if line_end + 2 > limit {
                    return Err(too_long());
                }
                self.scanned = 0;
                Ok(Some(line_end))
            }
            None if buf.len() >= limit => Err(too_long()),
            None => {
                self.scanned = buf.len();
                Ok(None)
            }
        }
    }

    /// Remaining head budget; each consumed head or trailer line is charged against it.
    fn head_budget(&self) -> usize {
        MAX_HEAD_SIZE.saturating_sub(self.head_bytes)
    }

    fn line_str(line: &[u8], what: &str) -> StreamResult<String> {
        std::str::from_utf8(line)
            .map(|s| s.to_string())
            .map_err(|_| StreamError::protocol(format!("invalid {} UTF-8", what)))
    }

    /// Parse `HTTP/1.x <3-digit code>[ <reason>]`.
    fn parse_status_line(line: &str) -> StreamResult<(u16, Option<String>)> {
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        if !version.starts_with("HTTP/") {
            return Err(StreamError::protocol(format!("bad status line {:?}", line)));
        }
        let code_str = parts.next().unwrap_or("");
        if code_str.len() != 3 || !code_str.bytes().all(|b| b.is_ascii_digit()) {
            return Err(StreamError::protocol(format!("bad status code in {:?}", line)));
        }
        let code = code_str
            .parse::<u16>()
            .map_err(|_| StreamError::protocol(format!("bad status code in {:?}", line)))?;
        let reason = parts.next().map(|s| s.to_string()).filter(|s| !s.is_empty());
        Ok((code, reason))
    }

    fn parse_chunk_size(line: &str) -> StreamResult<u64> {
        let hex_part = line.split(';').next().unwrap_or(line).trim();
        if hex_part.is_empty() {
            return Err(StreamError::protocol("empty chunk size line"));
        }
        u64::from_str_radix(hex_part, 16)
            .map_err(|_| StreamError::protocol(format!("bad chunk size {:?}", hex_part)))
    }

    /// Consume and parse as much as possible from buf. Partial data remains in buf.
    pub fn receive<H: H1ResponseHandler>(
        &mut self,
        buf: &mut BytesMut,
        handler: &mut H,
    ) -> StreamResult<()> {
        while !buf.is_empty() {
            match self.state {
                ParseState::StatusLine => {
                    let line_end = match self.next_line(buf, self.head_budget(), "response head")? {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    self.head_bytes += line_end + 2;
                    let line = buf.split_to(line_end + 2);
                    let line_str = Self::line_str(&line[..line_end], "status line")?;
                    let (code, reason) = Self::parse_status_line(&line_str)?;
                    handler.status(code, reason.as_deref());
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let line_end = match self.next_line(buf, self.head_budget(), "response head")? {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    self.head_bytes += line_end + 2;
                    if line_end == 0 {
                        buf.advance(2);
                        self.head_bytes = 0;
                        self.state = ParseState::HeadersComplete;
                        return Ok(());
                    }
                    let line = buf.split_to(line_end + 2);
                    let line_str = Self::line_str(&line[..line_end], "header")?;
                    if let Some(colon) = line_str.find(':') {
                        let name = line_str[..colon].trim();
                        let value = line_str[colon + 1..].trim();
                        handler.header(name, value);
                    }
                }
                ParseState::Body => match self.content_length {
                    Some(content_length) => {
                        let remaining = content_length - self.bytes_received;
                        let to_read = (remaining as usize).min(buf.len());
                        if to_read > 0 {
                            let chunk = buf.split_to(to_read);
                            handler.body_chunk(&chunk);
                            self.bytes_received += to_read as u64;
                        }
                        if self.bytes_received >= content_length {
                            handler.complete();
                            self.state = ParseState::Idle;
                        }
                    }
                    None => {
                        let chunk = buf.split_to(buf.len());
                        handler.body_chunk(&chunk);
                        return Ok(());
                    }
                },
                ParseState::ChunkSize => {
                    let line_end = match self.next_line(buf, MAX_CHUNK_LINE, "chunk size line")? {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    let line = buf.split_to(line_end + 2);
                    let line_str = Self::line_str(&line[..line_end], "chunk size")?;
                    self.chunk_remaining = Self::parse_chunk_size(&line_str)?;
                    self.state = if self.chunk_remaining == 0 {
                        ParseState::ChunkTrailer
                    } else {
                        ParseState::ChunkData
                    };
                }
                ParseState::ChunkData => {
                    if self.chunk_remaining > 0 {
                        let to_read = (self.chunk_remaining as usize).min(buf.len());
                        let chunk = buf.split_to(to_read);
                        handler.body_chunk(&chunk);
                        self.chunk_remaining -= to_read as u64;
                    }
                    if self.chunk_remaining > 0 {
                        return Ok(());
                    }
                    // payload done; the CRLF that closes it must follow
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(StreamError::protocol("chunk data not followed by CRLF"));
                    }
                    buf.advance(2);
                    self.state = ParseState::ChunkSize;
                }
                ParseState::ChunkTrailer => {
                    let line_end = match self.next_line(buf, self.head_budget(), "trailer section")? {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    self.head_bytes += line_end + 2;
                    if line_end == 0 {
                        self.head_bytes = 0;
                        buf.advance(2);
                        handler.complete();
                        self.state = ParseState::Idle;
                    } else {
                        let line = buf.split_to(line_end + 2);
                        let line_str = Self::line_str(&line[..line_end], "trailer")?;
                        if let Some(colon) = line_str.find(':') {
                            handler.trailer(line_str[..colon].trim(), line_str[colon + 1..].trim());
                        }
                    }
                }
                ParseState::HeadersComplete | ParseState::Idle => return Ok(()),
            }
        }
        Ok(())
    }

    /// Called by the connection once headers are in (state HeadersComplete).
    pub fn set_body_mode(&mut self, content_length: Option<u64>, chunked: bool) {
        if self.state != ParseState::HeadersComplete {
            return;
        }
        self.bytes_received = 0;
        if chunked {
            self.content_length = None;
            self.state = ParseState::ChunkSize;
        } else if let Some(cl) = content_length {
            self.content_length = Some(cl);
            self.state = if cl == 0 {
                ParseState::Idle
            } else {
                ParseState::Body
            };
        } else {
            self.content_length = None;
            self.state = ParseState::Body;
        }
    }

    /// Response has no body (HEAD, 204, 304): go straight to Idle.
    pub fn set_no_body(&mut self) {
        if self.state == ParseState::HeadersComplete {
            self.state = ParseState::Idle;
        }
    }

    /// The peer closed the socket. Completes a read-until-close body; anything else was cut short.
    pub fn finish_on_close<H: H1ResponseHandler>(&mut self, handler: &mut H) -> StreamResult<()> {
        match self.state {
            ParseState::Body if self.content_length.is_none() => {
                handler.complete();
                self.state = ParseState::Idle;
                Ok(())
            }
            ParseState::Idle => Ok(()),
            _ => Err(StreamError::protocol("connection closed mid-response")),
        }
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}
