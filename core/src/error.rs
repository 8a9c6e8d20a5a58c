/*
 * error.rs
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

//! Stream engine errors.

use std::io;

use thiserror::Error;

/// Errors from URL parsing, connection setup, response parsing, and buffer handoff.
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    /// URL has no scheme separator, an empty host, a bad port, or an unsupported scheme.
    #[error("invalid URL {url:?}: {reason}")]
    UrlFormat { url: String, reason: String },

    /// Resolve, connect, handshake, read, or write failed.
    #[error("transport error during {stage}: {message}")]
    Transport {
        stage: &'static str,
        kind: io::ErrorKind,
        message: String,
    },

    /// Status line, header value, or chunk size could not be parsed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Incoming block would not fit in the free space of the ring buffer.
    #[error("ring buffer overflow: {needed} bytes needed, {available} available")]
    Capacity { needed: usize, available: usize },

    /// A blocking call or network step ran past its deadline.
    #[error("timed out")]
    Timeout,

    /// The connection or pool has been shut down.
    #[error("connection closed")]
    Closed,

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StreamError {
    pub fn url_format(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UrlFormat {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Wrap an I/O failure with the protocol stage it happened in.
    pub fn transport(stage: &'static str, error: &io::Error) -> Self {
        Self::Transport {
            stage,
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, StreamError::Transport { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, StreamError::Timeout)
    }

    /// True when the peer closed the socket cleanly (EOF) rather than failing.
    pub fn is_peer_close(&self) -> bool {
        matches!(
            self,
            StreamError::Transport {
                kind: io::ErrorKind::UnexpectedEof,
                ..
            }
        )
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_keeps_kind_and_stage() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = StreamError::transport("connect", &io_err);
        assert!(err.is_transport());
        assert!(!err.is_peer_close());
        assert_eq!(err.to_string(), "transport error during connect: refused");
    }

    #[test]
    fn eof_is_peer_close() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "closed");
        assert!(StreamError::transport("read", &io_err).is_peer_close());
    }

    #[test]
    fn capacity_message() {
        let err = StreamError::Capacity {
            needed: 10,
            available: 3,
        };
        assert_eq!(
            err.to_string(),
            "ring buffer overflow: 10 bytes needed, 3 available"
        );
    }
}
