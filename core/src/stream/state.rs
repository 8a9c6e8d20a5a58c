/*
 * state.rs
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

use std::fmt;

/// How the body of the current response is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// Transfer-Encoding: chunked.
    Chunked,
    /// 206 with Content-Range: exactly the requested window.
    Range,
    /// 200 carrying the whole resource (server ignored Range).
    Identity,
}

/// Protocol state of a stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Resolving,
    Connecting,
    Handshaking,
    RequestSent,
    HeaderParsing,
    BodyStreaming(BodyMode),
    /// Socket dropped between blocks; the next fetch opens a new one.
    Reconnecting,
    /// Socket open, nothing in flight (parked, flow-controlled, or stream complete).
    Idle,
    Closed,
    Failed,
}

impl ConnState {
    /// Closed or Failed: the connection will not fetch again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnState::Closed | ConnState::Failed)
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Resolving => "resolving",
            ConnState::Connecting => "connecting",
            ConnState::Handshaking => "handshaking",
            ConnState::RequestSent => "request-sent",
            ConnState::HeaderParsing => "header-parsing",
            ConnState::BodyStreaming(BodyMode::Chunked) => "body-streaming(chunked)",
            ConnState::BodyStreaming(BodyMode::Range) => "body-streaming(range)",
            ConnState::BodyStreaming(BodyMode::Identity) => "body-streaming(identity)",
            ConnState::Reconnecting => "reconnecting",
            ConnState::Idle => "idle",
            ConnState::Closed => "closed",
            ConnState::Failed => "failed",
        };
        f.write_str(s)
    }
}
