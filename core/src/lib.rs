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

//! Ruscello core: seekable HTTP(S) range streaming into bounded ring buffers.
//!
//! A [`ConnectionPool`] hands out [`StreamConnection`]s. Each connection fetches its
//! resource one block at a time on the pool's I/O thread and lands the bytes in a
//! [`RingBuffer`] the decoder reads from.

pub mod config;
pub mod error;
pub mod net;
pub mod protocol;
pub mod ring;
pub mod stream;
pub mod uri;

pub use config::StreamConfig;
pub use error::{StreamError, StreamResult};
pub use ring::RingBuffer;
pub use stream::{BodyMode, ConnState, ConnectionPool, StreamConnection};
pub use uri::{parse_url, ParsedUrl, Scheme};
