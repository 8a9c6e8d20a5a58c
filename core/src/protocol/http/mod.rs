/*
 * mod.rs
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

//! HTTP/1.1 range fetching.
//!
//! - Requests: `RequestBuilder` composes `GET` with `Range: bytes=s-e` and keep-alive.
//! - Responses: push-parsed by `h1::ResponseParser` into `HttpResponseState`.
//! - Windows: `RangeCursor` walks the resource one block at a time.
//! - Buffers: `bytes` crate (BytesMut for the parse buffer).

mod range;
mod request;
mod response;

pub mod h1;

pub use h1::{H1ResponseHandler, ParseState, ResponseParser};
pub use range::RangeCursor;
pub use request::{Method, RequestBuilder};
pub use response::{ContentRange, HttpResponseState};
