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

//! Streaming download engine: connections that fill ring buffers from HTTP range
//! requests, the reactor they run on, and the pool that hands them out.

mod connection;
mod pool;
mod reactor;
mod state;

pub use connection::StreamConnection;
pub use pool::ConnectionPool;
pub use reactor::Reactor;
pub use state::{BodyMode, ConnState};
