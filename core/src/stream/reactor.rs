/*
 * reactor.rs
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

//! The I/O reactor: one `current_thread` tokio runtime driven by a dedicated thread.
//! Every connection driver and the pool sweep run here, so protocol state transitions
//! for a connection never race each other.

use std::future::Future;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{StreamError, StreamResult};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub struct Reactor {
    handle: Handle,
    stop: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    /// Build the runtime and start the "ruscello-io" thread.
    pub fn start() -> StreamResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| StreamError::transport("reactor", &e))?;
        let handle = runtime.handle().clone();
        let stop = CancellationToken::new();
        let token = stop.clone();
        let thread = std::thread::Builder::new()
            .name("ruscello-io".to_string())
            .spawn(move || {
                runtime.block_on(token.cancelled());
                // drops every task still parked on the runtime; a resolver stuck in
                // getaddrinfo is abandoned after the grace period
                runtime.shutdown_timeout(SHUTDOWN_GRACE);
                debug!("reactor stopped");
            })
            .map_err(|e| StreamError::transport("reactor", &e))?;
        debug!("reactor started");
        Ok(Self {
            handle,
            stop,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn spawn<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(fut)
    }

    pub fn is_running(&self) -> bool {
        !self.stop.is_cancelled()
    }

    /// Stop the event loop and join its thread. Idempotent. When called from the reactor
    /// thread itself the join is skipped; the thread exits once the current task yields.
    pub fn shutdown(&self) {
        self.stop.cancel();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("reactor thread panicked");
            }
        }
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_tasks_on_named_thread() {
        let reactor = Reactor::start().unwrap();
        let (tx, rx) = mpsc::channel();
        reactor.spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let name = std::thread::current().name().map(|s| s.to_string());
            let _ = tx.send(name);
        });
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("ruscello-io"));
        reactor.shutdown();
        assert!(!reactor.is_running());
        reactor.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_tasks() {
        let reactor = Reactor::start().unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        reactor.spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        reactor.shutdown();
        // the sender was dropped with the task
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
    }
}
