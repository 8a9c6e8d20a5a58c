/*
 * net.rs
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

//! Transport setup: resolve, TCP connect, TLS handshake.
//!
//! Each stage runs under its own deadline so a stalled server fails the fetch instead of
//! hanging the reactor. The result is an `HttpStream`, plain or TLS.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream as TokioTlsStream;
use tokio_rustls::rustls::client::ClientConfig;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::RootCertStore;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::error::{StreamError, StreamResult};

/// Build a root certificate store: platform native certs first, then webpki-roots as fallback.
fn build_root_store() -> RootCertStore {
    let mut root_store = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = root_store.add(cert);
            }
        }
        Err(e) => warn!("native certificates unavailable: {}", e),
    }
    if root_store.is_empty() {
        root_store.roots = webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect();
    }
    root_store
}

/// TLS client settings shared by every connection of a pool.
#[derive(Clone)]
pub struct TlsContext {
    connector: TlsConnector,
}

impl TlsContext {
    /// Native + Mozilla roots, no client auth, ALPN `http/1.1` only.
    pub fn new() -> Self {
        let mut config = ClientConfig::builder()
            .with_root_certificates(build_root_store())
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    pub fn connector(&self) -> &TlsConnector {
        &self.connector
    }
}

impl Default for TlsContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext").finish_non_exhaustive()
    }
}

/// Unified stream: plain TCP or TLS. Implements AsyncRead + AsyncWrite.
pub enum HttpStream {
    Plain(TcpStream),
    Tls(Box<TokioTlsStream<TcpStream>>),
}

impl HttpStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, HttpStream::Tls(_))
    }
}

impl AsyncRead for HttpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for HttpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_flush(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            HttpStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            HttpStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Run `fut` under `limit`; a timeout becomes `StreamError::Timeout`, an I/O failure a
/// transport error tagged with `stage`.
pub async fn with_deadline<T, F>(stage: &'static str, limit: Duration, fut: F) -> StreamResult<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StreamError::transport(stage, &e)),
        Err(_) => {
            debug!("{} timed out after {:?}", stage, limit);
            Err(StreamError::Timeout)
        }
    }
}

/// Resolve `host:port` to socket addresses.
pub async fn resolve(host: &str, port: u16, limit: Duration) -> StreamResult<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = with_deadline("resolve", limit, async {
        Ok(tokio::net::lookup_host((host, port)).await?.collect())
    })
    .await?;
    if addrs.is_empty() {
        let e = io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {}", host));
        return Err(StreamError::transport("resolve", &e));
    }
    Ok(addrs)
}

/// TCP connect, trying each address in turn. Returns the last failure when none answer.
pub async fn connect(addrs: &[SocketAddr], limit: Duration) -> StreamResult<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match with_deadline("connect", limit, TcpStream::connect(addr)).await {
            Ok(tcp) => {
                let _ = tcp.set_nodelay(true);
                return Ok(tcp);
            }
            Err(e) => {
                debug!("connect {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(StreamError::Closed))
}

/// TLS handshake over `tcp` with SNI `host`.
pub async fn handshake(
    tls: &TlsContext,
    host: &str,
    tcp: TcpStream,
    limit: Duration,
) -> StreamResult<HttpStream> {
    let server_name = ServerName::try_from(host.to_owned()).map_err(|_| {
        let e = io::Error::new(io::ErrorKind::InvalidInput, "invalid host name");
        StreamError::transport("handshake", &e)
    })?;
    let stream = with_deadline("handshake", limit, tls.connector().connect(server_name, tcp)).await?;
    Ok(HttpStream::Tls(Box::new(stream)))
}
