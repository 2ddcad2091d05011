//! TCP/TLS transport and the production connection factory.
//!
//! [`TcpConnectionFactory`] dials `host:port` with the caller's creation
//! timeout and hands back a [`TcpTransport`]. No protocol handshake happens
//! here: the request layer owns authentication and framing. When TLS is
//! enabled the request layer still sends and receives plaintext while the
//! transport encrypts/decrypts via `rustls`.
//!
//! ```text
//! ConnectionPool::borrow()
//!   → spawn_blocking(TcpConnectionFactory::dial(address, timeout))
//!     → resolve → TcpStream::connect_timeout → [TLS wrap (if enabled)]
//!       → Box<dyn Transport>
//! ```

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{ConnectionFactory, Transport};
use crate::error::DialError;

// ── Transport ────────────────────────────────────────────────────────

/// Plain TCP, or TLS layered over TCP.
enum Stream {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ClientConnection, TcpStream>>),
}

/// A [`Transport`] over TCP, optionally wrapped in TLS.
pub struct TcpTransport {
    stream: Stream,
}

impl std::fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tls = matches!(self.stream, Stream::Tls(_));
        f.debug_struct("TcpTransport")
            .field("tls", &tls)
            .field("peer", &self.tcp_stream().peer_addr().ok())
            .finish()
    }
}

impl TcpTransport {
    pub fn plain(stream: TcpStream) -> Self {
        Self {
            stream: Stream::Plain(stream),
        }
    }

    pub fn tls(stream: rustls::StreamOwned<rustls::ClientConnection, TcpStream>) -> Self {
        Self {
            stream: Stream::Tls(Box::new(stream)),
        }
    }

    /// The underlying TCP stream, regardless of the TLS layer.
    fn tcp_stream(&self) -> &TcpStream {
        match &self.stream {
            Stream::Plain(s) => s,
            Stream::Tls(s) => &s.sock,
        }
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, data: &[u8]) -> std::io::Result<usize> {
        match &mut self.stream {
            Stream::Plain(stream) => stream.write_all(data)?,
            Stream::Tls(stream) => {
                stream.write_all(data)?;
                stream.flush()?;
            }
        }
        Ok(data.len())
    }

    fn recv(&mut self, max_bytes: usize) -> std::io::Result<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        let n = match &mut self.stream {
            Stream::Plain(stream) => stream.read(&mut buf)?,
            Stream::Tls(stream) => stream.read(&mut buf)?,
        };
        buf.truncate(n);
        Ok(buf)
    }

    fn close(&mut self) -> std::io::Result<()> {
        if let Stream::Tls(stream) = &mut self.stream {
            // Close runs inside release; never wait on the peer for close_notify.
            stream.conn.send_close_notify();
            if stream.sock.set_nonblocking(true).is_ok() {
                let _ = stream.conn.write_tls(&mut stream.sock);
            }
        }
        match self.tcp_stream().shutdown(Shutdown::Both) {
            // The peer beat us to it; the socket is released either way.
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

// ── TlsConfig ────────────────────────────────────────────────────────

/// Configuration for TLS connections.
#[derive(Clone)]
pub struct TlsConfig {
    pub client_config: Arc<rustls::ClientConfig>,
}

impl TlsConfig {
    /// TLS config over the Mozilla root certificate store.
    pub fn with_system_roots() -> Result<Self, DialError> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| DialError::Tls(format!("protocol versions: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        Ok(Self {
            client_config: Arc::new(config),
        })
    }
}

impl From<Arc<rustls::ClientConfig>> for TlsConfig {
    fn from(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self { client_config }
    }
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish_non_exhaustive()
    }
}

// ── TcpConnectionFactory ─────────────────────────────────────────────

/// Dials nodes over TCP (optionally TLS).
#[derive(Debug)]
pub struct TcpConnectionFactory {
    /// Read and write timeout set on every dialed socket.
    recv_timeout: Duration,
    /// If `None`, connections are plain TCP.
    tls_config: Option<TlsConfig>,
}

impl TcpConnectionFactory {
    pub fn plain(recv_timeout: Duration) -> Self {
        Self {
            recv_timeout,
            tls_config: None,
        }
    }

    pub fn with_tls(recv_timeout: Duration, tls_config: TlsConfig) -> Self {
        Self {
            recv_timeout,
            tls_config: Some(tls_config),
        }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn dial(&self, address: &str, timeout: Duration) -> Result<Box<dyn Transport>, DialError> {
        let addr = address
            .to_socket_addrs()
            .map_err(|e| DialError::Resolve {
                address: address.to_string(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| DialError::Resolve {
                address: address.to_string(),
                reason: "no addresses returned".to_string(),
            })?;

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|source| {
            if source.kind() == std::io::ErrorKind::TimedOut {
                DialError::Timeout(timeout)
            } else {
                DialError::Connect {
                    address: address.to_string(),
                    source,
                }
            }
        })?;

        let connect_err = |source| DialError::Connect {
            address: address.to_string(),
            source,
        };
        stream
            .set_read_timeout(Some(self.recv_timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.recv_timeout)))
            .map_err(connect_err)?;
        // Request/response traffic is small and latency-bound.
        let _ = stream.set_nodelay(true);

        tracing::debug!(
            address = %address,
            peer = %addr,
            tls = self.tls_config.is_some(),
            "established tcp connection"
        );

        let Some(tls) = &self.tls_config else {
            return Ok(Box::new(TcpTransport::plain(stream)));
        };

        let host = address
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(address)
            .trim_start_matches('[')
            .trim_end_matches(']');
        let server_name = rustls::pki_types::ServerName::try_from(host)
            .map_err(|e| DialError::Tls(format!("invalid server name '{host}': {e}")))?
            .to_owned();
        let tls_conn = rustls::ClientConnection::new(Arc::clone(&tls.client_config), server_name)
            .map_err(|e| DialError::Tls(format!("session creation: {e}")))?;

        Ok(Box::new(TcpTransport::tls(rustls::StreamOwned::new(
            tls_conn, stream,
        ))))
    }
}

// ── Tests ────────────────────────────────────────────────────────────
