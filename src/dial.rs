//! Dialer: opens TCP or TLS-over-TCP connections to a target with a
//! bounded connect timeout, and fails over across an ordered target list.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::warn;

use crate::config::HostConfig;
use crate::error::ProxyError;
use crate::metrics::MetricsSink;
use crate::tls::{self, ClientTlsContext};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Any stream the proxy engine can copy bytes through, regardless of
/// whether it ended up being TLS-wrapped.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> AsyncStream for T {}

/// A boxed, type-erased connection: plain TCP or TLS-over-TCP.
pub type Io = Box<dyn AsyncStream>;

/// Either a plain TCP stream or a TLS stream over one.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Connection {
    /// Erase the concrete stream type so the engine can copy bytes through
    /// it without caring whether TLS was involved.
    pub fn into_io(self) -> Io {
        match self {
            Connection::Plain(s) => Box::new(s),
            Connection::Tls(s) => Box::new(*s),
        }
    }
}

/// `dial(hc)`: connect to `hc.host:hc.port` with a fixed 5-second connect
/// timeout, wrapping in TLS when `hc.tls` is configured.
pub async fn dial(hc: &HostConfig) -> Result<Connection, ProxyError> {
    let addr = hc.addr();
    let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| ProxyError::Dial {
            host: hc.host.clone(),
            port: hc.port,
            source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        })?
        .map_err(|e| ProxyError::Dial {
            host: hc.host.clone(),
            port: hc.port,
            source: e,
        })?;

    let Some(tls_cfg) = &hc.tls else {
        return Ok(Connection::Plain(tcp));
    };

    let ctx = tls::build_client(Some(tls_cfg)).map_err(|e| ProxyError::Dial {
        host: hc.host.clone(),
        port: hc.port,
        source: std::io::Error::other(e.to_string()),
    })?;

    let ClientTlsContext::Tls(connector) = ctx else {
        return Ok(Connection::Plain(tcp));
    };

    let server_name = tls::server_name_for(tls_cfg, &hc.host).map_err(|e| ProxyError::Dial {
        host: hc.host.clone(),
        port: hc.port,
        source: std::io::Error::other(e.to_string()),
    })?;

    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| ProxyError::Dial {
            host: hc.host.clone(),
            port: hc.port,
            source: e,
        })?;

    Ok(Connection::Tls(Box::new(stream)))
}

/// `dial_any(targets)`: try each target in order, publishing
/// `upstream_dial_error{host,port}` on each failure, returning the first
/// success along with the `HostConfig` used. Installs the chosen target's
/// read+write deadline on success (a deadline of `Duration::ZERO` installs
/// none).
///
/// Callers are expected to have already shuffled `targets`: this
/// function always tries them in the order given.
pub async fn dial_any<'a>(
    targets: &'a [HostConfig],
    server_name: &str,
    metrics: &dyn MetricsSink,
) -> Result<(Connection, &'a HostConfig), ProxyError> {
    for hc in targets {
        match dial(hc).await {
            Ok(conn) => return Ok((conn, hc)),
            Err(_) => {
                metrics.upstream_dial_error(&hc.host, hc.port);
                warn!(host = %hc.host, port = hc.port, "dial failed, trying next target");
            }
        }
    }

    Err(ProxyError::NoBackends {
        server: server_name.to_owned(),
    })
}
