//! Proxy engine: owns a listener, an accept loop, per-connection
//! forwarding tasks, a tee-writer to the mirror, and orderly shutdown of
//! in-flight work.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::seq::SliceRandom;
use socket2::{Domain, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::crl;
use crate::dial::{self, Io};
use crate::error::ProxyError;
use crate::metrics::MetricsSink;
use crate::tls::{self, ServerTlsContext};

/// Lifecycle states of a single [`Proxy`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Idle = 0,
    Listening = 1,
    Draining = 2,
    Closed = 3,
}

impl From<u8> for ProxyState {
    fn from(v: u8) -> Self {
        match v {
            1 => ProxyState::Listening,
            2 => ProxyState::Draining,
            3 => ProxyState::Closed,
            _ => ProxyState::Idle,
        }
    }
}

fn reuseport_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(socket.into())
}

/// Write adapter that forwards every write to both a primary and a mirror
/// sink: the call succeeds or fails based on the primary alone; mirror
/// errors are swallowed.
struct TeeWriter<W1, W2> {
    primary: W1,
    mirror: W2,
}

impl<W1, W2> AsyncWrite for TeeWriter<W1, W2>
where
    W1: AsyncWrite + Unpin,
    W2: AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = match Pin::new(&mut this.primary).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => n,
            other => return other,
        };
        // Best-effort: a pending, short, or failed mirror write is dropped
        // on the floor, never surfaced to the caller.
        let _ = Pin::new(&mut this.mirror).poll_write(cx, &buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let _ = Pin::new(&mut this.mirror).poll_flush(cx);
        Pin::new(&mut this.primary).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let _ = Pin::new(&mut this.mirror).poll_shutdown(cx);
        Pin::new(&mut this.primary).poll_shutdown(cx)
    }
}

/// One named reverse-proxy server: a listener plus the targets and optional
/// mirror it forwards accepted connections to.
pub struct Proxy {
    name: String,
    server_tls: ServerTlsContext,
    cfg: ServerConfig,
    metrics: Arc<dyn MetricsSink>,
    state: AtomicU8,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl Proxy {
    /// Build a `Proxy` from its validated [`ServerConfig`], constructing
    /// the listener-side TLS context up front so startup errors surface
    /// before `run()` binds a socket.
    pub fn new(cfg: ServerConfig, metrics: Arc<dyn MetricsSink>) -> Result<Self, ProxyError> {
        let server_tls = tls::build_server(cfg.listener.tls.as_ref())?;
        Ok(Proxy {
            name: cfg.name.clone(),
            server_tls,
            cfg,
            metrics,
            state: AtomicU8::new(ProxyState::Idle as u8),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ProxyState {
        ProxyState::from(self.state.load(Ordering::SeqCst))
    }

    /// Bind the reuse-port listener and enter the accept loop. Returns once
    /// the listener itself fails or shutdown is requested.
    pub async fn run(self: &Arc<Self>) -> Result<(), ProxyError> {
        let addr: SocketAddr = self.cfg.listener.addr().parse().map_err(|e| ProxyError::Listen {
            addr: self.cfg.listener.addr(),
            source: io::Error::new(io::ErrorKind::InvalidInput, format!("{e}")),
        })?;

        let std_listener = reuseport_listener(addr).map_err(|e| ProxyError::Listen {
            addr: self.cfg.listener.addr(),
            source: e,
        })?;
        let listener = TcpListener::from_std(std_listener).map_err(|e| ProxyError::Listen {
            addr: self.cfg.listener.addr(),
            source: e,
        })?;

        self.state.store(ProxyState::Listening as u8, Ordering::SeqCst);
        info!(server = %self.name, %addr, "listening");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((sock, _peer)) => self.accept_one(sock),
                        Err(e) => {
                            if self.cancel.is_cancelled() {
                                return Ok(());
                            }
                            self.metrics.downstream_conn_error(&self.name);
                            warn!(server = %self.name, error = %e, "accept failed");
                        }
                    }
                }
            }
        }
    }

    /// Signal the accept loop to stop, close the listener, and wait for
    /// every in-flight forwarding task. Idempotent.
    pub async fn shutdown(&self) {
        self.state.store(ProxyState::Draining as u8, Ordering::SeqCst);
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.state.store(ProxyState::Closed as u8, Ordering::SeqCst);
    }

    fn accept_one(self: &Arc<Self>, sock: TcpStream) {
        self.metrics.downstream_conn_active_inc(&self.name);
        self.metrics.downstream_conn_total(&self.name);

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            if let Err(e) = this.handle_connection(sock).await {
                if matches!(e, ProxyError::Tls(_)) {
                    this.metrics.downstream_conn_error(&this.name);
                }
                warn!(server = %this.name, error = %e, "connection ended with error");
            }
            this.metrics.downstream_conn_active_dec(&this.name);
        });
    }

    /// Apply the listener deadline, drive the TLS handshake when configured,
    /// then hand off to the forwarding task.
    async fn handle_connection(&self, sock: TcpStream) -> Result<(), ProxyError> {
        let peer_ip = sock.peer_addr().ok().map(|a| a.ip());
        let listener_timeout = self.cfg.listener.timeout_duration;

        let client_io: Io = match &self.server_tls {
            ServerTlsContext::Plain => Box::new(sock),
            ServerTlsContext::Tls(acceptor) => {
                let handshake = acceptor.accept(sock);
                let tls_stream = if listener_timeout.is_zero() {
                    handshake.await.map_err(|e| ProxyError::Tls(e.to_string()))?
                } else {
                    timeout(listener_timeout, handshake)
                        .await
                        .map_err(|_| ProxyError::Tls("handshake timed out".to_owned()))?
                        .map_err(|e| ProxyError::Tls(e.to_string()))?
                };

                self.check_remote_ip_san(&tls_stream, peer_ip)?;
                Box::new(tls_stream)
            }
        };

        self.forward(client_io, listener_timeout).await
    }

    /// Post-handshake re-verification of the client leaf's SAN against the
    /// peer's remote IP: rustls's `ClientCertVerifier` has no socket
    /// context, so this runs here instead of inside the verifier callback.
    fn check_remote_ip_san(
        &self,
        tls_stream: &tokio_rustls::server::TlsStream<TcpStream>,
        peer_ip: Option<IpAddr>,
    ) -> Result<(), ProxyError> {
        let Some(tls_cfg) = self.cfg.listener.tls.as_ref() else {
            return Ok(());
        };
        if tls_cfg.crl_path.is_none() {
            return Ok(());
        }
        let Some(ip) = peer_ip else {
            return Ok(());
        };
        let Some(peer_certs) = tls_stream.get_ref().1.peer_certificates() else {
            return Ok(());
        };
        let Some(leaf) = peer_certs.first() else {
            return Ok(());
        };

        if !crl::leaf_matches_remote_ip(leaf, ip)? {
            return Err(ProxyError::Tls(format!(
                "client certificate SAN does not match remote ip {ip}"
            )));
        }
        Ok(())
    }

    /// Forwarding task: shuffle targets, dial with failover, optionally
    /// mirror, and run the two copy directions until either side closes.
    async fn forward(&self, client_io: Io, listener_timeout: Duration) -> Result<(), ProxyError> {
        let mut targets = self.cfg.targets.clone();
        targets.shuffle(&mut rand::thread_rng());

        let (target_conn, chosen) = dial::dial_any(&targets, &self.name, self.metrics.as_ref()).await?;
        let target_host = chosen.host.clone();
        let target_port = chosen.port;
        let target_timeout = chosen.timeout_duration;

        self.metrics.upstream_conn_total(&target_host, target_port);
        self.metrics.upstream_conn_active_inc(&target_host, target_port);

        let mut mirror_timeout = Duration::ZERO;
        let mirror_conn = match &self.cfg.mirror {
            Some(mirror_hc) => match dial::dial(mirror_hc).await {
                Ok(conn) => {
                    mirror_timeout = mirror_hc.timeout_duration;
                    Some(conn)
                }
                Err(e) => {
                    self.metrics.mirror_dial_error(&mirror_hc.host, mirror_hc.port);
                    warn!(server = %self.name, error = %e, "mirror dial failed, continuing without it");
                    None
                }
            },
            None => None,
        };

        let force_close = target_timeout.is_zero() || (self.cfg.mirror.is_some() && mirror_timeout.is_zero());
        let cancel = force_close.then(|| self.cancel.child_token());

        let result = self
            .run_copies(
                client_io,
                target_conn.into_io(),
                mirror_conn.map(dial::Connection::into_io),
                listener_timeout,
                target_timeout,
                cancel,
            )
            .await;

        self.metrics.upstream_conn_active_dec(&target_host, target_port);

        if let Err(ProxyError::Copy(io_err)) = &result {
            if !ProxyError::is_benign_close(io_err) {
                self.metrics.upstream_conn_error(&target_host, target_port);
            }
        }

        result
    }

    /// Run both copy directions concurrently, tearing both down as soon as
    /// one completes.
    async fn run_copies(
        &self,
        client_io: Io,
        target_io: Io,
        mirror_io: Option<Io>,
        listener_timeout: Duration,
        target_timeout: Duration,
        cancel: Option<CancellationToken>,
    ) -> Result<(), ProxyError> {
        let (mut client_r, client_w) = tokio::io::split(client_io);
        let (mut target_r, target_w) = tokio::io::split(target_io);

        let client_to_upstream = async move {
            match mirror_io {
                Some(mirror) => {
                    let mut writer = TeeWriter { primary: target_w, mirror };
                    copy_with_deadline(&mut client_r, &mut writer, listener_timeout).await
                }
                None => {
                    let mut writer = target_w;
                    copy_with_deadline(&mut client_r, &mut writer, listener_timeout).await
                }
            }
        };

        let upstream_to_client = async move {
            let mut client_w = client_w;
            copy_with_deadline(&mut target_r, &mut client_w, target_timeout).await
        };

        tokio::pin!(client_to_upstream);
        tokio::pin!(upstream_to_client);

        let raced = async {
            tokio::select! {
                res = &mut client_to_upstream => res,
                res = &mut upstream_to_client => res,
            }
        };

        match cancel {
            Some(token) => {
                tokio::select! {
                    res = raced => res,
                    _ = token.cancelled() => Ok(()),
                }
            }
            None => raced.await,
        }
    }
}

async fn copy_with_deadline<R, W>(reader: &mut R, writer: &mut W, deadline: Duration) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let copy = tokio::io::copy(reader, writer);
    let result = if deadline.is_zero() {
        copy.await
    } else {
        match timeout(deadline, copy).await {
            Ok(res) => res,
            Err(_) => return Ok(()),
        }
    };

    match result {
        Ok(_) => Ok(()),
        Err(e) if ProxyError::is_benign_close(&e) => Ok(()),
        Err(e) => Err(ProxyError::Copy(e)),
    }
}
