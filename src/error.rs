//! Error taxonomy shared by the config loader, TLS builder, dialer, and
//! proxy engine. Categories are matched on by
//! callers to decide which metric to bump and whether a connection error is
//! benign.

use std::io;

use thiserror::Error;

/// Kinds of failure the engine distinguishes at runtime. These map to the
/// metric families in [`crate::metrics`] and to the log level a caller picks.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Schema violation or unparsable YAML, formatted as `[<section>] <detail>`.
    #[error("[{section}] {detail}")]
    Config { section: String, detail: String },

    /// Failure to bind a listener socket. Fatal at proxy startup.
    #[error("listen on {addr}: {source}")]
    Listen { addr: String, source: io::Error },

    /// A single target dial attempt failed; the dialer will try the next
    /// entry before surfacing [`ProxyError::NoBackends`].
    #[error("dial {host}:{port}: {source}")]
    Dial {
        host: String,
        port: u16,
        source: io::Error,
    },

    /// Every configured target failed to connect.
    #[error("[{server}] no backends could be reached")]
    NoBackends { server: String },

    /// TLS handshake or certificate verification failure.
    #[error("tls handshake: {0}")]
    Tls(String),

    /// CRL parsing or revocation check failure.
    #[error("{0}")]
    Crl(String),

    /// I/O error while copying bytes between endpoints.
    #[error("copy: {0}")]
    Copy(#[source] io::Error),
}

impl ProxyError {
    pub fn config(section: impl Into<String>, detail: impl Into<String>) -> Self {
        ProxyError::Config {
            section: section.into(),
            detail: detail.into(),
        }
    }

    /// True for the "use of closed network connection" family of errors
    /// that the copy loops must treat as benign rather than counting as an
    /// upstream error.
    pub fn is_benign_close(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
        ) || err.to_string().contains("closed")
    }
}
