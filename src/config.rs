//! Typed configuration. Parsing is `serde_yaml` over the schema
//! below; validation turns the raw, partially-optional fields into the
//! invariants the rest of the crate relies on (non-empty target lists,
//! literal listener IPs, a `mode` that is absent/simple/mutual, …).

use std::fs;
use std::net::IpAddr;
use std::path::Path;

use serde::Deserialize;

use crate::error::ProxyError;

/// TLS mode for a [`HostConfig`]. Absence of this field means plain TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    Simple,
    Mutual,
}

/// A subject alternative name, classified by shape on load (contains
/// `://` → URI; matches an IP literal → IP address; otherwise → DNS).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Ip(IpAddr),
    Uri(String),
    Dns(String),
}

fn classify_san(raw: &str) -> SubjectAltName {
    if raw.contains("://") {
        SubjectAltName::Uri(raw.to_owned())
    } else if let Ok(ip) = raw.parse::<IpAddr>() {
        SubjectAltName::Ip(ip)
    } else {
        SubjectAltName::Dns(raw.to_owned())
    }
}

/// Raw YAML shape for a TLS block, deserialized as written by the operator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawTlsConfig {
    #[serde(rename = "caCert")]
    pub ca_cert: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub crl: Option<String>,
    pub mode: Option<TlsMode>,
    pub sni: Option<String>,
    #[serde(rename = "subjectAltNames", default)]
    pub subject_alt_names: Vec<String>,
}

/// Validated TLS configuration. Immutable once built by
/// [`TlsConfig::from_raw`].
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    pub ca_cert_path: Option<String>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    pub crl_path: Option<String>,
    pub mode: Option<TlsMode>,
    pub sni: Option<String>,
    pub subject_alt_names: Vec<SubjectAltName>,
    pub role_is_server: bool,
}

impl TlsConfig {
    /// `true` when no TLS fields were set at all — the caller should use
    /// plain TCP.
    pub fn is_absent(&self) -> bool {
        self.ca_cert_path.is_none()
            && self.cert_path.is_none()
            && self.key_path.is_none()
            && self.mode.is_none()
    }

    fn from_raw(raw: RawTlsConfig, section: &str, role_is_server: bool) -> Result<Self, ProxyError> {
        let any_set = raw.ca_cert.is_some() || raw.cert.is_some() || raw.key.is_some();
        if any_set && raw.mode.is_none() {
            return Err(ProxyError::config(
                section,
                "mode must be one of \"simple\" or \"mutual\" when caCert/cert/key is set",
            ));
        }
        if raw.mode == Some(TlsMode::Mutual)
            && (raw.ca_cert.is_none() || raw.cert.is_none() || raw.key.is_none())
        {
            return Err(ProxyError::config(
                section,
                "mode=mutual requires caCert, cert and key",
            ));
        }

        Ok(TlsConfig {
            ca_cert_path: raw.ca_cert,
            cert_path: raw.cert,
            key_path: raw.key,
            crl_path: raw.crl,
            mode: raw.mode,
            sni: raw.sni,
            subject_alt_names: raw.subject_alt_names.iter().map(|s| classify_san(s)).collect(),
            role_is_server,
        })
    }
}

/// Raw YAML shape for a listener/target/mirror entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RawHostConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_timeout")]
    pub timeout: i64,
    #[serde(rename = "tlsConfig", default)]
    pub tls_config: Option<RawTlsConfig>,
}

fn default_timeout() -> i64 {
    300
}

/// A validated host endpoint: listener, target, or mirror.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub host: String,
    pub port: u16,
    /// `Duration::ZERO` means "no deadline"; never coerced to a nonzero
    /// value by the engine.
    pub timeout_duration: std::time::Duration,
    pub tls: Option<TlsConfig>,
}

impl HostConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn from_raw(
        raw: RawHostConfig,
        section: &str,
        require_literal_ip: bool,
        role_is_server: bool,
    ) -> Result<Self, ProxyError> {
        if raw.host.is_empty() {
            return Err(ProxyError::config(section, format!("host in {section} not specified")));
        }
        if require_literal_ip && raw.host.parse::<IpAddr>().is_err() {
            return Err(ProxyError::config(
                section,
                format!("host in {section} must be a literal IP address"),
            ));
        }
        if raw.port == 0 {
            return Err(ProxyError::config(section, format!("port in {section} out of range 1..65535")));
        }
        if raw.timeout < 0 {
            return Err(ProxyError::config(section, format!("timeout in {section} must be non-negative")));
        }

        let tls = match raw.tls_config {
            Some(t) => {
                let built = TlsConfig::from_raw(t, section, role_is_server)?;
                if built.is_absent() {
                    None
                } else {
                    Some(built)
                }
            }
            None => None,
        };

        Ok(HostConfig {
            host: raw.host,
            port: raw.port,
            timeout_duration: std::time::Duration::from_secs(raw.timeout as u64),
            tls,
        })
    }
}

/// Raw YAML shape for one `servers[]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RawServerConfig {
    pub name: String,
    pub listener: RawHostConfig,
    pub targets: Vec<RawHostConfig>,
    pub mirror: Option<RawHostConfig>,
}

/// A validated server: one listener, an ordered non-empty target pool, and
/// an optional mirror.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub listener: HostConfig,
    pub targets: Vec<HostConfig>,
    pub mirror: Option<HostConfig>,
}

impl ServerConfig {
    fn from_raw(raw: RawServerConfig) -> Result<Self, ProxyError> {
        if raw.name.is_empty() {
            return Err(ProxyError::config("server", "name not specified"));
        }
        let listener_section = format!("servers.{}.listener", raw.name);
        let listener = HostConfig::from_raw(raw.listener, &listener_section, true, true)?;

        if raw.targets.is_empty() {
            return Err(ProxyError::config(
                format!("servers.{}", raw.name),
                "targets must not be empty",
            ));
        }
        let targets = raw
            .targets
            .into_iter()
            .enumerate()
            .map(|(i, t)| {
                HostConfig::from_raw(t, &format!("servers.{}.targets.[{i}]", raw.name), false, false)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mirror = raw
            .mirror
            .map(|m| HostConfig::from_raw(m, &format!("servers.{}.mirror", raw.name), false, false))
            .transpose()?;

        Ok(ServerConfig {
            name: raw.name,
            listener,
            targets,
            mirror,
        })
    }
}

/// Raw top-level YAML document.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub servers: Vec<RawServerConfig>,
    pub metrics: Option<RawHostConfig>,
}

/// Fully validated top-level configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub servers: Vec<ServerConfig>,
    pub metrics: Option<HostConfig>,
}

impl Config {
    /// Parse and validate a YAML document. All rules below are fatal here.
    pub fn from_yaml(yaml: &str) -> Result<Self, ProxyError> {
        let raw: RawConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ProxyError::config("config", format!("invalid YAML: {e}")))?;
        Self::from_raw(raw)
    }

    pub fn load(path: &Path) -> Result<Self, ProxyError> {
        let yaml = fs::read_to_string(path)
            .map_err(|e| ProxyError::config("config", format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&yaml)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ProxyError> {
        if raw.servers.is_empty() {
            return Err(ProxyError::config("server", "at least one server must be configured"));
        }

        let mut names = std::collections::HashSet::new();
        let mut servers = Vec::with_capacity(raw.servers.len());
        for rs in raw.servers {
            let name = rs.name.clone();
            let server = ServerConfig::from_raw(rs)?;
            if !names.insert(name.clone()) {
                return Err(ProxyError::config("server", format!("duplicate server name {name}")));
            }
            servers.push(server);
        }

        let metrics = raw
            .metrics
            .map(|m| HostConfig::from_raw(m, "metrics", false, true))
            .transpose()?;

        if let Some(ref m) = metrics {
            if servers.iter().any(|s| s.listener.port == m.port) {
                return Err(ProxyError::config(
                    "metrics",
                    "metrics port must not equal any listener port",
                ));
            }
        }

        Ok(Config { servers, metrics })
    }

    /// Build a single-server config from the ad-hoc CLI flags: a
    /// standalone mode that bypasses YAML entirely.
    pub fn from_cli_flags(listener: &str, targets: &str, metrics: Option<&str>) -> Result<Self, ProxyError> {
        let (host, port) = split_host_port(listener, "--listener")?;
        let listener = HostConfig {
            host,
            port,
            timeout_duration: std::time::Duration::from_secs(300),
            tls: None,
        };

        let targets = targets
            .split(',')
            .map(|t| {
                let (host, port) = split_host_port(t, "--target")?;
                Ok(HostConfig {
                    host,
                    port,
                    timeout_duration: std::time::Duration::from_secs(300),
                    tls: None,
                })
            })
            .collect::<Result<Vec<_>, ProxyError>>()?;
        if targets.is_empty() {
            return Err(ProxyError::config("cli", "--target must name at least one host:port"));
        }

        let metrics = metrics
            .map(|m| {
                let (host, port) = split_host_port(m, "--metrics")?;
                Ok::<_, ProxyError>(HostConfig {
                    host,
                    port,
                    timeout_duration: std::time::Duration::from_secs(300),
                    tls: None,
                })
            })
            .transpose()?;

        Ok(Config {
            servers: vec![ServerConfig {
                name: "cli".to_owned(),
                listener,
                targets,
                mirror: None,
            }],
            metrics,
        })
    }
}

fn split_host_port(s: &str, flag: &str) -> Result<(String, u16), ProxyError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| ProxyError::config("cli", format!("{flag} expects host:port, got {s}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| ProxyError::config("cli", format!("{flag} has an invalid port in {s}")))?;
    Ok((host.to_owned(), port))
}
