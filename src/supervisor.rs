//! Supervisor: owns a named map of [`Proxy`] engines, starts them,
//! reacts to OS signals, and performs an atomic swap of the whole map on
//! reload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::metrics::MetricsSink;
use crate::proxy::Proxy;

type ProxyMap = HashMap<String, Arc<Proxy>>;

/// Notifies the supervising init system that the service is ready, once,
/// after every proxy is bound. No-op unless the process runs under
/// an init system that expects this (e.g. systemd's `sd_notify`); kept as
/// an explicit seam rather than a hidden global so tests can swap it out.
pub trait ReadinessNotifier: Send + Sync {
    fn ready(&self) {}
}

#[derive(Default)]
pub struct NoopReadiness;
impl ReadinessNotifier for NoopReadiness {}

/// Runs every configured server, owns the `name -> Proxy` map, and drives
/// reload/shutdown from OS signals.
pub struct Supervisor {
    config_path: Option<PathBuf>,
    metrics: Arc<dyn MetricsSink>,
    proxies: Mutex<ProxyMap>,
    readiness: Arc<dyn ReadinessNotifier>,
}

async fn start_all(config: &Config, metrics: Arc<dyn MetricsSink>) -> anyhow::Result<ProxyMap> {
    let mut map = ProxyMap::new();
    for server in &config.servers {
        let proxy = Arc::new(Proxy::new(server.clone(), Arc::clone(&metrics))?);
        let handle = Arc::clone(&proxy);
        tokio::spawn(async move {
            if let Err(e) = handle.run().await {
                error!(server = %handle.name(), error = %e, "proxy exited with error");
            }
        });
        map.insert(server.name.clone(), proxy);
    }
    Ok(map)
}

impl Supervisor {
    pub fn new(config_path: Option<PathBuf>, metrics: Arc<dyn MetricsSink>) -> Self {
        Supervisor {
            config_path,
            metrics,
            proxies: Mutex::new(ProxyMap::new()),
            readiness: Arc::new(NoopReadiness),
        }
    }

    pub fn with_readiness(mut self, readiness: Arc<dyn ReadinessNotifier>) -> Self {
        self.readiness = readiness;
        self
    }

    /// Start one Proxy per configured server.
    pub async fn start(&self, config: &Config) -> anyhow::Result<()> {
        let map = start_all(config, Arc::clone(&self.metrics)).await?;
        *self.proxies.lock().await = map;
        self.readiness.ready();
        Ok(())
    }

    /// Drive the supervisor until a terminating signal arrives, handling
    /// `USR1`/`USR2` reloads in between.
    pub async fn run_until_shutdown(&self) -> anyhow::Result<()> {
        let mut term = signal(SignalKind::terminate())?;
        let mut int = signal(SignalKind::interrupt())?;
        let mut quit = signal(SignalKind::quit())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        let mut usr2 = signal(SignalKind::user_defined2())?;

        loop {
            tokio::select! {
                _ = term.recv() => { info!("received SIGTERM, shutting down"); break; }
                _ = int.recv() => { info!("received SIGINT, shutting down"); break; }
                _ = quit.recv() => { info!("received SIGQUIT, shutting down"); break; }
                _ = usr1.recv() => { self.reload().await; }
                _ = usr2.recv() => { self.reload().await; }
            }
        }

        self.shutdown_all().await;
        Ok(())
    }

    /// Re-read the config file; on failure, log and keep
    /// running the current set. Otherwise build a fresh map, swap it in
    /// under the mutex, and drain the old map outside the mutex.
    ///
    /// Public so the reload path can be driven directly (tests, an admin
    /// API) as well as from `USR1`/`USR2`.
    pub async fn reload(&self) {
        let Some(path) = &self.config_path else {
            warn!("reload requested but process is running in ad-hoc mode; ignoring");
            return;
        };

        let config = match Config::load(path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "reload failed: invalid config, keeping current proxies running");
                return;
            }
        };

        let new_map = match start_all(&config, Arc::clone(&self.metrics)).await {
            Ok(m) => m,
            Err(e) => {
                error!(error = %e, "reload failed: could not start new proxy set");
                return;
            }
        };

        let old_map = {
            let mut guard = self.proxies.lock().await;
            std::mem::replace(&mut *guard, new_map)
        };

        for (name, proxy) in old_map {
            info!(server = %name, "draining old listener after reload");
            proxy.shutdown().await;
        }
    }

    /// Shut down every currently running proxy (`TERM`/`INT`/`QUIT`).
    pub async fn shutdown_all(&self) {
        let map = {
            let mut guard = self.proxies.lock().await;
            std::mem::take(&mut *guard)
        };
        for (_, proxy) in map {
            proxy.shutdown().await;
        }
    }
}
