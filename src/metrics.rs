//! Thin abstraction over named counters and gauges.
//!
//! The engine and dialer depend on [`MetricsSink`], not on the `metrics`
//! facade directly, so a process constructs one concrete sink at startup and
//! passes it down by dependency injection, rather than reaching for
//! module-level static registers.

use std::sync::Arc;

/// Counter and gauge events the proxy engine and dialer publish.
///
/// Every `*_active` increment on a successful path is matched by exactly one
/// decrement on every termination path of the forwarding task.
pub trait MetricsSink: Send + Sync {
    fn downstream_conn_total(&self, server: &str);
    fn downstream_conn_error(&self, server: &str);
    fn downstream_conn_active_inc(&self, server: &str);
    fn downstream_conn_active_dec(&self, server: &str);

    fn upstream_conn_total(&self, host: &str, port: u16);
    fn upstream_conn_error(&self, host: &str, port: u16);
    fn upstream_conn_active_inc(&self, host: &str, port: u16);
    fn upstream_conn_active_dec(&self, host: &str, port: u16);

    fn upstream_dial_error(&self, host: &str, port: u16);
    fn mirror_dial_error(&self, host: &str, port: u16);
}

/// Default sink: publishes through the global `metrics` facade recorder, the
/// same one the optional `/metrics` HTTP endpoint exports from.
#[derive(Clone, Default)]
pub struct Registry;

impl Registry {
    pub fn sink() -> Arc<dyn MetricsSink> {
        Arc::new(Registry)
    }
}

impl MetricsSink for Registry {
    fn downstream_conn_total(&self, server: &str) {
        metrics::counter!("downstream_conn_total", "name" => server.to_owned()).increment(1);
    }

    fn downstream_conn_error(&self, server: &str) {
        metrics::counter!("downstream_conn_error", "name" => server.to_owned()).increment(1);
    }

    fn downstream_conn_active_inc(&self, server: &str) {
        metrics::gauge!("downstream_conn_active", "name" => server.to_owned()).increment(1);
    }

    fn downstream_conn_active_dec(&self, server: &str) {
        metrics::gauge!("downstream_conn_active", "name" => server.to_owned()).decrement(1);
    }

    fn upstream_conn_total(&self, host: &str, port: u16) {
        metrics::counter!("upstream_conn_total", "host" => host.to_owned(), "port" => port.to_string())
            .increment(1);
    }

    fn upstream_conn_error(&self, host: &str, port: u16) {
        metrics::counter!("upstream_conn_error", "host" => host.to_owned(), "port" => port.to_string())
            .increment(1);
    }

    fn upstream_conn_active_inc(&self, host: &str, port: u16) {
        metrics::gauge!("upstream_conn_active", "host" => host.to_owned(), "port" => port.to_string())
            .increment(1);
    }

    fn upstream_conn_active_dec(&self, host: &str, port: u16) {
        metrics::gauge!("upstream_conn_active", "host" => host.to_owned(), "port" => port.to_string())
            .decrement(1);
    }

    fn upstream_dial_error(&self, host: &str, port: u16) {
        metrics::counter!("upstream_dial_error", "host" => host.to_owned(), "port" => port.to_string())
            .increment(1);
    }

    fn mirror_dial_error(&self, host: &str, port: u16) {
        metrics::counter!("mirror_dial_error", "host" => host.to_owned(), "port" => port.to_string())
            .increment(1);
    }
}

/// No-op sink, useful for tests that don't want to install a global
/// recorder.
#[derive(Clone, Default)]
pub struct NullSink;

impl NullSink {
    pub fn sink() -> Arc<dyn MetricsSink> {
        Arc::new(NullSink)
    }
}

impl MetricsSink for NullSink {
    fn downstream_conn_total(&self, _server: &str) {}
    fn downstream_conn_error(&self, _server: &str) {}
    fn downstream_conn_active_inc(&self, _server: &str) {}
    fn downstream_conn_active_dec(&self, _server: &str) {}
    fn upstream_conn_total(&self, _host: &str, _port: u16) {}
    fn upstream_conn_error(&self, _host: &str, _port: u16) {}
    fn upstream_conn_active_inc(&self, _host: &str, _port: u16) {}
    fn upstream_conn_active_dec(&self, _host: &str, _port: u16) {}
    fn upstream_dial_error(&self, _host: &str, _port: u16) {}
    fn mirror_dial_error(&self, _host: &str, _port: u16) {}
}
