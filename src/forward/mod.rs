//! Forwarding backend adapter
//!
//! The engine never touches sockets itself. It hands a [`Rule`] (and the
//! resolved [`Chain`], if any) to a [`ForwardBackend`], which returns a
//! bound, runnable [`ForwardService`]. The engine then drives the service's
//! serve loop, closes it on stop and polls it for statistics.
//!
//! [`RelayBackend`] is the built-in tokio implementation. Tests substitute
//! scripted backends to exercise the engine without the network.

mod copy;
pub mod http_connect;
mod relay;
pub mod socks5;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use copy::{relay, CopyResult, DEFAULT_BUFFER_SIZE};
pub use relay::RelayBackend;

use crate::error::{BackendError, ServeError};
use crate::logbuf::LogBuffer;
use crate::model::{Chain, Rule};
use crate::stats::{ServiceStats, StatsObserver};

/// Shared sinks handed to every service a backend builds
#[derive(Clone)]
pub struct BuildContext {
    /// Receives cumulative per-service traffic events, keyed by rule id
    pub observer: Arc<StatsObserver>,
    /// User-facing log ring
    pub logs: Arc<LogBuffer>,
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext").finish_non_exhaustive()
    }
}

/// A bound, runnable forwarding service for one rule
#[async_trait]
pub trait ForwardService: Send + Sync {
    /// Run the accept loop until `cancel` fires or the service is closed
    ///
    /// Returns `Ok(())` when cancelled, [`ServeError::Closed`] after
    /// [`close`](Self::close), and any other [`ServeError`] on failure.
    async fn serve(&self, cancel: CancellationToken) -> Result<(), ServeError>;

    /// Close the listener; idempotent
    ///
    /// # Errors
    ///
    /// Returns an error if releasing the listener failed.
    fn close(&self) -> Result<(), BackendError>;

    /// Cumulative traffic snapshot
    fn stats(&self) -> ServiceStats;

    /// Report the current snapshot to `observer` under `rule_id`
    ///
    /// Services that also publish on their own must take the snapshot and
    /// deliver it atomically with respect to their other publishes, their
    /// [`reset_stats`](Self::reset_stats) and [`close`](Self::close). A
    /// closed service publishes nothing.
    fn publish_stats(&self, rule_id: &str, observer: &StatsObserver) {
        observer.observe_one(rule_id, self.stats());
    }

    /// Zero cumulative counters, keeping the live connection count
    fn reset_stats(&self) {}

    /// Bound listen address, if known
    fn listen_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// Factory turning rules into services
pub trait ForwardBackend: Send + Sync {
    /// Build and bind a service for `rule`
    ///
    /// # Errors
    ///
    /// Returns [`BackendError`] if the rule cannot be served or the listener
    /// cannot bind. No service is registered in that case.
    fn build(
        &self,
        rule: &Rule,
        chain: Option<&Chain>,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn ForwardService>, BackendError>;
}

/// Address a connection should reach
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Destination {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Destination {
    /// Build from host and port, recognising IP literals
    #[must_use]
    pub fn new(host: &str, port: u16) -> Self {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        match bare.parse() {
            Ok(ip) => Self::Ip(SocketAddr::new(ip, port)),
            Err(_) => Self::Domain(bare.to_string(), port),
        }
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Domain(_, port) => *port,
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl FromStr for Destination {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::Ip(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| BackendError::invalid(format!("address without port: {s}")))?;
        if host.is_empty() {
            return Err(BackendError::invalid(format!("address without host: {s}")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| BackendError::invalid(format!("invalid port in address: {s}")))?;
        Ok(Self::new(host, port))
    }
}

/// Per-service atomic traffic counters
#[derive(Debug, Default)]
pub struct TrafficCounters {
    pub total_conns: AtomicU64,
    pub current_conns: AtomicU64,
    pub input_bytes: AtomicU64,
    pub output_bytes: AtomicU64,
    pub total_errs: AtomicU64,
}

impl TrafficCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_connection(&self) {
        self.total_conns.fetch_add(1, Ordering::Relaxed);
        self.current_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn close_connection(&self) {
        // saturating: a reset between open and close must not wrap
        let _ = self
            .current_conns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
    }

    pub fn record_error(&self) {
        self.total_errs.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> ServiceStats {
        ServiceStats {
            total_conns: self.total_conns.load(Ordering::Relaxed),
            current_conns: self.current_conns.load(Ordering::Relaxed),
            input_bytes: self.input_bytes.load(Ordering::Relaxed),
            output_bytes: self.output_bytes.load(Ordering::Relaxed),
            total_errs: self.total_errs.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.total_conns.store(0, Ordering::Relaxed);
        self.input_bytes.store(0, Ordering::Relaxed);
        self.output_bytes.store(0, Ordering::Relaxed);
        self.total_errs.store(0, Ordering::Relaxed);
    }
}
