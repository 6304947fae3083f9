//! Built-in TCP relay backend
//!
//! Serves forward/reverse rules as plain TCP relays to weighted targets and
//! chain rules with protocol `socks5` as a SOCKS5 CONNECT server. Upstream
//! connections optionally traverse a chain of SOCKS5 / HTTP CONNECT hops.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    copy, http_connect, socks5, BuildContext, Destination, ForwardBackend, ForwardService,
    TrafficCounters,
};
use crate::error::{BackendError, ServeError};
use crate::logbuf::{LogBuffer, LogLevel};
use crate::model::{Auth, Chain, Protocol, Rule, RuleType};
use crate::stats::{ServiceStats, StatsObserver};

/// Pause after a non-fatal accept error (e.g. EMFILE) before retrying
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Factory for [`RelayService`]s
#[derive(Debug, Clone)]
pub struct RelayBackend {
    connect_timeout: Duration,
}

impl RelayBackend {
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for RelayBackend {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ForwardBackend for RelayBackend {
    fn build(
        &self,
        rule: &Rule,
        chain: Option<&Chain>,
        ctx: &BuildContext,
    ) -> Result<Arc<dyn ForwardService>, BackendError> {
        if matches!(rule.protocol, Protocol::Udp | Protocol::Ss) {
            return Err(BackendError::unsupported(format!(
                "protocol {} is not supported by the relay backend",
                rule.protocol
            )));
        }
        if rule.tls.as_ref().is_some_and(|tls| tls.enabled) {
            return Err(BackendError::unsupported("TLS listeners are not supported"));
        }

        let mode = if rule.protocol == Protocol::Socks5 {
            Mode::Socks5 {
                auth: rule.auth.clone(),
            }
        } else {
            let targets = rule
                .effective_targets()
                .into_iter()
                .map(|t| (Destination::new(&t.host, t.port), t.weight))
                .collect::<Vec<_>>();
            if targets.is_empty() {
                let reason = if rule.rule_type == RuleType::Chain {
                    "chain rule without targets needs protocol socks5"
                } else {
                    "rule has no targets"
                };
                return Err(BackendError::invalid(reason));
            }
            Mode::Relay(Balancer::new(targets))
        };

        let dialer = Dialer::new(chain, self.connect_timeout)?;

        let addr = rule.listen_addr();
        let listener = std::net::TcpListener::bind(addr).map_err(|e| BackendError::Bind {
            addr: addr.to_string(),
            source: e,
        })?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        debug!(rule_id = %rule.id, "relay bound on {}", local_addr);

        Ok(Arc::new(RelayService {
            listener: Mutex::new(Some(listener)),
            local_addr,
            closed: CancellationToken::new(),
            shared: Arc::new(Shared {
                rule_id: rule.id.clone(),
                rule_name: rule.name.clone(),
                mode,
                dialer,
                counters: TrafficCounters::new(),
                retired: Mutex::new(false),
                observer: Arc::clone(&ctx.observer),
                logs: Arc::clone(&ctx.logs),
            }),
        }))
    }
}

enum Mode {
    Relay(Balancer),
    Socks5 { auth: Option<Auth> },
}

/// Smooth weighted round-robin over the rule's targets
struct Balancer {
    targets: Vec<Destination>,
    weights: Vec<i64>,
    current: Mutex<Vec<i64>>,
}

impl Balancer {
    fn new(targets: Vec<(Destination, u32)>) -> Self {
        let weights = targets
            .iter()
            .map(|(_, w)| i64::from((*w).max(1)))
            .collect::<Vec<_>>();
        Self {
            current: Mutex::new(vec![0; targets.len()]),
            targets: targets.into_iter().map(|(d, _)| d).collect(),
            weights,
        }
    }

    fn next(&self) -> &Destination {
        if self.targets.len() == 1 {
            return &self.targets[0];
        }
        let total: i64 = self.weights.iter().sum();
        let mut current = self.current.lock();
        let mut best = 0;
        for (i, weight) in self.weights.iter().enumerate() {
            current[i] += weight;
            if current[i] > current[best] {
                best = i;
            }
        }
        current[best] -= total;
        &self.targets[best]
    }
}

struct HopSpec {
    addr: Destination,
    protocol: Protocol,
    auth: Option<Auth>,
}

/// Dials upstream, directly or through the chain's hops in order
struct Dialer {
    hops: Vec<HopSpec>,
    connect_timeout: Duration,
}

impl Dialer {
    fn new(chain: Option<&Chain>, connect_timeout: Duration) -> Result<Self, BackendError> {
        let mut hops = Vec::new();
        for hop in chain.map(|c| c.hops.as_slice()).unwrap_or_default() {
            if hop.tls.as_ref().is_some_and(|tls| tls.enabled) {
                return Err(BackendError::unsupported(format!(
                    "TLS hop {} is not supported",
                    hop.addr
                )));
            }
            if !matches!(hop.protocol, Protocol::Socks5 | Protocol::Http) {
                return Err(BackendError::unsupported(format!(
                    "hop protocol {} is not supported",
                    hop.protocol
                )));
            }
            hops.push(HopSpec {
                addr: hop.addr.parse()?,
                protocol: hop.protocol,
                auth: hop.auth.clone(),
            });
        }
        Ok(Self {
            hops,
            connect_timeout,
        })
    }

    async fn dial(&self, dest: &Destination) -> io::Result<TcpStream> {
        match timeout(self.connect_timeout, self.dial_inner(dest)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {dest} timed out after {:?}", self.connect_timeout),
            )),
        }
    }

    async fn dial_inner(&self, dest: &Destination) -> io::Result<TcpStream> {
        let Some(first) = self.hops.first() else {
            let stream = connect_tcp(dest).await?;
            stream.set_nodelay(true)?;
            return Ok(stream);
        };

        let mut stream = connect_tcp(&first.addr).await?;
        stream.set_nodelay(true)?;
        for (i, hop) in self.hops.iter().enumerate() {
            let next = self.hops.get(i + 1).map_or(dest, |h| &h.addr);
            match hop.protocol {
                Protocol::Http => http_connect::connect(&mut stream, next, hop.auth.as_ref()).await?,
                _ => socks5::connect(&mut stream, next, hop.auth.as_ref()).await?,
            }
        }
        Ok(stream)
    }
}

async fn connect_tcp(dest: &Destination) -> io::Result<TcpStream> {
    match dest {
        Destination::Ip(addr) => TcpStream::connect(addr).await,
        Destination::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    }
}

struct Shared {
    rule_id: String,
    rule_name: String,
    mode: Mode,
    dialer: Dialer,
    counters: TrafficCounters,
    /// Held across snapshot and delivery; `true` once the service is closed
    retired: Mutex<bool>,
    observer: Arc<StatsObserver>,
    logs: Arc<LogBuffer>,
}

impl Shared {
    fn publish(&self) {
        self.publish_to(&self.rule_id, &self.observer);
    }

    fn publish_to(&self, rule_id: &str, observer: &StatsObserver) {
        let retired = self.retired.lock();
        if *retired {
            return;
        }
        observer.observe_one(rule_id, self.counters.snapshot());
    }

    fn reset(&self) {
        let _gate = self.retired.lock();
        self.counters.reset();
    }

    fn retire(&self) {
        *self.retired.lock() = true;
    }

    async fn handle(&self, mut client: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        self.counters.open_connection();
        self.publish();

        let _ = client.set_nodelay(true);
        let client_label = peer.to_string();

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!(rule_id = %self.rule_id, "connection from {} cancelled", peer);
            }
            result = self.proxy(&mut client, &client_label) => {
                if let Err(e) = result {
                    self.counters.record_error();
                    debug!(rule_id = %self.rule_id, "connection from {} failed: {}", peer, e);
                    self.logs.add(
                        LogLevel::Warn,
                        &self.rule_id,
                        &self.rule_name,
                        format!("Connection failed: {client_label}"),
                        Some(e.to_string()),
                    );
                }
            }
        }

        self.counters.close_connection();
        self.publish();
    }

    async fn proxy(&self, client: &mut TcpStream, client_label: &str) -> io::Result<()> {
        let (dest, mut upstream) = match &self.mode {
            Mode::Relay(balancer) => {
                let dest = balancer.next().clone();
                let upstream = self.dialer.dial(&dest).await?;
                (dest, upstream)
            }
            Mode::Socks5 { auth } => {
                let dest = socks5::accept(client, auth.as_ref()).await?;
                match self.dialer.dial(&dest).await {
                    Ok(upstream) => {
                        socks5::send_reply(client, socks5::REPLY_SUCCEEDED).await?;
                        (dest, upstream)
                    }
                    Err(e) => {
                        let _ = socks5::send_reply(client, socks5::reply_for_error(&e)).await;
                        return Err(e);
                    }
                }
            }
        };

        self.logs
            .log_connection(&self.rule_id, &self.rule_name, client_label, &dest.to_string());

        let result = copy::relay(
            client,
            &mut upstream,
            &self.counters.input_bytes,
            &self.counters.output_bytes,
        )
        .await?;

        self.logs.log_disconnection(
            &self.rule_id,
            &self.rule_name,
            client_label,
            result.client_to_upstream,
            result.upstream_to_client,
        );
        Ok(())
    }
}

/// One bound relay listener
pub struct RelayService {
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: SocketAddr,
    closed: CancellationToken,
    shared: Arc<Shared>,
}

#[async_trait]
impl ForwardService for RelayService {
    async fn serve(&self, cancel: CancellationToken) -> Result<(), ServeError> {
        let std_listener = self.listener.lock().take().ok_or(ServeError::Closed)?;
        let listener = TcpListener::from_std(std_listener).map_err(ServeError::Bind)?;

        info!(rule_id = %self.shared.rule_id, "serving on {}", self.local_addr);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                () = self.closed.cancelled() => return Err(ServeError::Closed),
                result = listener.accept() => match result {
                    Ok((stream, peer)) => {
                        let shared = Arc::clone(&self.shared);
                        let conn_cancel = cancel.child_token();
                        tokio::spawn(async move {
                            shared.handle(stream, peer, conn_cancel).await;
                        });
                    }
                    Err(e) => {
                        let err = ServeError::Accept(e);
                        if err.is_fatal() {
                            return Err(err);
                        }
                        self.shared.counters.record_error();
                        warn!(rule_id = %self.shared.rule_id, "{}", err);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }
    }

    fn close(&self) -> Result<(), BackendError> {
        self.shared.retire();
        self.closed.cancel();
        self.listener.lock().take();
        Ok(())
    }

    fn stats(&self) -> ServiceStats {
        self.shared.counters.snapshot()
    }

    fn publish_stats(&self, rule_id: &str, observer: &StatsObserver) {
        self.shared.publish_to(rule_id, observer);
    }

    fn reset_stats(&self) {
        self.shared.reset();
    }

    fn listen_addr(&self) -> Option<SocketAddr> {
        Some(self.local_addr)
    }
}
