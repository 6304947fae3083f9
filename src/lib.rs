//! portwarden: control plane for port-forwarding rules
//!
//! This crate manages forwarding rules (direct port forwards, reverse
//! proxies and multi-hop proxy chains) and runs them either inside the
//! calling process or inside a background daemon. Callers issue the same
//! operations in both cases through [`ServiceController`].
//!
//! # Features
//!
//! - **Rule lifecycle**: start/stop/restart with typed runtime failure
//!   classification and a status-event channel
//! - **Statistics and logs**: lock-free counters polled from running
//!   services, plus a bounded log ring for UI polling
//! - **Dual-mode control**: [`LocalController`] embeds the engine,
//!   [`RemoteController`] talks to a daemon over IPC
//! - **IPC**: length-prefixed JSON over a Unix socket, or TCP loopback with
//!   port-file discovery on Windows
//! - **Single instance**: OS lock plus a wake-up side channel
//!
//! # Architecture
//!
//! ```text
//! CLI / GUI ──► ServiceController ──┬─► LocalController ──► Engine ──► ForwardBackend
//!                                   │        │
//!                                   │        └─► Store (data.json)
//!                                   └─► RemoteController ──► IPC ──► Daemon
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use portwarden::config::Settings;
//! use portwarden::controller::connect_or_embed;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::default();
//! let handle = connect_or_embed(&settings).await?;
//!
//! for rule in handle.controller.get_rules().await? {
//!     println!("{} [{}]", rule.name, rule.status);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Process settings and loading
//! - [`controller`]: Controller trait and its local/remote implementations
//! - [`daemon`]: Background service composition
//! - [`engine`]: Rule-lifecycle supervisor
//! - [`error`]: Error types
//! - [`forward`]: Forwarding backend traits and the built-in relay
//! - [`instance`]: Single-instance lock and wake-up channel
//! - [`ipc`]: IPC protocol, transport, server and client
//! - [`logbuf`]: Bounded log ring
//! - [`model`]: Rule, chain and config records
//! - [`stats`]: Traffic statistics
//! - [`store`]: JSON-file persistence

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod controller;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod forward;
pub mod instance;
pub mod ipc;
pub mod logbuf;
pub mod model;
pub mod stats;
pub mod store;

// Re-export commonly used types at the crate root
pub use config::{load_settings_with_env, Settings};
pub use controller::{
    connect_or_embed, ControllerHandle, ControllerMode, InitReport, LocalController,
    RemoteController, ServiceController,
};
pub use daemon::Daemon;
pub use engine::{Engine, StatusEvent};
pub use error::{
    BackendError, ConfigError, ControllerError, EngineError, InstanceError, IpcError,
    PortwardenError, ServeError, StoreError, ValidationError,
};
pub use forward::{ForwardBackend, ForwardService, RelayBackend};
pub use instance::Instance;
pub use ipc::{IpcClient, IpcCommand, IpcResponse, IpcServer};
pub use logbuf::{LogBuffer, LogEntry, LogLevel};
pub use model::{AppConfig, AppData, Chain, Hop, Rule, RuleStatus, RuleType};
pub use stats::{RuleStats, StatsTracker};
pub use store::Store;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
