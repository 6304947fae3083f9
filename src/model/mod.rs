//! Data model shared by the store, the engine and the wire protocol
//!
//! Records serialize with camelCase field names, the layout of the
//! persisted `data.json` document and of the RPC payloads.

mod app;
mod chain;
mod rule;

pub use app::{AppConfig, AppData, ServiceStatus};
pub use chain::{Chain, Hop};
pub use rule::{Auth, Environment, Protocol, Rule, RuleStatus, RuleType, Target, TlsConfig};
