//! Proxy chain records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::rule::{Auth, Protocol, TlsConfig};
use crate::error::ValidationError;

/// One proxy in a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hop {
    #[serde(default)]
    pub name: String,
    /// e.g. `proxy.example.com:1080`
    pub addr: String,
    #[serde(default = "default_hop_protocol")]
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

const fn default_hop_protocol() -> Protocol {
    Protocol::Socks5
}

impl Hop {
    pub fn new(addr: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            name: String::new(),
            addr: addr.into(),
            protocol,
            auth: None,
            tls: None,
        }
    }
}

/// Ordered list of proxies an upstream connection is dialled through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub hops: Vec<Hop>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Chain {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            hops: Vec::new(),
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_hop(&mut self, hop: Hop) {
        self.hops.push(hop);
        self.updated_at = Utc::now();
    }

    /// Remove a hop by index; out-of-range indices are ignored
    pub fn remove_hop(&mut self, index: usize) -> Option<Hop> {
        if index < self.hops.len() {
            self.updated_at = Utc::now();
            Some(self.hops.remove(index))
        } else {
            None
        }
    }

    /// # Errors
    ///
    /// Returns the first structural problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::ChainNameEmpty);
        }
        if self.hops.is_empty() {
            return Err(ValidationError::NoHops);
        }
        for (i, hop) in self.hops.iter().enumerate() {
            if hop.addr.is_empty() {
                return Err(ValidationError::indexed("hops", i, "hop address is empty"));
            }
        }
        Ok(())
    }
}
