//! Forwarding rule records

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// Kind of forwarding a rule performs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// Port forwarding
    #[default]
    Forward,
    /// Reverse proxy
    Reverse,
    /// Proxy chain
    Chain,
}

/// Lifecycle status persisted with a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

impl fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Network protocol of a listener or hop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Http,
    Https,
    Socks5,
    /// Shadowsocks
    Ss,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Http => "http",
            Self::Https => "https",
            Self::Socks5 => "socks5",
            Self::Ss => "ss",
        };
        f.write_str(s)
    }
}

/// Deployment environment label
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Environment {
    #[serde(rename = "TRUNK")]
    Trunk,
    #[serde(rename = "PRE-PROD")]
    PreProd,
    #[serde(rename = "PRODUCTION")]
    Production,
    #[default]
    #[serde(rename = "CUSTOM")]
    Custom,
}

/// A forwarding target (host, port, load-balancing weight)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: 1,
        }
    }

    /// `host:port`
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

const fn default_weight() -> u32 {
    1
}

/// Username/password authentication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

/// TLS settings for a listener or hop
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ca_file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_name: String,
    /// Verify the peer certificate
    #[serde(default)]
    pub secure: bool,
}

/// A forwarding rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub environment: Environment,
    #[serde(rename = "type", default)]
    pub rule_type: RuleType,
    /// Persisted "should auto-start" flag
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub local_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub target_host: String,
    #[serde(default)]
    pub target_port: u16,
    /// Weighted targets for load balancing
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Auth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_msg: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remark: String,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Create a rule with a fresh id and default values
    pub fn new(name: impl Into<String>, rule_type: RuleType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            environment: Environment::Custom,
            rule_type,
            enabled: false,
            local_port: 0,
            protocol: Protocol::Tcp,
            target_host: String::new(),
            target_port: 0,
            targets: Vec::new(),
            chain_id: None,
            auth: None,
            tls: None,
            status: RuleStatus::Stopped,
            error_msg: String::new(),
            description: String::new(),
            remark: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Check the rule is structurally startable
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::RuleNameEmpty);
        }
        if self.local_port == 0 {
            return Err(ValidationError::ListenAddrEmpty);
        }
        if self.has_primary_target() {
            return Ok(());
        }
        if self.targets.is_empty() && self.rule_type != RuleType::Chain {
            return Err(ValidationError::NoTargets);
        }
        Ok(())
    }

    fn has_primary_target(&self) -> bool {
        !self.target_host.is_empty() && self.target_port > 0
    }

    /// Listen address on all interfaces
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.local_port))
    }

    /// Primary target address, falling back to the first weighted target
    #[must_use]
    pub fn target_addr(&self) -> Option<String> {
        if self.has_primary_target() {
            return Some(format!("{}:{}", self.target_host, self.target_port));
        }
        self.targets.first().map(Target::addr)
    }

    /// Effective target list: the primary target alone, or the weighted list
    #[must_use]
    pub fn effective_targets(&self) -> Vec<Target> {
        if self.has_primary_target() {
            return vec![Target::new(self.target_host.clone(), self.target_port)];
        }
        self.targets.clone()
    }

    /// Chain id, treating an empty string as no chain
    #[must_use]
    pub fn chain_ref(&self) -> Option<&str> {
        self.chain_id.as_deref().filter(|id| !id.is_empty())
    }

    /// Refresh `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward_rule() -> Rule {
        let mut rule = Rule::new("web", RuleType::Forward);
        rule.local_port = 8080;
        rule.target_host = "10.0.0.5".into();
        rule.target_port = 80;
        rule
    }

    #[test]
    fn test_new_rule_defaults() {
        let rule = Rule::new("db", RuleType::Forward);
        assert!(Uuid::parse_str(&rule.id).is_ok());
        assert_eq!(rule.environment, Environment::Custom);
        assert_eq!(rule.protocol, Protocol::Tcp);
        assert_eq!(rule.status, RuleStatus::Stopped);
        assert!(!rule.enabled);
    }

    #[test]
    fn test_validate() {
        assert!(forward_rule().validate().is_ok());

        let mut rule = forward_rule();
        rule.name.clear();
        assert_eq!(rule.validate(), Err(ValidationError::RuleNameEmpty));

        let mut rule = forward_rule();
        rule.local_port = 0;
        assert_eq!(rule.validate(), Err(ValidationError::ListenAddrEmpty));

        let mut rule = forward_rule();
        rule.target_host.clear();
        assert_eq!(rule.validate(), Err(ValidationError::NoTargets));

        rule.targets.push(Target::new("10.0.0.6", 80));
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_chain_rule_without_targets_is_valid() {
        let mut rule = Rule::new("proxy", RuleType::Chain);
        rule.local_port = 1080;
        rule.protocol = Protocol::Socks5;
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn test_target_addr() {
        let rule = forward_rule();
        assert_eq!(rule.target_addr().as_deref(), Some("10.0.0.5:80"));
        assert_eq!(rule.effective_targets().len(), 1);

        let mut rule = Rule::new("lb", RuleType::Forward);
        rule.targets = vec![Target::new("a", 1), Target::new("b", 2)];
        assert_eq!(rule.target_addr().as_deref(), Some("a:1"));
        assert_eq!(rule.effective_targets().len(), 2);

        let rule = Rule::new("none", RuleType::Chain);
        assert!(rule.target_addr().is_none());
    }

    #[test]
    fn test_listen_addr() {
        let rule = forward_rule();
        assert_eq!(rule.listen_addr().port(), 8080);
        assert!(rule.listen_addr().ip().is_unspecified());
    }

    #[test]
    fn test_json_field_names() {
        let mut rule = forward_rule();
        rule.chain_id = Some("c1".into());
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["localPort"], 8080);
        assert_eq!(json["type"], "forward");
        assert_eq!(json["environment"], "CUSTOM");
        assert_eq!(json["chainId"], "c1");
        assert!(json.get("errorMsg").is_none());
    }

    #[test]
    fn test_empty_chain_id_is_no_chain() {
        let mut rule = forward_rule();
        rule.chain_id = Some(String::new());
        assert!(rule.chain_ref().is_none());
    }
}
