//! Error types for portwarden
//!
//! This module defines the error hierarchy for the forwarding control plane.
//! Errors are categorized by subsystem and include recovery hints.

use std::io;

use thiserror::Error;

use crate::ipc::ErrorCode;

/// Top-level error type for portwarden
#[derive(Debug, Error)]
pub enum PortwardenError {
    /// Process settings errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Rule or chain validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Rule lifecycle errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Persistence errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Controller operation errors
    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    /// IPC communication errors
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// Single-instance coordination errors
    #[error("Instance error: {0}")]
    Instance(#[from] InstanceError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl PortwardenError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Validation(_) => false,
            Self::Engine(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            Self::Controller(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Instance(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Structural errors in a rule or chain definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("rule name cannot be empty")]
    RuleNameEmpty,

    #[error("listen address cannot be empty")]
    ListenAddrEmpty,

    #[error("at least one target is required")]
    NoTargets,

    #[error("chain name cannot be empty")]
    ChainNameEmpty,

    #[error("at least one hop is required")]
    NoHops,

    /// A field-level failure, optionally pointing into a list
    #[error("validation error on {}: {message}", field_label(.field, .index))]
    Field {
        field: String,
        index: Option<usize>,
        message: String,
    },
}

fn field_label(field: &str, index: &Option<usize>) -> String {
    match index {
        Some(i) => format!("{field}[{i}]"),
        None => field.to_string(),
    }
}

impl ValidationError {
    /// Create a field error
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            index: None,
            message: message.into(),
        }
    }

    /// Create a field error for an element of a list
    pub fn indexed(field: impl Into<String>, index: usize, message: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            index: Some(index),
            message: message.into(),
        }
    }
}

/// Rule lifecycle errors raised by the engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// A running entry already exists for this rule
    #[error("service is already running: {rule_id}")]
    AlreadyRunning { rule_id: String },

    /// No running entry exists for this rule
    #[error("service is not running: {rule_id}")]
    NotRunning { rule_id: String },

    /// The rule failed structural validation
    #[error("invalid rule {rule_id}: {source}")]
    Invalid {
        rule_id: String,
        #[source]
        source: ValidationError,
    },

    /// The forwarding backend could not build a service
    #[error("engine error [{op}] on rule {rule_id}: {source}")]
    Build {
        rule_id: String,
        op: &'static str,
        #[source]
        source: BackendError,
    },

    /// The rule references a chain the engine does not know
    #[error("chain not found for rule {rule_id}: {chain_id}")]
    ChainNotFound { rule_id: String, chain_id: String },
}

impl EngineError {
    /// Lifecycle-state errors are caller-correctable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::AlreadyRunning { .. } | Self::NotRunning { .. })
    }

    /// Whether this is a lifecycle-state error rather than a failure
    #[must_use]
    pub const fn is_state_error(&self) -> bool {
        self.is_recoverable()
    }

    pub fn already_running(rule_id: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            rule_id: rule_id.into(),
        }
    }

    pub fn not_running(rule_id: impl Into<String>) -> Self {
        Self::NotRunning {
            rule_id: rule_id.into(),
        }
    }
}

/// Errors from the forwarding backend while building a service
#[derive(Debug, Error)]
pub enum BackendError {
    /// Listener could not bind
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Feature combination the backend cannot serve
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Rule or chain fields the backend cannot interpret
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// I/O error
    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),
}

impl BackendError {
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

/// Reason a running service's serve loop returned
#[derive(Debug, Error)]
pub enum ServeError {
    /// The listener was closed; a normal stop signal
    #[error("use of closed network connection")]
    Closed,

    /// The listener socket failed to (re)bind
    #[error("bind failed: {0}")]
    Bind(#[source] io::Error),

    /// Accept failed
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// Any other service failure
    #[error("{0}")]
    Other(String),
}

impl ServeError {
    /// Whether this exit should tear down the rule and mark it `error`
    ///
    /// Bind and permission failures are fatal. Everything else is either a
    /// normal stop ([`ServeError::Closed`]) or logged and survived.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Bind(_) => true,
            Self::Accept(e) => matches!(
                e.kind(),
                io::ErrorKind::PermissionDenied
                    | io::ErrorKind::AddrInUse
                    | io::ErrorKind::AddrNotAvailable
            ),
            Self::Closed | Self::Other(_) => false,
        }
    }

    /// Whether this exit means the listener shut down normally
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Persistence errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rule not found")]
    RuleNotFound { id: String },

    #[error("rule already exists")]
    RuleExists { id: String },

    #[error("chain not found")]
    ChainNotFound { id: String },

    #[error("chain already exists")]
    ChainExists { id: String },

    #[error("chain is in use by one or more rules")]
    ChainInUse { id: String },

    /// Data file could not be parsed or written as JSON
    #[error("data serialization error: {0}")]
    Serialization(String),

    /// Underlying file I/O failed
    #[error("data I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::RuleNotFound { .. }
            | Self::RuleExists { .. }
            | Self::ChainNotFound { .. }
            | Self::ChainExists { .. }
            | Self::ChainInUse { .. } => true,
            Self::Serialization(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// IPC communication errors
#[derive(Debug, Error)]
pub enum IpcError {
    /// Failed to bind the listening endpoint
    #[error("Failed to bind IPC endpoint {endpoint}: {reason}")]
    BindError { endpoint: String, reason: String },

    /// Could not reach the server
    #[error("IPC connection error: {0}")]
    ConnectionError(String),

    /// Connect or call deadline elapsed
    #[error("IPC timeout: {0}")]
    Timeout(String),

    /// Protocol error (invalid message format)
    #[error("IPC protocol error: {0}")]
    ProtocolError(String),

    /// Serialization error
    #[error("IPC serialization error: {0}")]
    SerializationError(String),

    /// The server answered with a business-logic failure
    #[error("{message}")]
    Remote { code: ErrorCode, message: String },

    /// I/O error
    #[error("IPC I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl IpcError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::ConnectionError(_) | Self::Timeout(_) => true,
            Self::ProtocolError(_) => true,
            Self::SerializationError(_) => false,
            Self::Remote { .. } => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
            ),
        }
    }

    /// Whether the failure happened in the transport rather than in the
    /// remote handler. Transport failures drop the client connection.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        !matches!(self, Self::Remote { .. } | Self::SerializationError(_))
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::SerializationError(msg.into())
    }

    /// Create a remote business-logic error
    pub fn remote(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Remote {
            code,
            message: message.into(),
        }
    }
}

/// Errors surfaced through the `ServiceController` contract
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ipc(#[from] IpcError),

    /// Several rules failed; carries the last failure
    #[error("{0}")]
    Failed(String),

    /// The controller has been shut down and no longer accepts changes
    #[error("controller is shutting down")]
    ShuttingDown,
}

impl ControllerError {
    /// Map onto the wire error code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::InvalidParameters,
            Self::Engine(e) => match e {
                EngineError::AlreadyRunning { .. } => ErrorCode::AlreadyRunning,
                EngineError::NotRunning { .. } => ErrorCode::NotRunning,
                EngineError::Invalid { .. } => ErrorCode::InvalidParameters,
                EngineError::ChainNotFound { .. } => ErrorCode::NotFound,
                EngineError::Build { .. } => ErrorCode::OperationFailed,
            },
            Self::Store(e) => match e {
                StoreError::RuleNotFound { .. } | StoreError::ChainNotFound { .. } => {
                    ErrorCode::NotFound
                }
                StoreError::RuleExists { .. } | StoreError::ChainExists { .. } => {
                    ErrorCode::AlreadyExists
                }
                StoreError::ChainInUse { .. } => ErrorCode::InUse,
                StoreError::Serialization(_) | StoreError::Io(_) => ErrorCode::InternalError,
            },
            Self::Ipc(IpcError::Remote { code, .. }) => *code,
            Self::Ipc(_) => ErrorCode::Unavailable,
            Self::Failed(_) => ErrorCode::OperationFailed,
            Self::ShuttingDown => ErrorCode::ShuttingDown,
        }
    }

    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Engine(e) => e.is_recoverable(),
            Self::Store(e) => e.is_recoverable(),
            Self::Ipc(e) => e.is_recoverable(),
            Self::Failed(_) | Self::ShuttingDown => true,
        }
    }

    /// Whether this came from the RPC transport rather than business logic
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Ipc(e) if e.is_transport())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Single-instance coordination errors
#[derive(Debug, Error)]
pub enum InstanceError {
    /// Lock file or mutex could not be created
    #[error("Failed to acquire instance lock {name}: {reason}")]
    Lock { name: String, reason: String },

    /// Wake-up channel could not reach or bind
    #[error("Wake-up channel error: {0}")]
    Wakeup(String),

    #[error("Instance I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl InstanceError {
    pub fn lock(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lock {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with PortwardenError
pub type Result<T> = std::result::Result<T, PortwardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_error_classification() {
        let bind = ServeError::Bind(io::Error::new(io::ErrorKind::AddrInUse, "in use"));
        assert!(bind.is_fatal());

        let denied = ServeError::Accept(io::Error::new(io::ErrorKind::PermissionDenied, "no"));
        assert!(denied.is_fatal());

        let reset = ServeError::Accept(io::Error::new(io::ErrorKind::ConnectionReset, "rst"));
        assert!(!reset.is_fatal());

        // Message text must not drive classification
        let other = ServeError::Other("bind: address already in use".into());
        assert!(!other.is_fatal());

        assert!(ServeError::Closed.is_closed());
        assert!(!ServeError::Closed.is_fatal());
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::indexed("hops", 2, "hop address is empty");
        assert_eq!(
            err.to_string(),
            "validation error on hops[2]: hop address is empty"
        );

        let err = ValidationError::field("name", "too long");
        assert_eq!(err.to_string(), "validation error on name: too long");

        assert_eq!(
            ValidationError::RuleNameEmpty.to_string(),
            "rule name cannot be empty"
        );
    }

    #[test]
    fn test_controller_error_codes() {
        let err: ControllerError = EngineError::already_running("r1").into();
        assert_eq!(err.code(), ErrorCode::AlreadyRunning);
        assert!(!err.is_transport());

        let err: ControllerError = StoreError::ChainInUse { id: "c1".into() }.into();
        assert_eq!(err.code(), ErrorCode::InUse);
        assert_eq!(err.to_string(), "chain is in use by one or more rules");

        let err: ControllerError = IpcError::connection("refused").into();
        assert!(err.is_transport());

        let err: ControllerError = IpcError::remote(ErrorCode::NotFound, "rule not found").into();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.to_string(), "rule not found");
        assert!(!err.is_transport());
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: PortwardenError = io_err.into();
        assert!(err.is_recoverable());

        let config_err = ConfigError::ValidationError("invalid".into());
        let err: PortwardenError = config_err.into();
        assert!(!err.is_recoverable());

        let err: PortwardenError = EngineError::not_running("r1").into();
        assert!(err.is_recoverable());
    }
}
