//! IPC Protocol definitions
//!
//! Commands and replies exchanged between clients (CLI, GUI) and the daemon.
//! Every [`IpcCommand`] maps one-to-one onto a
//! [`ServiceController`](crate::controller::ServiceController) method.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::IpcError;
use crate::logbuf::LogEntry;
use crate::model::{AppConfig, AppData, Chain, Rule, ServiceStatus};
use crate::stats::RuleStats;

/// Arguments carrying a full rule (create and update)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateRuleArgs {
    pub rule: Rule,
}

/// Arguments carrying a full chain (create and update)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChainArgs {
    pub chain: Chain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportDataArgs {
    pub data: AppData,
    /// Upsert into the existing data instead of replacing it
    #[serde(default)]
    pub merge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLogsArgs {
    /// Most recent entries to return; 0 means all
    #[serde(default)]
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLogsSinceArgs {
    pub since_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLogsByRuleArgs {
    pub rule_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleStatsArgs {
    pub rule_id: String,
}

/// IPC command types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum IpcCommand {
    /// Liveness check
    Ping,

    /// Daemon status
    GetStatus,

    // Rules
    GetRules,
    GetRule { id: String },
    CreateRule(CreateRuleArgs),
    UpdateRule(CreateRuleArgs),
    DeleteRule { id: String },
    StartRule { id: String },
    StopRule { id: String },
    StartAllRules,
    StopAllRules,

    // Chains
    GetChains,
    GetChain { id: String },
    CreateChain(CreateChainArgs),
    UpdateChain(CreateChainArgs),
    DeleteChain { id: String },

    // Config
    GetConfig,
    UpdateConfig { config: AppConfig },

    // Stats
    GetRuleStats(RuleStatsArgs),
    GetAllRuleStats,
    /// Zero one rule's counters, or all with no id
    ResetRuleStats {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
    },

    // Logs
    GetLogs(GetLogsArgs),
    GetLogsSince(GetLogsSinceArgs),
    GetLogsByRule(GetLogsByRuleArgs),
    ClearLogs,

    // Bulk data
    ExportData,
    ImportData(ImportDataArgs),
}

impl IpcCommand {
    /// Wire method name, for logging
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::GetStatus => "get_status",
            Self::GetRules => "get_rules",
            Self::GetRule { .. } => "get_rule",
            Self::CreateRule(_) => "create_rule",
            Self::UpdateRule(_) => "update_rule",
            Self::DeleteRule { .. } => "delete_rule",
            Self::StartRule { .. } => "start_rule",
            Self::StopRule { .. } => "stop_rule",
            Self::StartAllRules => "start_all_rules",
            Self::StopAllRules => "stop_all_rules",
            Self::GetChains => "get_chains",
            Self::GetChain { .. } => "get_chain",
            Self::CreateChain(_) => "create_chain",
            Self::UpdateChain(_) => "update_chain",
            Self::DeleteChain { .. } => "delete_chain",
            Self::GetConfig => "get_config",
            Self::UpdateConfig { .. } => "update_config",
            Self::GetRuleStats(_) => "get_rule_stats",
            Self::GetAllRuleStats => "get_all_rule_stats",
            Self::ResetRuleStats { .. } => "reset_rule_stats",
            Self::GetLogs(_) => "get_logs",
            Self::GetLogsSince(_) => "get_logs_since",
            Self::GetLogsByRule(_) => "get_logs_by_rule",
            Self::ClearLogs => "clear_logs",
            Self::ExportData => "export_data",
            Self::ImportData(_) => "import_data",
        }
    }
}

/// IPC response payloads
///
/// Struct variants only: [`Rule`] serializes its own `type` field, which an
/// internally tagged newtype variant would collide with.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcResponse {
    Pong,
    Rules { rules: Vec<Rule> },
    Rule { rule: Rule },
    /// Id of a newly created rule or chain
    Created { id: String },
    Chains { chains: Vec<Chain> },
    Chain { chain: Chain },
    Config { config: AppConfig },
    Status { status: ServiceStatus },
    RuleStats { stats: RuleStats },
    AllRuleStats { stats: HashMap<String, RuleStats> },
    Logs { logs: Vec<LogEntry> },
    /// Exported data document (pretty JSON)
    Data { data: String },
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error { code: ErrorCode, message: String },
}

impl IpcResponse {
    /// Create a success response with no message
    pub fn success() -> Self {
        Self::Success { message: None }
    }

    /// Create an error response
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Check if this is an error response
    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Turn an error response into [`IpcError::Remote`]
    ///
    /// # Errors
    ///
    /// Returns the carried business error for [`IpcResponse::Error`].
    pub fn into_result(self) -> Result<Self, IpcError> {
        match self {
            Self::Error { code, message } => Err(IpcError::remote(code, message)),
            other => Ok(other),
        }
    }
}

/// Reply envelope
///
/// `success` lets a client tell a business failure (`false` with an
/// [`IpcResponse::Error`]) from a transport fault (no reply at all).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcReply {
    pub success: bool,
    pub response: IpcResponse,
}

impl From<IpcResponse> for IpcReply {
    fn from(response: IpcResponse) -> Self {
        Self {
            success: !response.is_error(),
            response,
        }
    }
}

/// Error codes for IPC responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Unknown error
    Unknown,
    /// Invalid command
    InvalidCommand,
    /// Invalid parameters
    InvalidParameters,
    /// Resource not found
    NotFound,
    /// Resource already exists
    AlreadyExists,
    /// Rule is already running
    AlreadyRunning,
    /// Rule is not running
    NotRunning,
    /// Chain is referenced by a rule
    InUse,
    /// Operation failed
    OperationFailed,
    /// Server is shutting down
    ShuttingDown,
    /// Permission denied
    PermissionDenied,
    /// Internal error
    InternalError,
    /// Daemon unreachable
    Unavailable,
}

/// Message framing for IPC
///
/// Messages are length-prefixed:
/// - 4 bytes: message length (big-endian u32)
/// - N bytes: JSON message
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Encode a message with length prefix
///
/// # Errors
///
/// Returns [`IpcError::SerializationError`] if the message cannot be
/// serialized or its body is larger than `max_size`. Nothing is written in
/// either case, so the stream stays usable.
pub fn encode_message<T: Serialize>(msg: &T, max_size: usize) -> Result<Vec<u8>, IpcError> {
    let json = serde_json::to_vec(msg).map_err(|e| IpcError::serialization(e.to_string()))?;
    let len = u32::try_from(json.len())
        .ok()
        .filter(|_| json.len() <= max_size)
        .ok_or_else(|| {
            IpcError::serialization(format!(
                "message of {} bytes exceeds the {max_size} byte limit",
                json.len()
            ))
        })?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + json.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&json);

    Ok(buf)
}

/// Decode a message body (without its length prefix)
pub fn decode_message<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(data)
}

/// One frame read off a stream
#[derive(Debug)]
pub enum Frame {
    /// A complete message body
    Message(Vec<u8>),
    /// The declared length exceeded the limit; the body was discarded
    Oversized(usize),
}

/// Read one length-prefixed frame
///
/// Returns `Ok(None)` on a clean EOF before the length prefix.
pub async fn read_frame<S>(stream: &mut S, max_size: usize) -> Result<Option<Frame>, IpcError>
where
    S: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(IpcError::from(e)),
    }

    let msg_len = u32::from_be_bytes(len_buf) as usize;
    if msg_len > max_size {
        // drain the body so the stream stays in sync
        let mut body = (&mut *stream).take(msg_len as u64);
        tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
        return Ok(Some(Frame::Oversized(msg_len)));
    }

    let mut msg_buf = vec![0u8; msg_len];
    stream.read_exact(&mut msg_buf).await?;
    Ok(Some(Frame::Message(msg_buf)))
}

/// Encode and write one frame, refusing bodies larger than `max_size`
pub async fn write_frame<S, T>(stream: &mut S, msg: &T, max_size: usize) -> Result<(), IpcError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let encoded = encode_message(msg, max_size)?;
    stream.write_all(&encoded).await?;
    stream.flush().await?;
    Ok(())
}
