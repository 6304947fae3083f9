//! IPC (Inter-Process Communication) module
//!
//! Request/response RPC between the daemon and its clients. One call blocks
//! until its reply or a timeout.
//!
//! # Protocol
//!
//! Messages are length-prefixed JSON:
//! - 4 bytes: message length (big-endian u32)
//! - N bytes: JSON-encoded [`IpcCommand`] or [`IpcReply`]
//!
//! # Transport
//!
//! See [`IpcEndpoint`]: a Unix socket on Unix, TCP loopback with port-file
//! discovery on Windows. Selection happens once, in
//! [`IpcEndpoint::from_config`].
//!
//! # Example
//!
//! ```no_run
//! use portwarden::config::IpcConfig;
//! use portwarden::ipc::{IpcClient, IpcCommand, IpcResponse};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = IpcClient::from_config(&IpcConfig::default());
//!
//! if client.ping().await? {
//!     println!("daemon is alive");
//! }
//!
//! if let IpcResponse::Status { status } = client.send(IpcCommand::GetStatus).await? {
//!     println!("{} of {} rules active", status.rules_active, status.rules_total);
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod handler;
mod protocol;
mod server;
mod transport;

pub use client::IpcClient;
pub use handler::IpcHandler;
pub use protocol::{
    decode_message, encode_message, read_frame, write_frame, CreateChainArgs, CreateRuleArgs,
    ErrorCode, Frame, GetLogsArgs, GetLogsByRuleArgs, GetLogsSinceArgs, ImportDataArgs,
    IpcCommand, IpcReply, IpcResponse, RuleStatsArgs, LENGTH_PREFIX_SIZE, MAX_MESSAGE_SIZE,
};
pub use server::IpcServer;
pub use transport::{read_port_file, IpcEndpoint, IpcIo, IpcListener, IpcStream};
