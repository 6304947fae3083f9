//! IPC client
//!
//! Holds one lazily established connection behind an async mutex, so calls
//! from one process are serialized over a single stream. Any transport
//! failure drops the connection; the next call reconnects.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use super::protocol::{decode_message, read_frame, write_frame, Frame, IpcCommand, IpcReply, IpcResponse};
use super::transport::{IpcEndpoint, IpcStream};
use crate::config::IpcConfig;
use crate::error::IpcError;

/// IPC client for connecting to the server
pub struct IpcClient {
    endpoint: IpcEndpoint,
    connect_timeout: Duration,
    call_timeout: Duration,
    max_message_size: usize,
    conn: Mutex<Option<IpcStream>>,
}

impl std::fmt::Debug for IpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcClient")
            .field("endpoint", &self.endpoint)
            .field("connect_timeout", &self.connect_timeout)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl IpcClient {
    /// Create a client; no connection is made until the first call
    pub fn new(endpoint: IpcEndpoint, connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            endpoint,
            connect_timeout,
            call_timeout,
            max_message_size: super::protocol::MAX_MESSAGE_SIZE,
            conn: Mutex::new(None),
        }
    }

    /// Create a client for the configured endpoint
    #[must_use]
    pub fn from_config(config: &IpcConfig) -> Self {
        let mut client = Self::new(
            IpcEndpoint::from_config(config),
            config.connect_timeout(),
            config.call_timeout(),
        );
        client.max_message_size = config.max_message_size;
        client
    }

    #[must_use]
    pub const fn endpoint(&self) -> &IpcEndpoint {
        &self.endpoint
    }

    /// Send a command and return the full reply envelope
    ///
    /// # Errors
    ///
    /// Returns a transport error ([`IpcError::ConnectionError`],
    /// [`IpcError::Timeout`], I/O or protocol errors). Business failures come
    /// back inside the reply.
    pub async fn call(&self, command: &IpcCommand) -> Result<IpcReply, IpcError> {
        let mut guard = self.conn.lock().await;

        if guard.is_none() {
            let stream = self.endpoint.connect(self.connect_timeout).await?;
            debug!("IPC client connected to {}", self.endpoint);
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(IpcError::connection("connection unavailable"));
        };

        let result = match timeout(self.call_timeout, exchange(stream, command, self.max_message_size)).await {
            Ok(result) => result,
            Err(_) => Err(IpcError::Timeout(format!(
                "{} after {:?}",
                command.method(),
                self.call_timeout
            ))),
        };

        if let Err(e) = &result {
            if e.is_transport() {
                debug!("dropping IPC connection after error: {}", e);
                *guard = None;
            }
        }
        result
    }

    /// Send a command, mapping a business failure to [`IpcError::Remote`]
    ///
    /// # Errors
    ///
    /// Returns transport errors as in [`IpcClient::call`], or
    /// [`IpcError::Remote`] when the daemon replied with an error.
    pub async fn send(&self, command: IpcCommand) -> Result<IpcResponse, IpcError> {
        let reply = self.call(&command).await?;
        let response = reply.response.into_result()?;
        if !reply.success {
            return Err(IpcError::protocol(format!(
                "{} reported failure without an error payload",
                command.method()
            )));
        }
        Ok(response)
    }

    /// Send a ping command
    ///
    /// # Errors
    ///
    /// Returns any transport error.
    pub async fn ping(&self) -> Result<bool, IpcError> {
        let response = self.send(IpcCommand::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Drop the current connection, if any
    pub async fn disconnect(&self) {
        self.conn.lock().await.take();
    }

    /// Whether a connection is currently held
    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }
}

async fn exchange(
    stream: &mut IpcStream,
    command: &IpcCommand,
    max_message_size: usize,
) -> Result<IpcReply, IpcError> {
    write_frame(stream, command, max_message_size).await?;

    match read_frame(stream, max_message_size).await? {
        None => Err(IpcError::connection("server closed the connection")),
        Some(Frame::Oversized(len)) => Err(IpcError::protocol(format!(
            "Response too large: {len} bytes"
        ))),
        Some(Frame::Message(body)) => {
            decode_message(&body).map_err(|e| IpcError::protocol(e.to_string()))
        }
    }
}
