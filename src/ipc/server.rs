//! IPC server
//!
//! Accepts connections on an [`IpcEndpoint`] and serves each on its own
//! task, dispatching framed [`IpcCommand`]s to the [`IpcHandler`].

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::IpcHandler;
use super::protocol::{
    decode_message, read_frame, write_frame, ErrorCode, Frame, IpcCommand, IpcReply, IpcResponse,
};
use super::transport::{IpcEndpoint, IpcListener, IpcStream};
use crate::error::IpcError;

/// RPC server bound to one endpoint
pub struct IpcServer {
    endpoint: IpcEndpoint,
    handler: Arc<IpcHandler>,
    max_message_size: usize,
    shutdown: CancellationToken,
    bound_port: Mutex<Option<u16>>,
}

impl IpcServer {
    /// Create a new IPC server
    pub fn new(endpoint: IpcEndpoint, handler: Arc<IpcHandler>, max_message_size: usize) -> Self {
        Self {
            endpoint,
            handler,
            max_message_size,
            shutdown: CancellationToken::new(),
            bound_port: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn endpoint(&self) -> &IpcEndpoint {
        &self.endpoint
    }

    /// Port chosen by a running TCP server
    #[must_use]
    pub fn bound_port(&self) -> Option<u16> {
        *self.bound_port.lock()
    }

    /// Bind the endpoint and serve until [`IpcServer::shutdown`]
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::BindError`] if the endpoint could not be bound.
    pub async fn run(&self) -> Result<(), IpcError> {
        let listener = self.bind().await?;
        self.serve(listener).await;
        Ok(())
    }

    /// Bind without serving, so a caller can learn of bind failures first
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::BindError`] if the endpoint could not be bound.
    pub async fn bind(&self) -> Result<IpcListener, IpcError> {
        let listener = self.endpoint.bind().await?;
        *self.bound_port.lock() = listener.tcp_port();
        Ok(listener)
    }

    /// Serve an already bound listener until shutdown, then clean up
    pub async fn serve(&self, listener: IpcListener) {
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let handler = Arc::clone(&self.handler);
                            let max_size = self.max_message_size;
                            let shutdown = self.shutdown.clone();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, &peer, handler, max_size, shutdown).await {
                                    debug!("IPC connection error from {}: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("IPC accept error: {}", e);
                        }
                    }
                }
                () = self.shutdown.cancelled() => {
                    info!("IPC server shutting down");
                    break;
                }
            }
        }

        listener.cleanup();
        *self.bound_port.lock() = None;
    }

    /// Initiate shutdown; a server not yet serving exits as soon as it starts
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Handle a single IPC connection
async fn handle_connection(
    mut stream: IpcStream,
    peer: &str,
    handler: Arc<IpcHandler>,
    max_message_size: usize,
    shutdown: CancellationToken,
) -> Result<(), IpcError> {
    debug!("New IPC connection from {}", peer);

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut stream, max_message_size) => frame?,
            () = shutdown.cancelled() => {
                debug!("closing IPC connection from {} on shutdown", peer);
                return Ok(());
            }
        };
        let body = match frame {
            None => {
                debug!("IPC client disconnected");
                return Ok(());
            }
            Some(Frame::Oversized(len)) => {
                warn!(
                    "IPC message too large: {} bytes (max {})",
                    len, max_message_size
                );
                let response = IpcResponse::error(
                    ErrorCode::InvalidParameters,
                    format!("Message too large: {len} bytes"),
                );
                send_reply(&mut stream, response, max_message_size).await?;
                continue;
            }
            Some(Frame::Message(body)) => body,
        };

        let command: IpcCommand = match decode_message(&body) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("Invalid IPC command: {}", e);
                let response = IpcResponse::error(
                    ErrorCode::InvalidCommand,
                    format!("Invalid command format: {e}"),
                );
                send_reply(&mut stream, response, max_message_size).await?;
                continue;
            }
        };

        debug!("Received IPC command: {}", command.method());

        let response = handler.handle(command).await;
        send_reply(&mut stream, response, max_message_size).await?;
    }
}

/// Write a reply, substituting an error reply when it is too large to send
async fn send_reply(
    stream: &mut IpcStream,
    response: IpcResponse,
    max_message_size: usize,
) -> Result<(), IpcError> {
    match write_frame(stream, &IpcReply::from(response), max_message_size).await {
        Err(IpcError::SerializationError(reason)) => {
            warn!("IPC reply not sent: {}", reason);
            let response = IpcResponse::error(ErrorCode::InternalError, reason);
            write_frame(stream, &IpcReply::from(response), max_message_size).await
        }
        other => other,
    }
}
