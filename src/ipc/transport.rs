//! RPC transport endpoints
//!
//! [`IpcEndpoint`] is the one place the platform transport is chosen:
//!
//! - **Unix socket**: a single socket file. Any stale file is removed before
//!   binding and the socket is chmod-ed (default `0o666`) so an unprivileged
//!   client can reach a privileged daemon.
//! - **TCP loopback**: the server binds the first free port from an ordered
//!   candidate list and writes it to every port file. A client tries each
//!   discovered port first, then probes the whole candidate list.
//!
//! Both variants exist on every platform; only binding a Unix socket is
//! limited to Unix.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{IpcConfig, TransportKind};
use crate::error::IpcError;

/// Byte stream carrying framed IPC messages
pub trait IpcIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IpcIo for T {}

/// Connected IPC stream, independent of transport
pub type IpcStream = Box<dyn IpcIo>;

/// Where the RPC server listens and clients connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IpcEndpoint {
    Unix {
        path: PathBuf,
        mode: u32,
    },
    Tcp {
        ports: Vec<u16>,
        port_files: Vec<PathBuf>,
    },
}

impl fmt::Display for IpcEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path, .. } => write!(f, "unix:{}", path.display()),
            Self::Tcp { ports, .. } => write!(f, "tcp:127.0.0.1:{ports:?}"),
        }
    }
}

impl IpcEndpoint {
    /// Pick the transport for this platform and configuration
    #[must_use]
    pub fn from_config(config: &IpcConfig) -> Self {
        match config.transport.resolve() {
            TransportKind::Tcp => Self::Tcp {
                ports: config.tcp_ports.clone(),
                port_files: config.port_files.clone(),
            },
            _ => Self::Unix {
                path: config.socket_path.clone(),
                mode: config.socket_mode,
            },
        }
    }

    /// Bind the server side
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::BindError`] if no listener could be created.
    pub async fn bind(&self) -> Result<IpcListener, IpcError> {
        match self {
            Self::Unix { path, mode } => bind_unix(path, *mode),
            Self::Tcp { ports, port_files } => bind_tcp(ports, port_files).await,
        }
    }

    /// Connect the client side within `connect_timeout` per attempt
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::ConnectionError`] or [`IpcError::Timeout`] if no
    /// candidate accepted the connection.
    pub async fn connect(&self, connect_timeout: Duration) -> Result<IpcStream, IpcError> {
        match self {
            Self::Unix { path, .. } => connect_unix(path, connect_timeout).await,
            Self::Tcp { ports, port_files } => {
                connect_tcp(ports, port_files, connect_timeout).await
            }
        }
    }
}

/// Bound server listener
pub enum IpcListener {
    #[cfg(unix)]
    Unix {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
    Tcp {
        listener: TcpListener,
        port: u16,
        port_files: Vec<PathBuf>,
    },
}

impl fmt::Debug for IpcListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(unix)]
            Self::Unix { path, .. } => f.debug_struct("Unix").field("path", path).finish(),
            Self::Tcp { port, .. } => f.debug_struct("Tcp").field("port", port).finish(),
        }
    }
}

impl IpcListener {
    /// Accept one connection, returning the stream and a peer label
    pub async fn accept(&self) -> std::io::Result<(IpcStream, String)> {
        match self {
            #[cfg(unix)]
            Self::Unix { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), "unix".to_string()))
            }
            Self::Tcp { listener, .. } => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok((Box::new(stream), peer.to_string()))
            }
        }
    }

    /// Bound TCP port, if this is a TCP listener
    #[must_use]
    pub fn tcp_port(&self) -> Option<u16> {
        match self {
            #[cfg(unix)]
            Self::Unix { .. } => None,
            Self::Tcp { port, .. } => Some(*port),
        }
    }

    /// Remove the socket file or port files
    pub fn cleanup(&self) {
        match self {
            #[cfg(unix)]
            Self::Unix { path, .. } => {
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
            }
            Self::Tcp {
                port, port_files, ..
            } => {
                for file in port_files {
                    // leave files another server has since rewritten
                    if read_port_file(file) == Some(*port) {
                        let _ = std::fs::remove_file(file);
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn bind_unix(path: &Path, mode: u32) -> Result<IpcListener, IpcError> {
    use std::os::unix::fs::PermissionsExt;

    let bind_error = |reason: String| IpcError::BindError {
        endpoint: path.display().to_string(),
        reason,
    };

    // Remove existing socket file if it exists
    if path.exists() {
        std::fs::remove_file(path)
            .map_err(|e| bind_error(format!("Failed to remove existing socket: {e}")))?;
    }

    // Create parent directory if needed
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| bind_error(format!("Failed to create parent directory: {e}")))?;
        }
    }

    let listener = tokio::net::UnixListener::bind(path).map_err(|e| bind_error(e.to_string()))?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| bind_error(format!("Failed to set permissions: {e}")))?;

    info!("IPC server listening on {:?}", path);
    Ok(IpcListener::Unix {
        listener,
        path: path.to_path_buf(),
    })
}

#[cfg(not(unix))]
fn bind_unix(path: &Path, _mode: u32) -> Result<IpcListener, IpcError> {
    Err(IpcError::BindError {
        endpoint: path.display().to_string(),
        reason: "Unix sockets are not supported on this platform".into(),
    })
}

async fn bind_tcp(ports: &[u16], port_files: &[PathBuf]) -> Result<IpcListener, IpcError> {
    let mut last_error = String::from("no candidate ports configured");

    for &port in ports {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => {
                let port = listener.local_addr().map_or(port, |a| a.port());
                write_port_files(port, port_files);
                info!("IPC server listening on 127.0.0.1:{}", port);
                return Ok(IpcListener::Tcp {
                    listener,
                    port,
                    port_files: port_files.to_vec(),
                });
            }
            Err(e) => {
                debug!("IPC port {} unavailable: {}", port, e);
                last_error = format!("port {port}: {e}");
            }
        }
    }

    Err(IpcError::BindError {
        endpoint: format!("127.0.0.1:{ports:?}"),
        reason: last_error,
    })
}

fn write_port_files(port: u16, port_files: &[PathBuf]) {
    let mut written = 0;
    for file in port_files {
        if let Some(parent) = file.parent() {
            if !parent.as_os_str().is_empty() {
                let _ = std::fs::create_dir_all(parent);
            }
        }
        match std::fs::write(file, port.to_string()) {
            Ok(()) => written += 1,
            Err(e) => debug!("could not write port file {:?}: {}", file, e),
        }
    }
    if written == 0 && !port_files.is_empty() {
        warn!("no IPC port file could be written; clients will probe candidate ports");
    }
}

/// Parse a port file, ignoring surrounding whitespace
#[must_use]
pub fn read_port_file(path: &Path) -> Option<u16> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|p| *p != 0)
}

#[cfg(unix)]
async fn connect_unix(path: &Path, connect_timeout: Duration) -> Result<IpcStream, IpcError> {
    match timeout(connect_timeout, tokio::net::UnixStream::connect(path)).await {
        Ok(Ok(stream)) => Ok(Box::new(stream)),
        Ok(Err(e)) => Err(IpcError::connection(format!("{}: {e}", path.display()))),
        Err(_) => Err(IpcError::Timeout(format!("connect to {}", path.display()))),
    }
}

#[cfg(not(unix))]
async fn connect_unix(path: &Path, _connect_timeout: Duration) -> Result<IpcStream, IpcError> {
    Err(IpcError::connection(format!(
        "{}: Unix sockets are not supported on this platform",
        path.display()
    )))
}

/// Ports to try, discovered ones first, without duplicates
fn candidate_ports(ports: &[u16], port_files: &[PathBuf]) -> Vec<u16> {
    let mut candidates: Vec<u16> = Vec::with_capacity(ports.len() + port_files.len());
    for port in port_files
        .iter()
        .filter_map(|f| read_port_file(f))
        .chain(ports.iter().copied())
    {
        if !candidates.contains(&port) {
            candidates.push(port);
        }
    }
    candidates
}

async fn connect_tcp(
    ports: &[u16],
    port_files: &[PathBuf],
    connect_timeout: Duration,
) -> Result<IpcStream, IpcError> {
    let mut last_error = IpcError::connection("no candidate ports configured");

    for port in candidate_ports(ports, port_files) {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                debug!("IPC connected on {}", addr);
                return Ok(Box::new(stream));
            }
            Ok(Err(e)) => last_error = IpcError::connection(format!("{addr}: {e}")),
            Err(_) => last_error = IpcError::Timeout(format!("connect to {addr}")),
        }
    }

    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_from_config() {
        let mut config = IpcConfig::default();
        config.transport = TransportKind::Tcp;
        assert!(matches!(
            IpcEndpoint::from_config(&config),
            IpcEndpoint::Tcp { .. }
        ));

        config.transport = TransportKind::Unix;
        assert!(matches!(
            IpcEndpoint::from_config(&config),
            IpcEndpoint::Unix { .. }
        ));

        config.transport = TransportKind::Auto;
        let endpoint = IpcEndpoint::from_config(&config);
        if cfg!(unix) {
            assert!(matches!(endpoint, IpcEndpoint::Unix { .. }));
        } else {
            assert!(matches!(endpoint, IpcEndpoint::Tcp { .. }));
        }
    }

    #[test]
    fn test_candidate_ports_prefer_discovered() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("ipc_port");
        std::fs::write(&file, "19866\n").unwrap();
        let missing = dir.path().join("missing");

        let ports = candidate_ports(&[19846, 19856, 19866], &[missing, file]);
        assert_eq!(ports, vec![19866, 19846, 19856]);
    }

    #[test]
    fn test_read_port_file_rejects_garbage() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("ipc_port");
        std::fs::write(&file, "not a port").unwrap();
        assert_eq!(read_port_file(&file), None);
        std::fs::write(&file, "0").unwrap();
        assert_eq!(read_port_file(&file), None);
    }

    #[tokio::test]
    async fn test_tcp_bind_skips_taken_port_and_writes_files() {
        let dir = tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();
        let free = free_port();
        let port_files = vec![dir.path().join("a/ipc_port"), dir.path().join("b/ipc_port")];

        let endpoint = IpcEndpoint::Tcp {
            ports: vec![taken_port, free],
            port_files: port_files.clone(),
        };
        let listener = endpoint.bind().await.unwrap();
        assert_eq!(listener.tcp_port(), Some(free));
        for file in &port_files {
            assert_eq!(read_port_file(file), Some(free));
        }

        // a client with only the port files and a dead candidate still finds it
        let client_endpoint = IpcEndpoint::Tcp {
            ports: vec![taken_port],
            port_files: port_files.clone(),
        };
        let accept = tokio::spawn(async move {
            let accepted = listener.accept().await.map(|_| ());
            (listener, accepted)
        });
        client_endpoint
            .connect(Duration::from_secs(1))
            .await
            .unwrap();
        let (listener, accepted) = accept.await.unwrap();
        accepted.unwrap();

        listener.cleanup();
        for file in &port_files {
            assert!(!file.exists());
        }
    }

    #[tokio::test]
    async fn test_tcp_connect_fails_without_server() {
        let endpoint = IpcEndpoint::Tcp {
            ports: vec![free_port()],
            port_files: Vec::new(),
        };
        let err = endpoint.connect(Duration::from_millis(500)).await.err().unwrap();
        assert!(err.is_transport());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_replaces_stale_socket() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("run/portwarden.sock");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"stale").unwrap();

        let endpoint = IpcEndpoint::Unix {
            path: path.clone(),
            mode: 0o666,
        };
        let listener = endpoint.bind().await.unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o666);

        endpoint.connect(Duration::from_secs(1)).await.unwrap();

        listener.cleanup();
        assert!(!path.exists());
    }
}
