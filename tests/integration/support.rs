//! Shared fixtures for the integration suite

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use portwarden::config::{EngineConfig, Settings, TransportKind};
use portwarden::controller::{LocalController, ServiceController};
use portwarden::ipc::{IpcClient, IpcEndpoint, IpcHandler, IpcServer};
use portwarden::model::{Rule, RuleType};
use portwarden::{Engine, RelayBackend, Store};

/// An unused loopback port (released before returning)
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Local controller over a fresh store in `dir`, driving the relay backend
pub fn local_controller(dir: &Path) -> Arc<LocalController> {
    let store = Arc::new(Store::open(dir).unwrap());
    let engine = Arc::new(Engine::new(
        Arc::new(RelayBackend::new(Duration::from_secs(2))),
        &EngineConfig::default(),
    ));
    Arc::new(LocalController::new(store, engine))
}

/// Disabled forward rule on a free port
pub fn tcp_rule(name: &str, target: SocketAddr) -> Rule {
    let mut rule = Rule::new(name, RuleType::Forward);
    rule.local_port = free_port();
    rule.target_host = target.ip().to_string();
    rule.target_port = target.port();
    rule
}

/// Spawn a TCP echo server on loopback
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Write `payload` to `addr` and read the same number of bytes back
pub async fn echo_through(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    buf
}

/// TCP endpoint discoverable through a single port file in `dir`
pub fn tcp_endpoint(dir: &Path) -> (IpcEndpoint, PathBuf) {
    let port_file = dir.join("ipc.port");
    let endpoint = IpcEndpoint::Tcp {
        ports: vec![free_port(), free_port()],
        port_files: vec![port_file.clone()],
    };
    (endpoint, port_file)
}

pub fn client_for(endpoint: IpcEndpoint) -> IpcClient {
    IpcClient::new(endpoint, Duration::from_millis(500), Duration::from_secs(5))
}

/// Settings pointing every path and port at `dir`, using the TCP transport
pub fn isolated_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.data_dir = Some(dir.join("data"));
    settings.ipc.transport = TransportKind::Tcp;
    settings.ipc.tcp_ports = vec![free_port()];
    settings.ipc.port_files = vec![dir.join("ipc.port")];
    settings.ipc.connect_timeout_ms = 300;
    settings.instance.lock_dir = dir.to_path_buf();
    settings.instance.wakeup_ports = vec![free_port()];
    settings
}

/// An IPC server serving a controller in the background
pub struct RunningServer {
    pub server: Arc<IpcServer>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub async fn start(
        endpoint: IpcEndpoint,
        controller: Arc<dyn ServiceController>,
        max_message_size: usize,
    ) -> Self {
        let handler = Arc::new(IpcHandler::new(controller));
        let server = Arc::new(IpcServer::new(endpoint, handler, max_message_size));
        let listener = server.bind().await.unwrap();
        let task = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };
        Self { server, task }
    }

    pub async fn stop(self) {
        self.server.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
