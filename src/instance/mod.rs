//! Single-instance coordination
//!
//! The first interactive launch takes an OS-level lock (an advisory `flock`
//! on Unix, a named mutex on Windows) and listens on a wake-up channel.
//! Later launches fail [`Instance::try_lock`], send the wake-up token and
//! exit; the first instance runs its registered callback.
//!
//! The wake-up channel is a Unix socket next to the lock file, or a TCP
//! loopback listener on the first free port of `wakeup_ports`. Failures on
//! that channel never stop startup.

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
use self::unix::PlatformLock;
#[cfg(windows)]
use self::windows::PlatformLock;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{InstanceConfig, TransportKind};
use crate::error::InstanceError;

/// Payload sent by a second launch
pub const WAKEUP_TOKEN: &[u8] = b"WAKEUP";

const READ_DEADLINE: Duration = Duration::from_secs(1);
#[cfg(unix)]
const UNIX_DIAL_TIMEOUT: Duration = Duration::from_secs(2);
const TCP_DIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Callback run when a wake-up token arrives
pub type WakeupCallback = Arc<dyn Fn() + Send + Sync>;

/// Where the wake-up channel listens
#[derive(Debug)]
enum WakeupChannel {
    Unix(PathBuf),
    Tcp(Vec<u16>),
}

/// Running wake-up listener
#[derive(Debug)]
struct WakeupListener {
    cancel: CancellationToken,
    socket_path: Option<PathBuf>,
}

/// Single-instance lock plus wake-up channel
pub struct Instance {
    name: String,
    lock_dir: PathBuf,
    channel: WakeupChannel,
    lock: Mutex<Option<PlatformLock>>,
    listener: Mutex<Option<WakeupListener>>,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

impl Instance {
    #[must_use]
    pub fn new(config: &InstanceConfig) -> Self {
        let channel = match config.wakeup_transport.resolve() {
            TransportKind::Tcp => WakeupChannel::Tcp(config.wakeup_ports.clone()),
            _ => WakeupChannel::Unix(
                config
                    .lock_dir
                    .join(format!("{}-wakeup.sock", config.name)),
            ),
        };
        Self {
            name: config.name.clone(),
            lock_dir: config.lock_dir.clone(),
            channel,
            lock: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Take the instance lock without blocking
    ///
    /// Returns `true` if this is the first instance. Calling again while the
    /// lock is held returns `true`.
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError`] if the lock primitive itself fails.
    pub fn try_lock(&self) -> Result<bool, InstanceError> {
        let mut slot = self.lock.lock();
        if slot.is_some() {
            return Ok(true);
        }

        match PlatformLock::acquire(&self.lock_dir, &self.name)? {
            Some(lock) => {
                debug!("acquired instance lock {}", self.name);
                *slot = Some(lock);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.lock.lock().is_some()
    }

    /// Stop the wake-up listener and release the lock; idempotent
    pub fn unlock(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.cancel.cancel();
            if let Some(path) = listener.socket_path {
                let _ = std::fs::remove_file(path);
            }
        }
        if let Some(lock) = self.lock.lock().take() {
            lock.release();
            debug!("released instance lock {}", self.name);
        }
    }

    /// Start listening for wake-up tokens
    ///
    /// Must be called inside a tokio runtime. A bind failure is logged and
    /// reported as `false`; the caller keeps running.
    pub fn start_wakeup_listener(&self, callback: WakeupCallback) -> bool {
        let mut slot = self.listener.lock();
        if slot.is_some() {
            return true;
        }

        let cancel = CancellationToken::new();
        let bound = match &self.channel {
            WakeupChannel::Unix(path) => spawn_unix(path, callback, cancel.clone())
                .map(|()| Some(path.clone())),
            WakeupChannel::Tcp(ports) => spawn_tcp(ports, callback, cancel.clone()).map(|_| None),
        };

        match bound {
            Ok(socket_path) => {
                *slot = Some(WakeupListener {
                    cancel,
                    socket_path,
                });
                true
            }
            Err(e) => {
                warn!(
                    "failed to start wake-up listener: {}. Single-instance wake-up will not work",
                    e
                );
                false
            }
        }
    }

    /// Signal the running instance
    ///
    /// # Errors
    ///
    /// Returns [`InstanceError::Wakeup`] if no listener could be reached.
    pub async fn send_wakeup(&self) -> Result<(), InstanceError> {
        match &self.channel {
            WakeupChannel::Unix(path) => send_unix(path).await,
            WakeupChannel::Tcp(ports) => send_tcp(ports).await,
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.unlock();
    }
}

/// Read one token from a wake-up connection and fire the callback on a match
async fn handle_wakeup<S: AsyncRead + Unpin>(mut stream: S, callback: &WakeupCallback) {
    let mut buf = [0u8; 16];
    let n = match timeout(READ_DEADLINE, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("wake-up read failed: {}", e);
            return;
        }
        Err(_) => return,
    };

    if n > 0 && &buf[..n] == WAKEUP_TOKEN {
        info!("received wake-up signal");
        callback();
    }
}

#[cfg(unix)]
fn spawn_unix(
    path: &std::path::Path,
    callback: WakeupCallback,
    cancel: CancellationToken,
) -> Result<(), InstanceError> {
    use std::os::unix::fs::PermissionsExt;
    use tokio::net::UnixListener;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _ = std::fs::remove_file(path);

    let listener = UnixListener::bind(path)
        .map_err(|e| InstanceError::Wakeup(format!("{}: {e}", path.display())))?;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)) {
        debug!("failed to chmod {}: {}", path.display(), e);
    }
    info!("wake-up listener started on {}", path.display());

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => handle_wakeup(stream, &callback).await,
                    Err(e) => debug!("wake-up accept failed: {}", e),
                },
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_unix(
    path: &std::path::Path,
    _callback: WakeupCallback,
    _cancel: CancellationToken,
) -> Result<(), InstanceError> {
    Err(InstanceError::Wakeup(format!(
        "unix sockets are not available on this platform: {}",
        path.display()
    )))
}

fn spawn_tcp(
    ports: &[u16],
    callback: WakeupCallback,
    cancel: CancellationToken,
) -> Result<u16, InstanceError> {
    let mut listener = None;
    for &port in ports {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match std::net::TcpListener::bind(addr) {
            Ok(l) => {
                listener = Some((l, port));
                break;
            }
            Err(e) => debug!("wake-up port {} unavailable: {}, trying next", port, e),
        }
    }
    let Some((std_listener, port)) = listener else {
        return Err(InstanceError::Wakeup(format!(
            "no wake-up port available in {ports:?}"
        )));
    };

    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    info!("wake-up listener started on 127.0.0.1:{}", port);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => handle_wakeup(stream, &callback).await,
                    Err(e) => debug!("wake-up accept failed: {}", e),
                },
            }
        }
    });
    Ok(port)
}

#[cfg(unix)]
async fn send_unix(path: &std::path::Path) -> Result<(), InstanceError> {
    use tokio::net::UnixStream;

    let mut stream = match timeout(UNIX_DIAL_TIMEOUT, UnixStream::connect(path)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(InstanceError::Wakeup(format!(
                "cannot reach running instance at {}: {e}",
                path.display()
            )))
        }
        Err(_) => {
            return Err(InstanceError::Wakeup(format!(
                "timed out connecting to {}",
                path.display()
            )))
        }
    };
    write_token(&mut stream).await
}

#[cfg(not(unix))]
async fn send_unix(path: &std::path::Path) -> Result<(), InstanceError> {
    Err(InstanceError::Wakeup(format!(
        "unix sockets are not available on this platform: {}",
        path.display()
    )))
}

async fn send_tcp(ports: &[u16]) -> Result<(), InstanceError> {
    for &port in ports {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let Ok(Ok(mut stream)) = timeout(TCP_DIAL_TIMEOUT, TcpStream::connect(addr)).await else {
            continue;
        };
        match write_token(&mut stream).await {
            Ok(()) => {
                debug!("wake-up signal sent to port {}", port);
                return Ok(());
            }
            Err(e) => debug!("wake-up send to port {} failed: {}", port, e),
        }
    }
    Err(InstanceError::Wakeup(format!(
        "could not send wake-up signal to any of {ports:?}"
    )))
}

async fn write_token<S: tokio::io::AsyncWrite + Unpin>(stream: &mut S) -> Result<(), InstanceError> {
    match timeout(READ_DEADLINE, async {
        stream.write_all(WAKEUP_TOKEN).await?;
        stream.shutdown().await
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(InstanceError::Wakeup("write timed out".into())),
    }
}
