//! Single-instance lock and wake-up channel

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use portwarden::config::{InstanceConfig, TransportKind};
use portwarden::Instance;

use super::support::{eventually, isolated_settings};

#[tokio::test]
async fn test_second_launch_wakes_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = isolated_settings(dir.path());
    settings.instance.wakeup_transport = TransportKind::Tcp;

    let first = Instance::new(&settings.instance);
    assert!(first.try_lock().unwrap());

    let woken = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&woken);
    assert!(first.start_wakeup_listener(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    let second = Instance::new(&settings.instance);
    assert!(!second.try_lock().unwrap());
    second.send_wakeup().await.unwrap();

    assert!(eventually(|| woken.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(woken.load(Ordering::SeqCst), 1);

    first.unlock();
    assert!(second.try_lock().unwrap());
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_wakeup_channel() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = isolated_settings(dir.path());
    settings.instance.wakeup_transport = TransportKind::Unix;

    let first = Instance::new(&settings.instance);
    assert!(first.try_lock().unwrap());

    let woken = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&woken);
    assert!(first.start_wakeup_listener(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    Instance::new(&settings.instance).send_wakeup().await.unwrap();
    assert!(eventually(|| woken.load(Ordering::SeqCst) == 1).await);

    drop(first);
    assert!(!dir.path().join("portwarden-wakeup.sock").exists());
    // the lock file stays so every later owner locks the same inode
    assert!(dir.path().join("portwarden.lock").exists());
    assert!(Instance::new(&settings.instance).try_lock().unwrap());
}

/// Instance settings handed to a re-executed copy of this test binary
const CONTENDER_ENV: &str = "PORTWARDEN_TEST_CONTENDER";

/// Second launch, run in its own process by `test_second_process_wakes_first`
///
/// Does nothing unless the parent test set [`CONTENDER_ENV`].
#[tokio::test]
async fn second_process_contender() {
    let Ok(raw) = std::env::var(CONTENDER_ENV) else {
        return;
    };
    let config: InstanceConfig = serde_json::from_str(&raw).unwrap();

    let instance = Instance::new(&config);
    assert!(!instance.try_lock().unwrap(), "lock not held by parent");
    instance.send_wakeup().await.unwrap();
}

#[tokio::test]
async fn test_second_process_wakes_first() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = isolated_settings(dir.path());
    settings.instance.wakeup_transport = if cfg!(unix) {
        TransportKind::Unix
    } else {
        TransportKind::Tcp
    };

    let first = Instance::new(&settings.instance);
    assert!(first.try_lock().unwrap());

    let woken = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&woken);
    assert!(first.start_wakeup_listener(Arc::new(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    })));

    let output = tokio::process::Command::new(std::env::current_exe().unwrap())
        .args([
            "--exact",
            "integration::single_instance::second_process_contender",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(CONTENDER_ENV, serde_json::to_string(&settings.instance).unwrap())
        .output();
    let output = tokio::time::timeout(Duration::from_secs(30), output)
        .await
        .expect("contender process timed out")
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "contender failed: {stdout}{}",
        String::from_utf8_lossy(&output.stderr)
    );
    // an exact filter that matched nothing would also exit cleanly
    assert!(stdout.contains("1 passed"), "contender did not run: {stdout}");

    assert!(eventually(|| woken.load(Ordering::SeqCst) == 1).await);
    assert!(first.is_locked());
}
