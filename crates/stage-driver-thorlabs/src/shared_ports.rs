//! Shared port management for RS-485 multidrop bus devices.
//!
//! Several ELL14 axes can sit on one serial port, each with its own bus
//! address. This module keeps a registry of open ports so every link on the
//! same path shares one connection behind an async mutex.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::Mutex;

/// Trait for types that can be used as async serial ports.
///
/// Includes `tokio_serial::SerialStream` and `tokio::io::DuplexStream` (tests).
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Dynamic serial port type.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Shared serial port wrapped in async mutex.
pub type SharedPort = Arc<Mutex<DynSerial>>;

/// Default per-read timeout for ELL14 ports.
pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_millis(500);

/// Module-local registry for shared serial ports.
static SHARED_PORTS: OnceLock<RwLock<HashMap<String, SharedPort>>> = OnceLock::new();

fn port_registry() -> &'static RwLock<HashMap<String, SharedPort>> {
    SHARED_PORTS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Wrap any serial-like stream as a shared port.
pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(port))
}

/// Get an existing shared port if one is already open for the given path.
pub fn get_existing_port(port_path: &str) -> Option<SharedPort> {
    port_registry().read().get(port_path).cloned()
}

/// Register a newly opened port in the shared registry.
pub fn register_port(port_path: &str, port: SharedPort) {
    port_registry().write().insert(port_path.to_string(), port);
    tracing::info!(port = port_path, "Registered ELL14 shared port");
}

/// Remove a port from the registry (e.g., when it becomes stale).
pub fn remove_port(port_path: &str) -> bool {
    let removed = port_registry().write().remove(port_path).is_some();
    if removed {
        tracing::info!(port = port_path, "Removed ELL14 shared port from registry");
    }
    removed
}

/// Drop the registry entry for `port_path` if `port` is its last outside user.
///
/// Called when a link closes. Other axes on the same bus keep the port open.
pub fn release_port(port_path: &str, port: &SharedPort) -> bool {
    let mut registry = port_registry().write();
    let is_same = registry
        .get(port_path)
        .is_some_and(|registered| Arc::ptr_eq(registered, port));
    // One reference in the registry, one held by the caller
    if is_same && Arc::strong_count(port) <= 2 {
        registry.remove(port_path);
        tracing::info!(port = port_path, "Released ELL14 shared port");
        return true;
    }
    false
}

/// Get or create a shared port for the given path.
///
/// If a port is already open for this path, performs a health check and returns
/// the existing connection if healthy. Otherwise, opens a new port and registers it.
pub async fn get_or_open_port(port_path: &str, timeout: Duration) -> anyhow::Result<SharedPort> {
    use tokio::io::AsyncWriteExt;

    if let Some(port) = get_existing_port(port_path) {
        // Health check: try to flush the port to verify it's still connected
        let health_check = async {
            let mut guard = port.lock().await;
            guard.flush().await
        };

        match tokio::time::timeout(Duration::from_millis(100), health_check).await {
            Ok(Ok(())) => {
                tracing::debug!(port = port_path, "Reusing healthy ELL14 shared port");
                return Ok(port);
            }
            Ok(Err(e)) => {
                tracing::warn!(port = port_path, error = %e, "ELL14 shared port health check failed, reopening");
                remove_port(port_path);
            }
            Err(_) => {
                tracing::warn!(port = port_path, "ELL14 shared port health check timed out, reopening");
                remove_port(port_path);
            }
        }
    }

    let port_path_owned = port_path.to_string();
    let port =
        tokio::task::spawn_blocking(move || open_serial_port(&port_path_owned, timeout)).await??;

    let shared = wrap_shared(Box::new(port));
    register_port(port_path, shared.clone());

    Ok(shared)
}

/// Open a serial port with ELL14 settings: 9600 baud, 8N1, no flow control.
fn open_serial_port(
    port_path: &str,
    timeout: Duration,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio_serial::SerialPortBuilderExt;

    let port = tokio_serial::new(port_path, 9600)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .timeout(timeout)
        .open_native_async()
        .with_context(|| format!("Failed to open ELL14 serial port {}", port_path))?;

    tracing::info!(port = port_path, timeout_ms = ?timeout.as_millis(), "Opened ELL14 serial port");
    Ok(port)
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives within `window`. Returns the
/// number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, window: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + window;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }

        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

/// Get the number of currently open shared ports.
pub fn port_count() -> usize {
    SHARED_PORTS.get().map(|r| r.read().len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_registered_port_is_reused() {
        let (_host, device) = tokio::io::duplex(64);
        let shared = wrap_shared(Box::new(device));
        register_port("test://reuse", shared.clone());

        let again = get_or_open_port("test://reuse", DEFAULT_PORT_TIMEOUT)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&shared, &again));
        drop(again);

        assert!(release_port("test://reuse", &shared));
        assert!(get_existing_port("test://reuse").is_none());
    }

    #[tokio::test]
    async fn test_release_keeps_port_with_other_users() {
        let (_host, device) = tokio::io::duplex(64);
        let shared = wrap_shared(Box::new(device));
        register_port("test://multidrop", shared.clone());
        let second_axis = shared.clone();

        assert!(!release_port("test://multidrop", &shared));
        assert!(get_existing_port("test://multidrop").is_some());

        drop(second_axis);
        assert!(release_port("test://multidrop", &shared));
    }

    #[tokio::test]
    async fn test_missing_port_fails_to_open() {
        let result = get_or_open_port("/dev/definitely-not-a-port", DEFAULT_PORT_TIMEOUT).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_drain_serial_buffer() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"2GS09\r\n").await.unwrap();

        let discarded = drain_serial_buffer(&mut device, Duration::from_millis(20)).await;
        assert_eq!(discarded, 7);
    }
}
