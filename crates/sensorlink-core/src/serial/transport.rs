//! Serial backend abstraction
//!
//! The manager never touches the OS directly. It asks a [`SerialBackend`] to
//! enumerate ports and to open one, and gets back an async byte stream. The
//! default [`SystemSerial`] backend uses `serialport`/`tokio-serial`; tests
//! plug in scripted backends over in-memory pipes.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use super::{discovery, LinkError, PortInfo};

/// Byte stream of an open port
pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> SerialIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Source of serial ports
#[async_trait]
pub trait SerialBackend: Send + Sync {
    /// Enumerate available ports in a stable order
    async fn list_ports(&self) -> Result<Vec<PortInfo>, LinkError>;

    /// Open `path` at `baud_rate`
    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialIo>, LinkError>;
}

/// Backend for the machine's real serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerial;

#[async_trait]
impl SerialBackend for SystemSerial {
    async fn list_ports(&self) -> Result<Vec<PortInfo>, LinkError> {
        // Enumeration walks sysfs/registry and may block
        tokio::task::spawn_blocking(discovery::list_ports)
            .await
            .map_err(|e| LinkError::DiscoveryFailed(e.to_string()))?
    }

    async fn open(&self, path: &str, baud_rate: u32) -> Result<Box<dyn SerialIo>, LinkError> {
        let owned_path = path.to_string();
        let stream = tokio::task::spawn_blocking(move || {
            let mut stream = tokio_serial::new(&owned_path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| LinkError::OpenFailed {
                    path: owned_path.clone(),
                    reason: e.to_string(),
                })?;

            // Keep DTR asserted so boards with auto-reset do not drop into
            // their bootloader while we hold the port
            if let Err(e) = stream.write_data_terminal_ready(true) {
                tracing::debug!("{owned_path}: failed to set DTR high: {e} (continuing)");
            }
            Ok::<_, LinkError>(stream)
        })
        .await
        .map_err(|e| LinkError::OpenFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })??;

        Ok(Box::new(stream))
    }
}
