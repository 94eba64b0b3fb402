//! Serial port transport
//!
//! Direct hardware connection to CNC controllers via USB or RS-232.
//! Reads run on a blocking task with a short timeout so closure is
//! detected promptly; writes are small and performed inline.

use cncd_core::{Error, Result};
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{Transport, TransportEvent};

const READ_TIMEOUT: Duration = Duration::from_millis(50);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct SerialPortInfo {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    pub port_name: String,
    /// Port description (e.g., "USB Serial Port")
    pub description: String,
    /// Manufacturer name if available
    pub manufacturer: Option<String>,
}

/// List available serial ports on the system
///
/// Filters ports to CNC controller patterns:
/// - Windows: COM*
/// - Linux: /dev/ttyUSB*, /dev/ttyACM*
/// - macOS: /dev/cu.usbserial-*, /dev/cu.usbmodem*
pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports()
        .map_err(|e| Error::transport(format!("failed to enumerate ports: {e}")))?;

    Ok(ports
        .iter()
        .filter(|port| is_valid_cnc_port(&port.port_name))
        .map(|port| {
            let (description, manufacturer) = match &port.port_type {
                serialport::SerialPortType::UsbPort(usb) => (
                    format!(
                        "USB {} {}",
                        usb.manufacturer.as_deref().unwrap_or("Device"),
                        usb.product.as_deref().unwrap_or("Serial Port")
                    ),
                    usb.manufacturer.clone(),
                ),
                serialport::SerialPortType::BluetoothPort => {
                    ("Bluetooth Serial".to_string(), None)
                }
                serialport::SerialPortType::PciPort => ("PCI Serial".to_string(), None),
                _ => ("Serial Port".to_string(), None),
            };
            SerialPortInfo {
                port_name: port.port_name.clone(),
                description,
                manufacturer,
            }
        })
        .collect())
}

fn is_valid_cnc_port(port_name: &str) -> bool {
    if port_name.starts_with("COM") && port_name[3..].chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if port_name.starts_with("/dev/ttyUSB") || port_name.starts_with("/dev/ttyACM") {
        return true;
    }
    if port_name.starts_with("/dev/cu.usbserial-") || port_name.starts_with("/dev/cu.usbmodem") {
        return true;
    }
    false
}

/// Serial transport backed by the `serialport` crate
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    shutdown: Arc<AtomicBool>,
}

impl SerialTransport {
    /// Open `path` at `baud_rate` and start the reader task.
    pub fn open(
        path: &str,
        baud_rate: u32,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| Error::transport(format!("failed to open port {path}: {e}")))?;

        let reader = port
            .try_clone()
            .map_err(|e| Error::transport(format!("failed to clone port {path}: {e}")))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        spawn_reader(reader, tx, shutdown.clone());

        Ok((Self { port, shutdown }, rx))
    }
}

fn spawn_reader(
    mut port: Box<dyn serialport::SerialPort>,
    tx: mpsc::Sender<TransportEvent>,
    shutdown: Arc<AtomicBool>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            match port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    if tx.blocking_send(TransportEvent::Data(buf[..n].to_vec())).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!("serial read failed: {e}");
                    let _ = tx.blocking_send(TransportEvent::Closed(Some(Error::transport(
                        format!("serial read failed: {e}"),
                    ))));
                    break;
                }
            }
        }
    });
}

#[async_trait::async_trait]
impl Transport for SerialTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.port
            .write_all(data)
            .map_err(|e| Error::transport(format!("serial write failed: {e}")))?;
        self.port
            .flush()
            .map_err(|e| Error::transport(format!("serial flush failed: {e}")))
    }

    async fn close(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cnc_port_patterns() {
        assert!(is_valid_cnc_port("COM3"));
        assert!(is_valid_cnc_port("/dev/ttyUSB0"));
        assert!(is_valid_cnc_port("/dev/ttyACM1"));
        assert!(is_valid_cnc_port("/dev/cu.usbmodem14101"));
        assert!(!is_valid_cnc_port("/dev/ttyS0"));
        assert!(!is_valid_cnc_port("COMX"));
    }
}
