//! Byte-level transports
//!
//! A transport is a duplex byte channel to the controller firmware: writes
//! go through [`Transport::write`], inbound bytes and closure arrive on an
//! event channel. Two variants exist: a serial port and a TCP peer. Each
//! open connection is identified by a deterministic ident derived from its
//! options (`serial:/dev/ttyUSB0@115200`, `tcp:192.168.0.10:23`), which is
//! the handle clients pass back for every operation.

pub mod serial;
pub mod tcp;

use async_trait::async_trait;
use cncd_core::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use serial::{list_ports, SerialPortInfo};

/// Options describing where a connection goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConnectionOptions {
    /// Serial port with path and baud rate
    Serial {
        /// Device path (`/dev/ttyUSB0`, `COM3`)
        path: String,
        /// Baud rate
        baud_rate: u32,
    },
    /// TCP peer with host and port
    Tcp {
        /// Hostname or address
        host: String,
        /// TCP port
        port: u16,
    },
}

impl ConnectionOptions {
    /// Derive the canonical ident for these options.
    ///
    /// The ident is stable across reconnects and is the unique handle in
    /// the controller registry.
    pub fn ident(&self) -> String {
        match self {
            Self::Serial { path, baud_rate } => format!("serial:{path}@{baud_rate}"),
            Self::Tcp { host, port } => format!("tcp:{host}:{port}"),
        }
    }
}

/// Inbound transport events, delivered in wire order.
#[derive(Debug)]
pub enum TransportEvent {
    /// Bytes read from the wire
    Data(Vec<u8>),
    /// The link closed; `Some` when an error caused it
    Closed(Option<Error>),
}

/// Write half of an open transport.
///
/// Writes are best-effort and non-blocking from the controller's point of
/// view; backpressure is handled by the streaming flow-control protocol,
/// not the OS buffer.
#[async_trait]
pub trait Transport: Send {
    /// Write bytes to the wire
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Close the link. Idempotent.
    async fn close(&mut self);
}

/// Open a transport for `options`.
///
/// Returns the write half and the inbound event channel.
pub async fn open(
    options: &ConnectionOptions,
) -> Result<(Box<dyn Transport>, mpsc::Receiver<TransportEvent>)> {
    match options {
        ConnectionOptions::Serial { path, baud_rate } => {
            let (t, rx) = serial::SerialTransport::open(path, *baud_rate)?;
            Ok((Box::new(t), rx))
        }
        ConnectionOptions::Tcp { host, port } => {
            let (t, rx) = tcp::TcpTransport::open(host, *port).await?;
            Ok((Box::new(t), rx))
        }
    }
}

/// Accumulates raw bytes and yields complete lines.
///
/// Input is split on LF; a trailing CR is dropped so CRLF and LF framing
/// both work.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: String,
}

impl LineBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Push bytes, returning any lines completed by them
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(data));

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=pos).collect();
            line.pop(); // LF
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ident_is_deterministic() {
        let serial = ConnectionOptions::Serial {
            path: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
        };
        assert_eq!(serial.ident(), "serial:/dev/ttyUSB0@115200");

        let tcp = ConnectionOptions::Tcp {
            host: "192.168.0.10".to_string(),
            port: 23,
        };
        assert_eq!(tcp.ident(), "tcp:192.168.0.10:23");
    }

    #[test]
    fn line_buffer_splits_crlf_and_lf() {
        let mut lb = LineBuffer::new();
        assert!(lb.push(b"ok\r\npartial").iter().eq(["ok"].iter()));
        let lines = lb.push(b" line\nnext\n");
        assert_eq!(lines, vec!["partial line".to_string(), "next".to_string()]);
    }

    #[test]
    fn line_buffer_holds_incomplete_input() {
        let mut lb = LineBuffer::new();
        assert!(lb.push(b"<Idle|MPos:").is_empty());
        assert_eq!(lb.push(b"0,0,0>\n"), vec!["<Idle|MPos:0,0,0>".to_string()]);
    }
}
