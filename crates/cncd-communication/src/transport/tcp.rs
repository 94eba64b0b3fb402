//! TCP transport
//!
//! Network connection to controllers exposed over a serial-to-TCP bridge
//! (common for Smoothieboards and ESP-based Grbl ports).

use cncd_core::{Error, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{Transport, TransportEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// TCP transport backed by tokio
pub struct TcpTransport {
    writer: Option<OwnedWriteHalf>,
}

impl TcpTransport {
    /// Connect to `host:port` and start the reader task.
    pub async fn open(
        host: &str,
        port: u16,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>)> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::transport(format!("failed to connect {host}:{port}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| Error::transport(format!("failed to set nodelay: {e}")))?;

        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => {
                        let _ = tx.send(TransportEvent::Closed(None)).await;
                        break;
                    }
                    Ok(n) => {
                        if tx.send(TransportEvent::Data(buf[..n].to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx
                            .send(TransportEvent::Closed(Some(Error::transport(format!(
                                "tcp read failed: {e}"
                            )))))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok((Self { writer: Some(writer) }, rx))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.writer.as_mut() {
            Some(w) => w
                .write_all(data)
                .await
                .map_err(|e| Error::transport(format!("tcp write failed: {e}"))),
            None => Err(Error::transport("tcp connection already closed")),
        }
    }

    async fn close(&mut self) {
        if let Some(mut w) = self.writer.take() {
            let _ = w.shutdown().await;
        }
    }
}
