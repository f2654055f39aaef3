//! Frame transports
//!
//! A transport moves whole text frames between two peers, reliably and in
//! order. Framing beyond that is the transport's business: the in-process
//! channel pair passes strings as they are, the TCP transport writes one JSON
//! document per line.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// An ordered, reliable, bidirectional frame channel.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    /// Wait for the next frame. Fails with [`TransportError::Disconnected`]
    /// once the peer has gone away.
    async fn recv(&self) -> Result<String, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// In-process transport backed by tokio mpsc channels.
pub struct ChannelTransport {
    tx: std::sync::Mutex<Option<mpsc::Sender<String>>>,
    rx: Mutex<mpsc::Receiver<String>>,
    connected: Arc<AtomicBool>,
    peer_connected: Arc<AtomicBool>,
}

impl ChannelTransport {
    /// Create a connected pair of transports.
    pub fn pair() -> (ChannelTransport, ChannelTransport) {
        let (tx_ab, rx_ab) = mpsc::channel(256);
        let (tx_ba, rx_ba) = mpsc::channel(256);
        let connected_a = Arc::new(AtomicBool::new(true));
        let connected_b = Arc::new(AtomicBool::new(true));

        let a = ChannelTransport {
            tx: std::sync::Mutex::new(Some(tx_ab)),
            rx: Mutex::new(rx_ba),
            connected: Arc::clone(&connected_a),
            peer_connected: Arc::clone(&connected_b),
        };
        let b = ChannelTransport {
            tx: std::sync::Mutex::new(Some(tx_ba)),
            rx: Mutex::new(rx_ab),
            connected: connected_b,
            peer_connected: connected_a,
        };
        (a, b)
    }

    fn sender(&self) -> Result<mpsc::Sender<String>, TransportError> {
        let tx = self.tx.lock().map_err(|_| TransportError::Disconnected)?;
        tx.clone().ok_or(TransportError::Disconnected)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.sender()?
            .send(frame)
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the sender ends the peer's receive loop.
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.peer_connected.load(Ordering::SeqCst)
    }
}

/// TCP transport carrying one frame per line.
pub struct TcpTransport {
    reader: Mutex<Lines<BufReader<OwnedReadHalf>>>,
    writer: Mutex<OwnedWriteHalf>,
    connected: AtomicBool,
    peer: String,
}

impl TcpTransport {
    /// Connect to `addr`, which may carry a `tcp://` prefix.
    pub async fn connect(addr: &str) -> Result<Self, TransportError> {
        let target = addr.strip_prefix("tcp://").unwrap_or(addr);
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{target}: {e}")))?;
        log::info!("Connected to {}", target);
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: Mutex::new(BufReader::new(read_half).lines()),
            writer: Mutex::new(write_half),
            connected: AtomicBool::new(true),
            peer,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(frame.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn recv(&self) -> Result<String, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(line),
                None => {
                    self.connected.store(false, Ordering::SeqCst);
                    return Err(TransportError::Disconnected);
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        log::debug!("Closed connection to {}", self.peer);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
