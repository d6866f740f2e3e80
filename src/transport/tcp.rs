//! Pub/sub socket transport
//!
//! Each publisher binds two listening sockets, one per stream. Every accepted
//! subscriber connection gets a writer task fed from a broadcast channel, so a
//! message is encoded once and shared by all connections.
//!
//! Envelope of one message (big-endian):
//!
//! ```text
//! u32 frame count
//! repeat: u32 frame length, frame bytes
//! ```
//!
//! A freshly accepted connection first receives an empty envelope (count 0);
//! the subscriber waits for it so nothing published after the connect
//! returns can be missed.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;

use super::link::{FrameSource, LinkTable};
use super::{ConsumerTransport, Inbound, PublisherTransport, Stream, TransportKind};
use crate::config::TcpConfig;
use crate::error::{Error, Result, WireError};
use crate::event::types::heartbeat_name;

/// Largest accepted frame
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Most frames accepted in one envelope
const MAX_FRAMES: usize = 16;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Encode a message envelope
pub fn encode_envelope(frames: &[Bytes]) -> Bytes {
    let size = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32(frames.len() as u32);
    for frame in frames {
        buf.put_u32(frame.len() as u32);
        buf.put_slice(frame);
    }
    buf.freeze()
}

/// Read one message envelope
pub async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<Bytes>> {
    let count = reader.read_u32().await? as usize;
    if count > MAX_FRAMES {
        return Err(WireError::FrameCount {
            expected: MAX_FRAMES,
            actual: count,
        }
        .into());
    }
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        let len = reader.read_u32().await? as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::TooLarge(len).into());
        }
        let mut frame = vec![0u8; len];
        reader.read_exact(&mut frame).await?;
        frames.push(Bytes::from(frame));
    }
    Ok(frames)
}

/// Bind a listener inside the configured port range
async fn bind_listener(config: &TcpConfig) -> Result<TcpListener> {
    let host = config.bind_host.as_str();
    match &config.port_range {
        None => TcpListener::bind((host, 0))
            .await
            .map_err(|e| Error::EventSystemFailed(format!("cannot bind {}: {}", host, e))),
        Some(range) => {
            for port in range.clone() {
                if let Ok(listener) = TcpListener::bind((host, port)).await {
                    return Ok(listener);
                }
            }
            Err(Error::EventSystemFailed(format!(
                "no free port in {}..={} on {}",
                range.start(),
                range.end(),
                host
            )))
        }
    }
}

fn endpoint_of(addr: SocketAddr) -> String {
    let ip = if addr.ip().is_unspecified() {
        "127.0.0.1".to_string()
    } else {
        addr.ip().to_string()
    };
    format!("tcp://{}:{}", ip, addr.port())
}

/// One listening socket of a publisher
struct PubSocket {
    endpoint: String,
    tx: Mutex<Option<broadcast::Sender<Bytes>>>,
    accept_task: JoinHandle<()>,
}

impl PubSocket {
    async fn bind(config: &TcpConfig, capacity: usize) -> Result<Self> {
        let listener = bind_listener(config).await?;
        let addr = listener.local_addr()?;
        let endpoint = endpoint_of(addr);
        let (tx, _) = broadcast::channel(capacity.max(1));

        tracing::info!(endpoint = %endpoint, "Publisher socket listening");

        let accept_task = tokio::spawn(accept_loop(listener, endpoint.clone(), tx.clone()));
        Ok(Self {
            endpoint,
            tx: Mutex::new(Some(tx)),
            accept_task,
        })
    }

    fn send(&self, envelope: Bytes) -> Result<()> {
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => {
                // Err only means no connected subscriber
                let _ = tx.send(envelope);
                Ok(())
            }
            None => Err(Error::CommunicationFailed(format!(
                "socket {} closed",
                self.endpoint
            ))),
        }
    }

    fn close(&self) {
        self.accept_task.abort();
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

async fn accept_loop(listener: TcpListener, endpoint: String, tx: broadcast::Sender<Bytes>) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let rx = tx.subscribe();
                tracing::debug!(endpoint = %endpoint, peer = %peer, "Subscriber connected");
                tokio::spawn(write_loop(socket, peer, rx));
            }
            Err(e) => {
                tracing::error!(endpoint = %endpoint, error = %e, "Failed to accept connection");
            }
        }
    }
}

async fn write_loop(mut socket: TcpStream, peer: SocketAddr, mut rx: broadcast::Receiver<Bytes>) {
    if let Err(e) = socket.set_nodelay(true) {
        tracing::warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
    }
    if socket.write_all(&encode_envelope(&[])).await.is_err() {
        return;
    }
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                if let Err(e) = socket.write_all(&envelope).await {
                    tracing::debug!(peer = %peer, error = %e, "Subscriber disconnected");
                    break;
                }
            }
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(peer = %peer, skipped = n, "Subscriber lagging, messages dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Publisher over pub/sub sockets
pub struct TcpPublisher {
    heartbeat: PubSocket,
    event: PubSocket,
}

impl TcpPublisher {
    pub async fn bind(config: &TcpConfig, capacity: usize) -> Result<Self> {
        let heartbeat = PubSocket::bind(config, capacity).await?;
        let event = match PubSocket::bind(config, capacity).await {
            Ok(s) => s,
            Err(e) => {
                heartbeat.close();
                return Err(e);
            }
        };
        Ok(Self { heartbeat, event })
    }
}

#[async_trait]
impl PublisherTransport for TcpPublisher {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    fn heartbeat_endpoint(&self) -> &str {
        &self.heartbeat.endpoint
    }

    fn event_endpoint(&self) -> &str {
        &self.event.endpoint
    }

    async fn publish(&self, stream: Stream, frames: Vec<Bytes>) -> Result<()> {
        let envelope = encode_envelope(&frames);
        match stream {
            Stream::Heartbeat => self.heartbeat.send(envelope),
            Stream::Event => self.event.send(envelope),
        }
    }

    async fn close(&self) {
        self.heartbeat.close();
        self.event.close();
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        self.heartbeat.accept_task.abort();
        self.event.accept_task.abort();
    }
}

struct SocketSource {
    endpoint: String,
    reader: BufReader<TcpStream>,
}

impl SocketSource {
    async fn connect(endpoint: &str) -> Result<Self> {
        let addr = endpoint
            .strip_prefix("tcp://")
            .ok_or_else(|| Error::connection(endpoint, "not a tcp endpoint"))?;

        let connect = async {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            let mut reader = BufReader::new(stream);
            let greeting = read_envelope(&mut reader).await?;
            if !greeting.is_empty() {
                return Err(Error::from(WireError::FrameCount {
                    expected: 0,
                    actual: greeting.len(),
                }));
            }
            Ok::<_, Error>(reader)
        };

        let reader = tokio::time::timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| Error::connection(endpoint, "connect timed out"))?
            .map_err(|e| Error::connection(endpoint, e.to_string()))?;

        Ok(Self {
            endpoint: endpoint.to_string(),
            reader,
        })
    }
}

#[async_trait]
impl FrameSource for SocketSource {
    async fn next_frames(&mut self) -> Option<Vec<Bytes>> {
        match read_envelope(&mut self.reader).await {
            Ok(frames) => Some(frames),
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!(endpoint = %self.endpoint, "Publisher closed connection");
                None
            }
            Err(e) => {
                tracing::warn!(endpoint = %self.endpoint, error = %e, "Dropping publisher connection");
                None
            }
        }
    }
}

/// Consumer over pub/sub sockets
pub struct TcpConsumer {
    links: LinkTable,
}

impl TcpConsumer {
    pub fn new(inbound: Inbound) -> Self {
        Self {
            links: LinkTable::new(inbound),
        }
    }
}

#[async_trait]
impl ConsumerTransport for TcpConsumer {
    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }

    async fn connect_channel(&self, channel: &str, heartbeat_endpoint: &str) -> Result<()> {
        self.links
            .attach(heartbeat_endpoint, &heartbeat_name(channel), || {
                SocketSource::connect(heartbeat_endpoint)
            })
            .await
    }

    async fn disconnect_channel(&self, channel: &str, heartbeat_endpoint: &str) {
        self.links
            .detach(heartbeat_endpoint, &heartbeat_name(channel))
            .await;
    }

    async fn connect_event(&self, event_name: &str, endpoint: &str) -> Result<()> {
        self.links
            .attach(endpoint, event_name, || SocketSource::connect(endpoint))
            .await
    }

    async fn disconnect_event(&self, event_name: &str, endpoint: &str) {
        self.links.detach(endpoint, event_name).await;
    }

    async fn close(&self) {
        self.links.close_all().await;
    }
}
