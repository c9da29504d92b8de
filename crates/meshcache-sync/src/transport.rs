//! TCP transport for sync frames.
//!
//! Sessions are short-lived: dial, exchange `Hello`, send one or more
//! frames, close. Frames are a 4-byte big-endian length prefix followed by
//! the (optionally sealed) magic-prefixed envelope body. Every network
//! operation carries a deadline; a peer exceeding it is abandoned, which
//! only affects operations targeting that peer.

use crate::cipher::FrameCipher;
use crate::wire::{SyncEnvelope, SyncPayload, MAX_FRAME_SIZE};
use async_trait::async_trait;
use meshcache_core::{CacheError, CacheResult, PeerId};
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Receives inbound payloads and optionally produces a reply frame.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one payload from `from`. `source_ip` is the remote address
    /// of the carrying connection, used to build dial-back addresses.
    async fn handle(
        &self,
        from: PeerId,
        source_ip: IpAddr,
        payload: SyncPayload,
    ) -> Option<SyncPayload>;
}

/// TCP transport bound to one listen socket.
pub struct TcpTransport {
    local_id: PeerId,
    cipher: Arc<FrameCipher>,
    io_timeout: Duration,
    local_addr: RwLock<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Create an unbound transport.
    pub fn new(local_id: PeerId, cipher: FrameCipher, io_timeout: Duration) -> Self {
        Self {
            local_id,
            cipher: Arc::new(cipher),
            io_timeout,
            local_addr: RwLock::new(None),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the listener and start accepting sessions.
    ///
    /// Port 0 lets the OS pick; the chosen address is returned and
    /// advertised in later `Hello` frames.
    pub async fn bind(
        self: &Arc<Self>,
        port: u16,
        handler: Arc<dyn MessageHandler>,
    ) -> CacheResult<SocketAddr> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| CacheError::network(format!("Failed to bind port {}: {}", port, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| CacheError::network(format!("Listener has no local addr: {}", e)))?;
        *self.local_addr.write() = Some(local_addr);

        let transport = Arc::clone(self);
        let accept = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let transport = Arc::clone(&transport);
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) =
                                transport.serve_session(stream, peer_addr, handler).await
                            {
                                debug!(peer_addr = %peer_addr, error = %e, "Inbound session ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
        });
        *self.accept_task.lock() = Some(accept);

        info!(addr = %local_addr, "Sync transport listening");
        Ok(local_addr)
    }

    /// Port the listener is bound to, once bound.
    pub fn local_port(&self) -> Option<u16> {
        self.local_addr.read().map(|a| a.port())
    }

    /// Stop accepting sessions.
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        *self.local_addr.write() = None;
    }

    /// Fire-and-forget send: dial, handshake, deliver, close.
    /// Returns the responding peer's id.
    pub async fn notify(&self, addr: &str, payload: SyncPayload) -> CacheResult<PeerId> {
        let (mut stream, peer_id) = self.open_session(addr).await?;
        self.write_frame(&mut stream, &SyncEnvelope::new(self.local_id, payload))
            .await?;
        Ok(peer_id)
    }

    /// Request/response: dial, handshake, deliver, await one reply frame.
    pub async fn request(&self, addr: &str, payload: SyncPayload) -> CacheResult<SyncEnvelope> {
        let (mut stream, _peer_id) = self.open_session(addr).await?;
        self.write_frame(&mut stream, &SyncEnvelope::new(self.local_id, payload))
            .await?;
        self.read_frame(&mut stream).await
    }

    /// Dial and exchange `Hello` frames.
    async fn open_session(&self, addr: &str) -> CacheResult<(TcpStream, PeerId)> {
        let dial = TcpStream::connect(addr);
        let mut stream = timeout(self.io_timeout, dial)
            .await
            .map_err(|_| CacheError::network(format!("Dial timeout for {}", addr)))?
            .map_err(|e| CacheError::network(format!("Dial failed for {}: {}", addr, e)))?;

        let hello = SyncEnvelope::new(
            self.local_id,
            SyncPayload::Hello {
                listen_port: self.local_port().unwrap_or(0),
            },
        );
        self.write_frame(&mut stream, &hello).await?;

        let reply = self.read_frame(&mut stream).await?;
        match reply.payload {
            SyncPayload::Hello { .. } => Ok((stream, reply.from)),
            _ => Err(CacheError::network("Peer did not complete handshake")),
        }
    }

    /// Serve one inbound session until the peer closes it.
    async fn serve_session(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
        handler: Arc<dyn MessageHandler>,
    ) -> CacheResult<()> {
        // First frame must be the handshake.
        let first = self.read_frame(&mut stream).await?;
        let SyncPayload::Hello { .. } = first.payload else {
            return Err(CacheError::network("Session did not start with Hello"));
        };
        let peer_id = first.from;

        let hello = SyncEnvelope::new(
            self.local_id,
            SyncPayload::Hello {
                listen_port: self.local_port().unwrap_or(0),
            },
        );
        self.write_frame(&mut stream, &hello).await?;
        handler
            .handle(peer_id, peer_addr.ip(), first.payload)
            .await;

        loop {
            let envelope = match self.read_frame(&mut stream).await {
                Ok(envelope) => envelope,
                // Peer closed or timed out; the session is simply over.
                Err(_) => return Ok(()),
            };
            if envelope.from != peer_id {
                return Err(CacheError::network("Peer id changed mid-session"));
            }
            if let Some(reply) = handler
                .handle(peer_id, peer_addr.ip(), envelope.payload)
                .await
            {
                self.write_frame(&mut stream, &SyncEnvelope::new(self.local_id, reply))
                    .await?;
            }
        }
    }

    async fn write_frame(&self, stream: &mut TcpStream, envelope: &SyncEnvelope) -> CacheResult<()> {
        let body = self.cipher.seal(&envelope.encode()?)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(CacheError::network(format!(
                "Frame too large: {} bytes",
                body.len()
            )));
        }

        let write = async {
            stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
            stream.write_all(&body).await?;
            stream.flush().await
        };
        timeout(self.io_timeout, write)
            .await
            .map_err(|_| CacheError::network("Frame write timeout"))?
            .map_err(|e| CacheError::network(format!("Frame write failed: {}", e)))
    }

    async fn read_frame(&self, stream: &mut TcpStream) -> CacheResult<SyncEnvelope> {
        let read = async {
            let mut len_bytes = [0u8; 4];
            stream.read_exact(&mut len_bytes).await?;
            let len = u32::from_be_bytes(len_bytes) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "frame length exceeds cap",
                ));
            }
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            Ok(body)
        };
        let body = timeout(self.io_timeout, read)
            .await
            .map_err(|_| CacheError::network("Frame read timeout"))?
            .map_err(|e| CacheError::network(format!("Frame read failed: {}", e)))?;

        SyncEnvelope::decode(&self.cipher.open(&body)?)
    }
}
