// Stream-based RPC transport over the overlay.
//
// An application RPC server plugs in above this layer: the listener turns
// accepted `/bib/grpc/1.0.0` streams into connections that speak tokio's
// `AsyncRead + AsyncWrite` and expose the remote peer id; the dialer opens
// the same connection type toward a peer, pooling idle connections and
// optionally falling back to plain TCP when a direct address is known.

mod auth;
mod rate_limit;

pub use auth::{AllowListRepository, Authorizer, RestrictedServiceInterceptor};
pub use rate_limit::RateLimiter;

use libp2p::{PeerId, Stream};
use libp2p_stream::Control;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;

use crate::config::RpcConfig;
use crate::error::{BibError, Result};
use crate::protocol::PROTOCOL_GRPC;

/// How an `RpcConn` reaches the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnTransport {
    Overlay,
    Tcp,
}

enum ConnIo {
    Overlay(Compat<Stream>),
    Tcp(tokio::net::TcpStream),
}

/// A bidirectional byte stream bound to a remote peer identity.
pub struct RpcConn {
    peer: PeerId,
    transport: ConnTransport,
    io: ConnIo,
}

impl RpcConn {
    fn overlay(peer: PeerId, stream: Stream) -> Self {
        Self {
            peer,
            transport: ConnTransport::Overlay,
            io: ConnIo::Overlay(stream.compat()),
        }
    }

    fn tcp(peer: PeerId, stream: tokio::net::TcpStream) -> Self {
        Self {
            peer,
            transport: ConnTransport::Tcp,
            io: ConnIo::Tcp(stream),
        }
    }

    /// The authenticated remote peer.
    pub fn peer_id(&self) -> PeerId {
        self.peer
    }

    pub fn transport(&self) -> ConnTransport {
        self.transport
    }
}

impl AsyncRead for RpcConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.io {
            ConnIo::Overlay(stream) => Pin::new(stream).poll_read(cx, buf),
            ConnIo::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RpcConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.io {
            ConnIo::Overlay(stream) => Pin::new(stream).poll_write(cx, buf),
            ConnIo::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.io {
            ConnIo::Overlay(stream) => Pin::new(stream).poll_flush(cx),
            ConnIo::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.io {
            ConnIo::Overlay(stream) => Pin::new(stream).poll_shutdown(cx),
            ConnIo::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Accepts authorized RPC connections from the overlay.
pub struct RpcListener {
    incoming: mpsc::Receiver<RpcConn>,
    shutdown: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

impl RpcListener {
    /// Register the RPC protocol and start the accept pump. Authorization
    /// runs before a connection ever reaches `accept`; denied streams are
    /// dropped without a reply, as are streams arriving while the bounded
    /// accept queue is full.
    pub fn bind(control: &Control, authorizer: Arc<Authorizer>, config: &RpcConfig) -> Result<Self> {
        let mut streams = control
            .clone()
            .accept(PROTOCOL_GRPC)
            .map_err(BibError::transport)?;
        let (tx, rx) = mpsc::channel(config.accept_backlog.max(1));
        let shutdown = CancellationToken::new();

        let pump_shutdown = shutdown.clone();
        let pump = tokio::spawn(async move {
            use futures::StreamExt;
            loop {
                let next = tokio::select! {
                    _ = pump_shutdown.cancelled() => break,
                    next = streams.next() => next,
                };
                let Some((peer, stream)) = next else { break };

                if authorizer.check(&peer).await.is_err() {
                    // Silent close; the authorizer already logged why.
                    drop(stream);
                    continue;
                }
                if let Err(e) = tx.try_send(RpcConn::overlay(peer, stream)) {
                    tracing::debug!(peer = %peer, error = %e, "Accept queue full, resetting stream");
                }
            }
        });

        Ok(Self {
            incoming: rx,
            shutdown,
            pump: Some(pump),
        })
    }

    /// Next authorized connection; `None` once the listener is closed.
    pub async fn accept(&mut self) -> Option<RpcConn> {
        self.incoming.recv().await
    }

    pub fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for RpcListener {
    fn drop(&mut self) {
        self.close();
    }
}

struct PooledConn {
    conn: RpcConn,
    idle_since: Instant,
}

/// Opens RPC connections toward peers, reusing idle pooled connections.
pub struct RpcDialer {
    control: Control,
    pool: Arc<tokio::sync::Mutex<HashMap<PeerId, Vec<PooledConn>>>>,
    idle_timeout: Duration,
    shutdown: CancellationToken,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl RpcDialer {
    pub fn new(control: Control, config: &RpcConfig) -> Self {
        let pool: Arc<tokio::sync::Mutex<HashMap<PeerId, Vec<PooledConn>>>> =
            Arc::new(tokio::sync::Mutex::new(HashMap::new()));
        let idle_timeout = config.idle_timeout();
        let shutdown = CancellationToken::new();

        let sweeper = {
            let pool = Arc::clone(&pool);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(idle_timeout);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tick.tick() => {
                            let now = Instant::now();
                            let mut pool = pool.lock().await;
                            for conns in pool.values_mut() {
                                conns.retain(|entry| now.duration_since(entry.idle_since) < idle_timeout);
                            }
                            pool.retain(|_, conns| !conns.is_empty());
                        }
                    }
                }
            })
        };

        Self {
            control,
            pool,
            idle_timeout,
            shutdown,
            sweeper: parking_lot::Mutex::new(Some(sweeper)),
        }
    }

    /// Open (or reuse) a connection to `peer`. When the overlay dial fails
    /// and a direct address is known, retry over TCP; the returned
    /// connection is marked with the transport that won.
    pub async fn dial(&self, peer: PeerId, fallback: Option<SocketAddr>) -> Result<RpcConn> {
        {
            let mut pool = self.pool.lock().await;
            if let Some(conns) = pool.get_mut(&peer) {
                while let Some(entry) = conns.pop() {
                    if entry.idle_since.elapsed() < self.idle_timeout {
                        return Ok(entry.conn);
                    }
                }
            }
        }

        match self.control.clone().open_stream(peer, PROTOCOL_GRPC).await {
            Ok(stream) => Ok(RpcConn::overlay(peer, stream)),
            Err(overlay_err) => match fallback {
                Some(addr) => {
                    tracing::debug!(peer = %peer, error = %overlay_err, addr = %addr, "Overlay dial failed, trying TCP");
                    let stream = tokio::net::TcpStream::connect(addr)
                        .await
                        .map_err(BibError::transport)?;
                    Ok(RpcConn::tcp(peer, stream))
                }
                None => Err(BibError::transport(overlay_err)),
            },
        }
    }

    /// Return a healthy connection to the pool for reuse.
    pub async fn release(&self, conn: RpcConn) {
        let mut pool = self.pool.lock().await;
        pool.entry(conn.peer).or_default().push(PooledConn {
            conn,
            idle_since: Instant::now(),
        });
    }

    pub async fn pooled_connections(&self, peer: &PeerId) -> usize {
        self.pool
            .lock()
            .await
            .get(peer)
            .map(|conns| conns.len())
            .unwrap_or(0)
    }

    pub fn close(&self) {
        self.shutdown.cancel();
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
    }
}

impl Drop for RpcDialer {
    fn drop(&mut self) {
        self.close();
    }
}
