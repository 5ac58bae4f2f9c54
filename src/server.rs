/// Poller server
///
/// Accepts controller connections and runs one [`DeviceSession`] per connection
/// on its own task. The accept loop never waits on a session; sessions report
/// back only through logs and the shared [`ServerStats`].

use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::PollerConfig;
use crate::error::{PollerError, PollerResult};
use crate::session::{DeviceSession, SessionContext};
use crate::transport::StreamTransport;

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub active_sessions: u64,
    pub finished_sessions: u64,
    pub failed_sessions: u64,
    pub uptime_seconds: u64,
}

/// TCP server spawning a polling session per controller
pub struct PollerServer {
    config: PollerConfig,
    context: SessionContext,
    stats: Arc<Mutex<ServerStats>>,
    cancel: CancellationToken,
    local_addr: Option<SocketAddr>,
    start_time: Option<Instant>,
}

impl PollerServer {
    pub fn new(config: PollerConfig, context: SessionContext) -> Self {
        Self {
            config,
            context,
            stats: Arc::new(Mutex::new(ServerStats::default())),
            cancel: CancellationToken::new(),
            local_addr: None,
            start_time: None,
        }
    }

    /// Bind the listener and spawn the accept loop
    ///
    /// Returns the bound address, which differs from the configured one when
    /// port 0 was requested.
    pub async fn start(&mut self) -> PollerResult<SocketAddr> {
        if self.local_addr.is_some() {
            return Err(PollerError::internal("Server is already running"));
        }

        let bind_address = &self.config.server.bind_address;
        let listener = TcpListener::bind(bind_address.as_str()).await.map_err(|e| {
            PollerError::connection(format!("Failed to bind to {}: {}", bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;

        info!("🚀 Poller listening on {}", local_addr);
        info!("   - Max connections: {}", self.config.server.max_connections);
        info!("   - Request timeout: {:?}", self.config.session.request_timeout());
        info!("   - Cycle interval: {:?}", self.config.session.cycle_interval());

        self.local_addr = Some(local_addr);
        self.start_time = Some(Instant::now());

        let accept = AcceptLoop {
            listener,
            config: Arc::new(self.config.clone()),
            context: self.context.clone(),
            stats: self.stats.clone(),
            cancel: self.cancel.clone(),
        };
        tokio::spawn(accept.run());

        Ok(local_addr)
    }

    /// Stop accepting and cancel every session
    pub fn stop(&self) {
        self.cancel.cancel();
        info!("⏹️  Poller stopped");
    }

    pub fn is_running(&self) -> bool {
        self.local_addr.is_some() && !self.cancel.is_cancelled()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub async fn get_stats(&self) -> ServerStats {
        let mut stats = self.stats.lock().await.clone();
        if let Some(start_time) = self.start_time {
            stats.uptime_seconds = start_time.elapsed().as_secs();
        }
        stats
    }
}

struct AcceptLoop {
    listener: TcpListener,
    config: Arc<PollerConfig>,
    context: SessionContext,
    stats: Arc<Mutex<ServerStats>>,
    cancel: CancellationToken,
}

impl AcceptLoop {
    async fn run(self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Accept loop cancelled");
                    break;
                }
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => self.admit(stream, peer).await,
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        {
            let mut stats = self.stats.lock().await;
            if stats.active_sessions as usize >= self.config.server.max_connections {
                stats.connections_rejected += 1;
                warn!(
                    "Rejecting {}: {} sessions already active",
                    peer, stats.active_sessions
                );
                return;
            }
            stats.connections_accepted += 1;
            stats.active_sessions += 1;
        }
        info!("📡 Controller connected: {}", peer);

        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] set_nodelay failed: {}", peer, e);
        }

        let session_config = &self.config.session;
        let logging = &self.config.logging;
        let transport = StreamTransport::new(stream, peer.to_string(), session_config.request_timeout())
            .with_retries(session_config.max_retries_per_request, session_config.retry_budget())
            .with_packet_logging(logging.packet_logging, logging.packet_mode);
        let session = DeviceSession::new(
            transport,
            peer.to_string(),
            session_config.clone(),
            self.config.bundling.clone(),
            self.context.clone(),
        );

        let stats = self.stats.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            let result = session.run(cancel).await;
            let mut stats = stats.lock().await;
            stats.active_sessions = stats.active_sessions.saturating_sub(1);
            stats.finished_sessions += 1;
            if result.is_err() {
                stats.failed_sessions += 1;
            }
            info!("🔌 Controller {} disconnected", peer);
        });
    }
}
