use crate::error::{MessengerError, Result};
use crate::handler::{handle_connection, HandlerConfig};
use crate::state::ServerState;
use log::{debug, error, info, trace};
use messenger_core::protocol::DEFAULT_MAX_PAYLOAD_LENGTH;
use messenger_core::{Broker, ConnectionId, EventSink, NoopSink};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{Duration, Instant};

/// Shared broker type alias
pub type SharedBroker = Arc<tokio::sync::Mutex<Broker>>;

/// Port the server listens on unless configured otherwise
pub const DEFAULT_PORT: u16 = 5805;

/// Runtime configuration for the Messenger server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (default: 0.0.0.0:5805)
    pub bind_addr: SocketAddr,
    /// Time a new connection gets to send its identity (default: 10s)
    pub handshake_timeout: Duration,
    /// Drop connections silent for this long (default: disabled)
    pub liveness_timeout: Option<Duration>,
    /// How often the liveness sweep runs (default: 5s)
    pub sweep_interval: Duration,
    /// Messages queued per connection before new ones are dropped (default: 1024)
    pub outbound_capacity: usize,
    /// Largest payload accepted from a peer (default: 1 GiB)
    pub max_payload_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            handshake_timeout: Duration::from_secs(10),
            liveness_timeout: None,
            sweep_interval: Duration::from_secs(5),
            outbound_capacity: 1024,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LENGTH,
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_liveness_timeout(mut self, timeout: Duration, sweep_interval: Duration) -> Self {
        self.liveness_timeout = Some(timeout);
        self.sweep_interval = sweep_interval;
        self
    }

    /// Reject values that would make the server tasks panic
    pub fn validate(&self) -> Result<()> {
        if self.outbound_capacity == 0 {
            return Err(MessengerError::InvalidConfig("outbound_capacity must be at least 1"));
        }
        if self.liveness_timeout.is_some() && self.sweep_interval.is_zero() {
            return Err(MessengerError::InvalidConfig("sweep_interval must be non-zero"));
        }
        Ok(())
    }
}

/// A Tokio-based Messenger broker server
///
/// Binding and serving are separate steps so the caller can learn the
/// actual address (useful with port 0) before accepting connections.
pub struct MessengerServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    broker: SharedBroker,
    config: ServerConfig,
}

impl MessengerServer {
    /// Bind with the given configuration and a broker that discards events
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        Self::bind_with_sink(config, NoopSink).await
    }

    /// Bind with the given configuration, reporting events to `sink`
    pub async fn bind_with_sink(config: ServerConfig, sink: impl EventSink + 'static) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("Server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            state: Arc::new(ServerState::new()),
            broker: Arc::new(tokio::sync::Mutex::new(Broker::with_sink(sink))),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get a handle to the shared broker for external interaction
    pub fn broker(&self) -> &SharedBroker {
        &self.broker
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.state.connection_count()
    }

    /// Close one connection as if its socket had dropped
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        self.state.close(id)
    }

    /// Accept connections until the future is dropped
    pub async fn run(&self) -> Result<()> {
        debug!(
            "Server configuration: handshake_timeout={:?}, liveness_timeout={:?}, outbound_capacity={}",
            self.config.handshake_timeout, self.config.liveness_timeout, self.config.outbound_capacity
        );

        let _sweep = self.config.liveness_timeout.map(|liveness_timeout| {
            let sweep = tokio::spawn(liveness_sweep(
                self.state.clone(),
                self.broker.clone(),
                liveness_timeout,
                self.config.sweep_interval,
            ));
            AbortOnDrop(sweep)
        });

        let handler_config = HandlerConfig {
            handshake_timeout: self.config.handshake_timeout,
            outbound_capacity: self.config.outbound_capacity,
            max_payload_len: self.config.max_payload_len,
        };

        loop {
            match self.listener.accept().await {
                Ok((socket, addr)) => {
                    let peer_addr = addr.to_string();
                    debug!("New connection from {}", peer_addr);
                    if let Err(e) = socket.set_nodelay(true) {
                        trace!("Could not set TCP_NODELAY for {}: {}", peer_addr, e);
                    }

                    let handler_state = self.state.clone();
                    let handler_broker = self.broker.clone();
                    let handler_config = handler_config.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(
                            socket,
                            peer_addr.clone(),
                            handler_state,
                            handler_broker,
                            &handler_config,
                        )
                        .await
                        {
                            debug!("Connection from {} ended with error: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Background task dropping connections that stopped sending anything
async fn liveness_sweep(
    state: Arc<ServerState>,
    broker: SharedBroker,
    liveness_timeout: Duration,
    interval: Duration,
) {
    info!(
        "Liveness sweep started (timeout: {:?}, interval: {:?})",
        liveness_timeout, interval
    );
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;

        let mut broker_guard = broker.lock().await;
        let stale = broker_guard.stale_connections(Instant::now().into_std(), liveness_timeout);
        if stale.is_empty() {
            trace!(
                "Liveness sweep complete: {} connection(s), none stale",
                broker_guard.connection_count()
            );
            continue;
        }

        info!("Found {} silent connection(s)", stale.len());
        for id in stale {
            broker_guard.remove(id, "liveness timeout");
            state.close(id);
        }
    }
}
