//! Reconnecting Messenger client
//!
//! [`MessengerClient::start`] spawns a session task that owns the socket. The
//! task walks `Disconnected -> Connecting -> Handshaking -> Connected`, and
//! back to `Disconnected` on any failure, forever, until the client is shut
//! down or dropped. Subscriptions live in the task and are replayed on every
//! new connection.
//!
//! The application talks to the task through a command channel and receives
//! messages through an unbounded queue that it drains itself with
//! [`MessengerClient::read_messages`]. Handlers therefore run on the
//! application's task, never on the network task.

use std::collections::VecDeque;
use std::future::Future;

use bytes::{Bytes, BytesMut};
use log::{debug, info, trace, warn};
use messenger_core::handlers::{HandlerError, HandlerSet};
use messenger_core::protocol::DEFAULT_MAX_PAYLOAD_LENGTH;
use messenger_core::{ClientIdentity, FrameDecoder, Message, ProtocolError, SubscriptionPattern};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};

use crate::error::{MessengerError, Result};
use crate::io::{read_message, write_identity, write_message};
use crate::server::DEFAULT_PORT;

/// How long shutdown waits for queued frames to reach the socket
const SHUTDOWN_FLUSH: Duration = Duration::from_secs(1);

/// Where the session task is in its connection life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

impl core::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// What happens to `publish` calls made while not connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutgoingPolicy {
    /// Discard them
    #[default]
    Drop,
    /// Keep up to `capacity` of them, evicting the oldest, and send them
    /// once the next connection is established
    Buffer { capacity: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(2),
        }
    }
}

/// Reconnect delay generator.
///
/// The first attempt after a reset is immediate; each further consecutive
/// attempt waits twice as long as the previous one, starting at `base` and
/// capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            base: policy.base,
            max: policy.max,
            current: Duration::ZERO,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next = if self.current.is_zero() {
            self.base
        } else {
            self.current.checked_mul(2).unwrap_or(self.max)
        };
        self.current = std::cmp::min(next, self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = Duration::ZERO;
    }
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker host name or address (default: localhost)
    pub host: String,
    /// Broker port (default: 5805)
    pub port: u16,
    /// Name announced in the identity frame (default: "Messenger")
    pub name: String,
    /// Period of the keep-alive heartbeat (default: 1s)
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
    pub outgoing: OutgoingPolicy,
    /// Largest payload accepted in either direction (default: 1 GiB)
    pub max_payload_len: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: DEFAULT_PORT,
            name: "Messenger".to_owned(),
            heartbeat_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::default(),
            outgoing: OutgoingPolicy::Drop,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16, name: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_outgoing(mut self, outgoing: OutgoingPolicy) -> Self {
        self.outgoing = outgoing;
        self
    }

    pub fn with_max_payload_len(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    /// Reject values that would make the session task panic
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(MessengerError::InvalidConfig("heartbeat_interval must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Command {
    Publish(Message),
    Listen(SubscriptionPattern),
    Unlisten(SubscriptionPattern),
    Shutdown,
}

/// Handle to a running client session
pub struct MessengerClient {
    commands: mpsc::UnboundedSender<Command>,
    incoming: mpsc::UnboundedReceiver<Message>,
    handlers: HandlerSet,
    state: watch::Receiver<ConnectionState>,
    task: JoinHandle<()>,
    max_payload_len: usize,
}

impl core::fmt::Debug for MessengerClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessengerClient")
            .field("state", &*self.state.borrow())
            .field("handlers", &self.handlers)
            .finish()
    }
}

impl MessengerClient {
    /// Spawn the session task on the current Tokio runtime.
    ///
    /// Returns immediately; the connection is established in the background.
    /// Fails if the configured name cannot be sent as an identity or the
    /// configuration is unusable.
    pub fn start(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let identity = ClientIdentity::new(config.name.clone())?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let max_payload_len = config.max_payload_len;

        let session = Session {
            backoff: Backoff::new(config.backoff),
            config,
            identity,
            commands: commands_rx,
            incoming: incoming_tx,
            state: state_tx,
            patterns: Vec::new(),
            outbox: VecDeque::new(),
        };
        let task = tokio::spawn(session.run());

        Ok(Self {
            commands: commands_tx,
            incoming: incoming_rx,
            handlers: HandlerSet::new(),
            state: state_rx,
            task,
            max_payload_len,
        })
    }

    /// Publish a message to every matching subscriber.
    ///
    /// Validation errors are returned here, before anything is written. A
    /// valid message is handed to the session task and sent if connected;
    /// otherwise it follows the configured [`OutgoingPolicy`].
    pub fn publish(&self, msg_type: impl Into<String>, payload: impl Into<Bytes>) -> Result<()> {
        let message = Message::user(msg_type, payload)?;
        if message.payload().len() > self.max_payload_len {
            return Err(ProtocolError::PayloadTooLarge {
                max_size: self.max_payload_len,
                actual_size: message.payload().len(),
            }
            .into());
        }
        self.send(Command::Publish(message))
    }

    /// Subscribe to `pattern` and run `handler` for each matching message.
    ///
    /// A trailing `*` makes it a prefix subscription. The subscription is
    /// kept across reconnections.
    pub fn listen<F>(&mut self, pattern: &str, handler: F) -> Result<()>
    where
        F: FnMut(&Message) -> core::result::Result<(), HandlerError> + Send + 'static,
    {
        let pattern = SubscriptionPattern::parse(pattern)?;
        self.send(Command::Listen(pattern.clone()))?;
        self.handlers.add(pattern, handler);
        Ok(())
    }

    /// Drop the subscription and every handler registered for `pattern`.
    pub fn unlisten(&mut self, pattern: &str) -> Result<()> {
        let pattern = SubscriptionPattern::parse(pattern)?;
        self.send(Command::Unlisten(pattern.clone()))?;
        self.handlers.remove_pattern(&pattern);
        Ok(())
    }

    /// Dispatch every message queued so far to the matching handlers.
    ///
    /// Returns the number of messages taken off the queue.
    pub fn read_messages(&mut self) -> usize {
        let mut count = 0;
        while let Ok(message) = self.incoming.try_recv() {
            self.handlers.dispatch(&message);
            count += 1;
        }
        count
    }

    /// Wait until at least one message is queued, then dispatch the queue.
    pub async fn wait_for_messages(&mut self) -> Result<usize> {
        let message = self
            .incoming
            .recv()
            .await
            .ok_or(MessengerError::ClientShutDown)?;
        self.handlers.dispatch(&message);
        Ok(1 + self.read_messages())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Resolve once the session reaches `target`.
    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| MessengerError::ClientShutDown)
    }

    /// Send the disconnect notice if connected, close the socket and stop
    /// reconnecting.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(Command::Shutdown);
        self.task.await.map_err(|e| {
            MessengerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| MessengerError::ClientShutDown)
    }
}

enum SessionEnd {
    Lost(String),
    Shutdown,
}

struct Session {
    config: ClientConfig,
    identity: ClientIdentity,
    commands: mpsc::UnboundedReceiver<Command>,
    incoming: mpsc::UnboundedSender<Message>,
    state: watch::Sender<ConnectionState>,
    /// Subscriptions in the order they were made, replayed on connect
    patterns: Vec<SubscriptionPattern>,
    outbox: VecDeque<Message>,
    backoff: Backoff,
}

impl Session {
    async fn run(mut self) {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Client {} starting, broker at {}", self.identity, addr);

        loop {
            let delay = self.backoff.next_delay();
            if !delay.is_zero() {
                trace!("Client {}: reconnecting in {:?}", self.identity, delay);
                if self.serve_offline(tokio::time::sleep(delay)).await.is_none() {
                    break;
                }
            }

            self.set_state(ConnectionState::Connecting);
            let stream = match self.serve_offline(TcpStream::connect(addr.clone())).await {
                Some(Ok(stream)) => stream,
                Some(Err(e)) => {
                    debug!("Client {}: connect to {} failed: {}", self.identity, addr, e);
                    self.set_state(ConnectionState::Disconnected);
                    continue;
                }
                None => break,
            };

            match self.run_connection(stream).await {
                SessionEnd::Lost(reason) => {
                    warn!("Client {}: connection lost: {}", self.identity, reason);
                    self.set_state(ConnectionState::Disconnected);
                }
                SessionEnd::Shutdown => break,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("Client {} stopped", self.identity);
    }

    /// Handshake, replay, then pump frames until the connection ends.
    async fn run_connection(&mut self, mut stream: TcpStream) -> SessionEnd {
        self.set_state(ConnectionState::Handshaking);
        if let Err(e) = stream.set_nodelay(true) {
            trace!("Could not set TCP_NODELAY: {}", e);
        }
        if let Err(e) = write_identity(&mut stream, &self.identity).await {
            return SessionEnd::Lost(e.to_string());
        }

        // Outgoing frames queue here so the read side is never held up by writes
        let (mut reader, writer) = stream.into_split();
        let (frames, frames_rx) = mpsc::unbounded_channel();
        let mut writer_task = tokio::spawn(write_frames(writer, frames_rx));

        for pattern in &self.patterns {
            let _ = frames.send(Message::listen(pattern));
        }
        if !self.patterns.is_empty() {
            debug!(
                "Client {}: replayed {} subscription(s)",
                self.identity,
                self.patterns.len()
            );
        }
        for message in self.outbox.drain(..) {
            let _ = frames.send(message);
        }

        self.backoff.reset();
        self.set_state(ConnectionState::Connected);

        let end = self.pump(&mut reader, &frames, &mut writer_task).await;
        match end {
            SessionEnd::Shutdown => {
                // Let the disconnect notice and anything queued before it go out
                drop(frames);
                match timeout(SHUTDOWN_FLUSH, &mut writer_task).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(e))) => {
                        debug!("Client {}: disconnect notice not sent: {}", self.identity, e);
                    }
                    Ok(Err(e)) => debug!("Client {}: writer task failed: {}", self.identity, e),
                    Err(_) => {
                        debug!("Client {}: gave up flushing on shutdown", self.identity);
                        writer_task.abort();
                    }
                }
            }
            SessionEnd::Lost(_) => writer_task.abort(),
        }
        end
    }

    async fn pump(
        &mut self,
        reader: &mut OwnedReadHalf,
        frames: &mpsc::UnboundedSender<Message>,
        writer_task: &mut JoinHandle<std::io::Result<()>>,
    ) -> SessionEnd {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut read_buffer = BytesMut::with_capacity(4096);
        let mut decoder = FrameDecoder::with_max_payload_len(self.config.max_payload_len);

        loop {
            tokio::select! {
                read_result = read_message(&mut *reader, &mut read_buffer, &mut decoder) => {
                    match read_result {
                        Ok(Some(message)) if message.is_reserved() => {
                            trace!("Client {}: ignoring {}", self.identity, message.msg_type());
                        }
                        Ok(Some(message)) => {
                            if self.incoming.send(message).is_err() {
                                let _ = frames.send(Message::disconnect_notice());
                                return SessionEnd::Shutdown;
                            }
                        }
                        Ok(None) => return SessionEnd::Lost("closed by server".to_owned()),
                        Err(e) => return SessionEnd::Lost(e.to_string()),
                    }
                }

                written = &mut *writer_task => {
                    let reason = match written {
                        Ok(Ok(())) => "writer stopped".to_owned(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    };
                    return SessionEnd::Lost(reason);
                }

                _ = heartbeat.tick() => {
                    let _ = frames.send(Message::heartbeat());
                }

                command = self.commands.recv() => {
                    let frame = match command {
                        Some(Command::Publish(message)) => message,
                        Some(Command::Listen(pattern)) => {
                            if !self.remember(&pattern) {
                                continue;
                            }
                            Message::listen(&pattern)
                        }
                        Some(Command::Unlisten(pattern)) => {
                            if !self.forget(&pattern) {
                                continue;
                            }
                            Message::unlisten(&pattern)
                        }
                        Some(Command::Shutdown) | None => {
                            let _ = frames.send(Message::disconnect_notice());
                            return SessionEnd::Shutdown;
                        }
                    };
                    let _ = frames.send(frame);
                }
            }
        }
    }

    /// Drive `future` while applying commands as the offline session would.
    ///
    /// Returns `None` if the client asked to shut down in the meantime.
    async fn serve_offline<F: Future>(&mut self, future: F) -> Option<F::Output> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                // Commands already queued are applied before the future is
                // allowed to complete, so a later connection sees them.
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Publish(message)) => self.hold(message),
                    Some(Command::Listen(pattern)) => {
                        self.remember(&pattern);
                    }
                    Some(Command::Unlisten(pattern)) => {
                        self.forget(&pattern);
                    }
                    Some(Command::Shutdown) | None => return None,
                },
                output = &mut future => return Some(output),
            }
        }
    }

    fn hold(&mut self, message: Message) {
        match self.config.outgoing {
            OutgoingPolicy::Drop => {
                debug!(
                    "Client {}: not connected, dropping {}",
                    self.identity,
                    message.msg_type()
                );
            }
            OutgoingPolicy::Buffer { capacity } => {
                if capacity == 0 {
                    return;
                }
                if self.outbox.len() >= capacity {
                    if let Some(evicted) = self.outbox.pop_front() {
                        debug!(
                            "Client {}: outbox full, evicting {}",
                            self.identity,
                            evicted.msg_type()
                        );
                    }
                }
                self.outbox.push_back(message);
            }
        }
    }

    fn remember(&mut self, pattern: &SubscriptionPattern) -> bool {
        if self.patterns.contains(pattern) {
            return false;
        }
        self.patterns.push(pattern.clone());
        true
    }

    fn forget(&mut self, pattern: &SubscriptionPattern) -> bool {
        let before = self.patterns.len();
        self.patterns.retain(|p| p != pattern);
        before != self.patterns.len()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Client {}: {} -> {}", self.identity, previous, state);
            if state == ConnectionState::Connected {
                info!(
                    "Client {} connected to {}:{}",
                    self.identity, self.config.host, self.config.port
                );
            }
        }
    }
}

/// Write queued frames in order until the queue closes or a write fails
async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut frames: mpsc::UnboundedReceiver<Message>,
) -> std::io::Result<()> {
    while let Some(frame) = frames.recv().await {
        write_message(&mut writer, &frame).await?;
    }
    Ok(())
}
