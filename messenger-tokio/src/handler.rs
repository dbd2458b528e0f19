use crate::error::{MessengerError, Result};
use crate::io::{read_identity, read_message, write_message};
use crate::server::SharedBroker;
use crate::state::{ConnectionHandle, ServerState};
use bytes::BytesMut;
use log::{debug, info, trace, warn};
use messenger_core::{Dispatch, FrameDecoder, Message};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Duration, Instant};

/// Per-connection settings, taken from the server configuration
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub handshake_timeout: Duration,
    pub outbound_capacity: usize,
    pub max_payload_len: usize,
}

/// Why a connection loop ended, as reported to the event sink
const REASON_GRACEFUL: &str = "graceful";
const REASON_CLOSED: &str = "connection closed";
const REASON_SERVER: &str = "closed by server";
const REASON_WRITE: &str = "write failed";

/// Handle a single Messenger connection from handshake to teardown
pub async fn handle_connection(
    socket: TcpStream,
    peer_addr: String,
    state: Arc<ServerState>,
    broker: SharedBroker,
    config: &HandlerConfig,
) -> Result<()> {
    let (mut reader, writer) = socket.into_split();
    let mut read_buffer = BytesMut::with_capacity(4096);

    // Handshake: nothing is registered until a valid identity arrives
    let identity = match timeout(
        config.handshake_timeout,
        read_identity(&mut reader, &mut read_buffer),
    )
    .await
    {
        Ok(Ok(Some(identity))) => identity,
        Ok(Ok(None)) => {
            debug!("{} closed before sending its identity", peer_addr);
            return Ok(());
        }
        Ok(Err(e)) => return Err(e),
        Err(_) => return Err(MessengerError::HandshakeTimeout),
    };

    let name = identity.name().to_owned();
    let id = broker
        .lock()
        .await
        .register(identity, &peer_addr, Instant::now().into_std());

    let (outbound_tx, outbound_rx) = mpsc::channel::<Message>(config.outbound_capacity);
    let close = Arc::new(Notify::new());
    state.insert(
        id,
        ConnectionHandle::new(name.clone(), peer_addr.clone(), outbound_tx, close.clone()),
    );
    info!("Connection {} established for {} ({})", id, name, peer_addr);

    // The read loop never waits on the socket's write side
    let mut writer_task = tokio::spawn(write_loop(writer, outbound_rx));
    let mut decoder = FrameDecoder::with_max_payload_len(config.max_payload_len);

    let exit: Result<&'static str> = loop {
        tokio::select! {
            // Read from socket
            read_result = read_message(&mut reader, &mut read_buffer, &mut decoder) => {
                let message = match read_result {
                    Ok(Some(message)) => message,
                    Ok(None) => break Ok(REASON_CLOSED),
                    Err(e) => break Err(e),
                };
                trace!("Connection {}: received {}", id, message);

                let dispatch = broker
                    .lock()
                    .await
                    .handle_message(id, &message, Instant::now().into_std());

                match dispatch {
                    Ok(Dispatch::Nothing) => {}
                    Ok(Dispatch::Deliver(recipients)) => {
                        let delivered = state.deliver(&recipients, &message);
                        trace!(
                            "Connection {}: {} delivered to {}/{} subscriber(s)",
                            id,
                            message.msg_type(),
                            delivered,
                            recipients.len()
                        );
                    }
                    Ok(Dispatch::Close) => break Ok(REASON_GRACEFUL),
                    Err(e) => break Err(e.into()),
                }
            }

            // Writer finished: socket write failed
            written = &mut writer_task => {
                match written {
                    Ok(Err(e)) => debug!("Connection {}: write error: {}", id, e),
                    Ok(Ok(())) => {}
                    Err(e) => debug!("Connection {}: writer task failed: {}", id, e),
                }
                break Ok(REASON_WRITE);
            }

            // Server asked us to go away
            _ = close.notified() => break Ok(REASON_SERVER),
        }
    };

    // Cleanup
    let reason = match &exit {
        Ok(reason) => (*reason).to_owned(),
        Err(e) => {
            warn!("Connection {} ({}): {}", id, name, e);
            e.to_string()
        }
    };
    state.remove(id);
    writer_task.abort();
    broker.lock().await.remove(id, &reason);
    info!("Connection {} for {} closed: {}", id, name, reason);

    exit.map(|_| ())
}

/// Drain the outbound queue onto the socket until the queue closes or a
/// write fails
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Message>,
) -> std::io::Result<()> {
    while let Some(message) = outbound.recv().await {
        trace!("Sending {}", message);
        write_message(&mut writer, &message).await?;
    }
    Ok(())
}
