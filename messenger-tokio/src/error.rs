//! Error types for the Tokio runtime layer

use messenger_core::{BrokerError, ProtocolError};

#[derive(Debug, thiserror::Error)]
pub enum MessengerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
    /// Peer did not complete the identity handshake in time
    #[error("Handshake timed out")]
    HandshakeTimeout,
    /// Peer closed the stream in the middle of a frame
    #[error("Connection closed by peer")]
    ConnectionClosed,
    /// A configuration value the runtime cannot work with
    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The client's background task is gone; no further calls can succeed
    #[error("Client has been shut down")]
    ClientShutDown,
}

pub type Result<T> = core::result::Result<T, MessengerError>;
