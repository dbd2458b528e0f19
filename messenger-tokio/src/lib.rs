//! # messenger-tokio
//!
//! Tokio server and client for the Messenger publish/subscribe broker.
//!
//! Built on top of `messenger-core` for framing, subscriptions and broker
//! logic.
//!
//! ## Example
//!
//! ```no_run
//! use messenger_tokio::{MessengerServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = MessengerServer::bind(ServerConfig::default()).await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

// Re-export core types for convenience
pub use messenger_core::{
    ConnectionId, EventKind, EventSink, HandlerError, LogSink, Message, NoopSink, ProtocolError,
    SubscriptionPattern,
};

// Public API
pub mod client;
pub mod error;
pub mod io;
pub mod server;
pub use client::{
    Backoff, BackoffPolicy, ClientConfig, ConnectionState, MessengerClient, OutgoingPolicy,
};
pub use error::{MessengerError, Result};
pub use server::{MessengerServer, ServerConfig, SharedBroker, DEFAULT_PORT};

mod handler;
mod state;
