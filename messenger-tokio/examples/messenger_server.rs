//! Messenger broker server
//!
//! Listens on `MESSENGER_BIND` (default `0.0.0.0:5805`) and logs every
//! connection event and published message through `env_logger`.
//!
//! ```text
//! RUST_LOG=debug MESSENGER_BIND=127.0.0.1:5805 cargo run --example messenger_server
//! ```

use std::net::SocketAddr;

use messenger_tokio::{LogSink, MessengerServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("MESSENGER_BIND") {
        config = config.with_bind_addr(bind.parse::<SocketAddr>()?);
    }

    let server = MessengerServer::bind_with_sink(config, LogSink).await?;
    log::info!("Messenger broker ready on {}", server.local_addr()?);

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("Shutting down with {} connection(s) open", server.connection_count());
        }
    }

    Ok(())
}
