//! Messenger demo client
//!
//! Connects to `MESSENGER_HOST`:`MESSENGER_PORT` as `MESSENGER_NAME`, listens
//! on `Demo/*` and publishes a counter to `Demo/Counter` once a second.
//! Run two of them to watch each other's messages; stop and restart the
//! server to watch them reconnect.

use std::time::Duration;

use messenger_tokio::{ClientConfig, Message, MessengerClient, DEFAULT_PORT};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let host = std::env::var("MESSENGER_HOST").unwrap_or_else(|_| "localhost".to_owned());
    let port = match std::env::var("MESSENGER_PORT") {
        Ok(port) => port.parse()?,
        Err(_) => DEFAULT_PORT,
    };
    let name = std::env::var("MESSENGER_NAME").unwrap_or_else(|_| "Messenger".to_owned());

    let mut client = MessengerClient::start(ClientConfig::new(host, port, name.clone()))?;
    client.listen("Demo/*", |message: &Message| {
        let text = std::str::from_utf8(message.payload())?;
        log::info!("{} <- {}", message.msg_type(), text);
        Ok(())
    })?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut counter: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                counter += 1;
                let text = format!("{} #{}", name, counter);
                client.publish("Demo/Counter", text.into_bytes())?;
                client.read_messages();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    log::info!("Disconnecting");
    client.shutdown().await?;
    Ok(())
}
