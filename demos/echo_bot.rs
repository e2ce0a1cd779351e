//! Echo bot: replies to every incoming text message with the same text.
//!
//! Stays connected through transport drops with the `reconnect` supervisor.
//!
//! Run with tracing enabled:
//! ```sh
//! MAX_TOKEN=... MAX_DEVICE_ID=... RUST_LOG=info cargo run --example echo_bot --features reconnect,tracing
//! ```

use std::env;

use max_client_sdk::error::BoxError;
use max_client_sdk::types::{ClientDescriptor, Event, Identity, Uuid};
use max_client_sdk::ws::config::ReconnectConfig;
use max_client_sdk::{Connection, Opcode, reconnect};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let token = env::var("MAX_TOKEN")?;
    let identity = match env::var("MAX_DEVICE_ID") {
        Ok(device_id) => Identity::builder()
            .device_id(Uuid::parse_str(&device_id)?)
            .token(token)
            .build(),
        Err(_) => Identity::builder().token(token).build(),
    };
    info!(device_id = %identity.device_id, "starting echo bot");

    let connection = Connection::default();
    connection.on_disconnect(|event| warn!(generation = event.generation, reason = ?event.reason, "disconnected"));

    let sender = connection.clone();
    connection.register_async_push_handler(
        |event: &Event| event.as_message().is_some_and(|m| !m.message.text.is_empty()),
        move |event: Event| {
            let sender = sender.clone();
            async move {
                let Some(incoming) = event.as_message() else {
                    return Ok(());
                };
                let me = sender.snapshot().and_then(|state| state.me.clone());
                if me.as_ref().is_some_and(|me| incoming.message.sender == Some(me.id)) {
                    return Ok(());
                }
                let Some(chat_id) = incoming.resolved_chat_id(me.as_ref()) else {
                    return Ok(());
                };

                info!(chat_id, text = %incoming.message.text, "echoing");
                sender
                    .request(
                        Opcode::MSG_SEND,
                        &json!({
                            "chatId": chat_id,
                            "message": { "text": incoming.message.text, "cid": -1, "elements": [], "attaches": [] },
                            "notify": true
                        }),
                    )
                    .await?;
                Ok::<(), BoxError>(())
            }
        },
    );

    let shutdown = CancellationToken::new();
    let supervisor = tokio::spawn(reconnect::run(
        connection,
        identity,
        ClientDescriptor::default(),
        ReconnectConfig::default(),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    supervisor.await??;

    Ok(())
}
