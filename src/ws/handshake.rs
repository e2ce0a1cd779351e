//! Session init followed by the bulk state sync.

use secrecy::ExposeSecret as _;

use super::config::Config;
use super::connection::Link;
use super::envelope::Opcode;
use crate::Result;
use crate::error::{Error, Stage};
use crate::types::request::{SessionInitRequest, SyncRequest};
use crate::types::{ClientDescriptor, Identity, SyncState};

/// Run both stages on a freshly opened generation.
///
/// Any failure, including a timeout or an error payload, is reported as a
/// [`Kind::Handshake`](crate::error::Kind::Handshake) error naming the stage.
/// Malformed entities inside the sync are skipped, see [`SyncState::from_payload`].
pub(crate) async fn run(
    link: &Link,
    identity: &Identity,
    descriptor: &ClientDescriptor,
    config: &Config,
) -> Result<SyncState> {
    session_init(link, identity, descriptor, config)
        .await
        .map_err(|e| Error::handshake(Stage::SessionInit, e))?;
    config.record("[connection] handshake completed");

    sync(link, identity, config)
        .await
        .map_err(|e| Error::handshake(Stage::Sync, e))
}

async fn session_init(
    link: &Link,
    identity: &Identity,
    descriptor: &ClientDescriptor,
    config: &Config,
) -> Result<()> {
    #[cfg(feature = "tracing")]
    tracing::debug!(
        generation = link.generation(),
        device_id = %identity.device_id,
        device_type = %descriptor.device_type,
        "sending session init"
    );

    let payload = serde_json::to_value(SessionInitRequest {
        device_id: identity.device_id,
        user_agent: descriptor,
    })?;
    link.request(Opcode::SESSION_INIT, payload, config.handshake_timeout)
        .await?;

    #[cfg(feature = "tracing")]
    tracing::info!(generation = link.generation(), "handshake completed");
    Ok(())
}

async fn sync(link: &Link, identity: &Identity, config: &Config) -> Result<SyncState> {
    #[cfg(feature = "tracing")]
    tracing::debug!(
        generation = link.generation(),
        chats_count = config.sync_page_size,
        "starting initial sync"
    );

    let payload = serde_json::to_value(SyncRequest::full(
        identity.token.expose_secret(),
        config.sync_page_size,
    ))?;
    let response = link
        .request(Opcode::LOGIN, payload, config.handshake_timeout)
        .await?;

    let state = SyncState::from_payload(&response.payload);
    if state.skipped > 0 {
        config.record(format!(
            "[connection] sync skipped {} malformed entries",
            state.skipped
        ));
    }
    Ok(state)
}
