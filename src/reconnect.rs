//! Caller-side reconnection policy.
//!
//! [`Connection`] reports a lost transport and otherwise stays put. This module is one
//! outer supervisor an application can run on top of it. Push handlers and disconnect
//! callbacks survive each reconnect, so nothing needs re-registering.

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::types::{ClientDescriptor, Identity};
use crate::ws::config::ReconnectConfig;
use crate::ws::{Connection, EventParser};

/// Keep `connection` connected until `token` is cancelled.
///
/// Each round calls [`Connection::connect`], then waits for the state to leave
/// `Synced`, then backs off before the next attempt. Returns `Ok(())` after closing the
/// connection once cancelled, or the last connect error once
/// [`ReconnectConfig::max_attempts`] consecutive attempts have failed.
///
/// # Example
///
/// ```ignore
/// let token = CancellationToken::new();
/// tokio::spawn(reconnect::run(connection.clone(), identity, descriptor, ReconnectConfig::default(), token.clone()));
/// // ...
/// token.cancel();
/// ```
pub async fn run<E, P>(
    connection: Connection<E, P>,
    identity: Identity,
    descriptor: ClientDescriptor,
    config: ReconnectConfig,
    token: CancellationToken,
) -> Result<()>
where
    E: Clone + Send + Sync + 'static,
    P: EventParser<E>,
{
    let mut attempt = 0_u32;
    let max_attempts = config.max_attempts;
    let mut backoff: ExponentialBackoff = config.into();

    while !token.is_cancelled() {
        // Connect runs to completion; cancellation is checked between rounds
        match connection.connect(&identity, &descriptor).await {
            Ok(()) => {
                attempt = 0;
                backoff.reset();
                #[cfg(feature = "tracing")]
                tracing::info!(generation = connection.generation(), "connected");

                let mut state_rx = connection.state_receiver();
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = state_rx.wait_for(|state| !state.is_synced()) => {}
                }

                #[cfg(feature = "tracing")]
                tracing::warn!("connection dropped, scheduling reconnect");
            }
            Err(e) => {
                attempt = attempt.saturating_add(1);
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, error = %e, "unable to connect");

                if let Some(max) = max_attempts
                    && attempt >= max
                {
                    return Err(e);
                }
            }
        }

        if let Some(duration) = backoff.next_backoff() {
            tokio::select! {
                () = token.cancelled() => break,
                () = sleep(duration) => {}
            }
        }
    }

    connection.close().await;
    Ok(())
}
