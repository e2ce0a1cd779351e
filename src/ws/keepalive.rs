//! Interactive ping sent while a generation is synced.
//!
//! The ping is a courtesy to the server, which otherwise marks the session idle. It
//! never changes connection state: a dead transport is noticed by the dispatch
//! loop's read path.

use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;

use super::connection::Link;
use super::envelope::Opcode;
use crate::types::request::PingRequest;

pub(crate) async fn run(link: Link, every: Duration, timeout: Duration, token: CancellationToken) {
    let payload = match serde_json::to_value(PingRequest { interactive: true }) {
        Ok(payload) => payload,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::error!(error = %e, "unable to encode ping");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            return;
        }
    };

    // First ping one interval after sync
    let mut ticker = interval_at(Instant::now() + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            () = token.cancelled() => break,
            outcome = link.request(Opcode::PING, payload.clone(), timeout) => outcome,
        };

        match outcome {
            Ok(_) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(generation = link.generation(), "interactive ping acknowledged");
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(generation = link.generation(), error = %e, "interactive ping failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(generation = link.generation(), "keepalive stopped");
}
