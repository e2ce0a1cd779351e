//! Core realtime protocol client.
//!
//! # Architecture
//!
//! - [`envelope`]: stateless codec for `{ver, cmd, seq, opcode, payload}` frames
//! - `correlation`: outstanding-request table of one generation, with deadlines
//! - `dispatch`: the task owning the socket; resolves responses, routes pushes
//! - `handshake`: session init and bulk sync run by [`Connection::connect`]
//! - `keepalive`: interactive ping while synced
//! - [`Connection`]: supervisor and public handle tying the above together
//! - [`EventParser`]: seam turning push frames into application events
//!
//! # Example
//!
//! ```ignore
//! let connection = Connection::new(DEFAULT_ENDPOINT, Config::default(), NotificationParser)?;
//! connection.connect(&identity, &ClientDescriptor::default()).await?;
//! let mut messages = connection.subscribe(|event: &Event| event.as_message().is_some());
//! ```

pub mod config;
pub mod connection;
mod correlation;
mod dispatch;
pub mod envelope;
pub mod error;
mod handshake;
mod keepalive;
mod push;
pub mod traits;

pub use config::Config;
pub use connection::{Connection, ConnectionState, DisconnectReason, Disconnected};
pub use envelope::{Cmd, Envelope, Opcode};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use push::SubscriptionId;
pub use traits::*;
