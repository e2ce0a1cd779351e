#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod error;
pub mod journal;
#[cfg(feature = "reconnect")]
pub mod reconnect;
pub(crate) mod serde_helpers;
pub mod types;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Production WebSocket endpoint of the Max web client.
pub const DEFAULT_ENDPOINT: &str = "wss://ws-api.oneme.ru/websocket";

pub use crate::journal::Journal;
pub use crate::types::{ClientDescriptor, Event, Identity};
pub use crate::ws::{Config, Connection, ConnectionState, Opcode};
