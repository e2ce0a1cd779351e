use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use crate::ws::envelope::Opcode;

/// Boxed error returned by push handlers and other collaborator callbacks.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// The transport could not be opened, or no connection is available
    Connection,
    /// Session init or initial sync was rejected or timed out
    Handshake,
    /// A request deadline elapsed before its response arrived
    Timeout,
    /// A pending request was invalidated because the connection dropped
    ConnectionLost,
    /// A pending request was abandoned by an orderly shutdown
    Cancelled,
    /// The server answered with an error payload, or sent a malformed frame
    Protocol,
    /// Error related to invalid state or arguments within the client
    Validation,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn timeout(seq: u64, opcode: Opcode, after: Duration) -> Self {
        RequestTimeout { seq, opcode, after }.into()
    }

    #[must_use]
    pub fn connection_lost(generation: u64) -> Self {
        ConnectionLost { generation }.into()
    }

    #[must_use]
    pub fn cancelled(seq: u64) -> Self {
        Cancelled { seq }.into()
    }

    pub fn handshake<S: StdError + Send + Sync + 'static>(stage: Stage, source: S) -> Self {
        Handshake {
            stage,
            source: Box::new(source),
        }
        .into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

/// A request was not answered before its deadline.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct RequestTimeout {
    pub seq: u64,
    pub opcode: Opcode,
    pub after: Duration,
}

impl fmt::Display for RequestTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request seq={} opcode={} timed out after {:?}",
            self.seq, self.opcode, self.after
        )
    }
}

impl StdError for RequestTimeout {}

/// The connection carrying a request dropped before it was answered.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLost {
    pub generation: u64,
}

impl fmt::Display for ConnectionLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection generation {} was lost", self.generation)
    }
}

impl StdError for ConnectionLost {}

#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Cancelled {
    pub seq: u64,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request seq={} cancelled by shutdown", self.seq)
    }
}

impl StdError for Cancelled {}

/// Error payload returned by the server in place of a successful response.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerError {
    /// Machine readable error code, e.g. `proto.payload`
    pub error: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub localized_message: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error {}", self.error)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl StdError for ServerError {}

/// Which part of the initial exchange failed.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum Stage {
    #[strum(serialize = "session init")]
    SessionInit,
    #[strum(serialize = "sync")]
    Sync,
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Handshake {
    pub stage: Stage,
    pub source: BoxError,
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.stage, self.source)
    }
}

impl StdError for Handshake {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Failure raised by a push handler.
///
/// Only ever logged by the dispatch loop. It never reaches a caller or another handler.
#[non_exhaustive]
#[derive(Debug)]
pub struct PushHandlerError {
    /// Registration index of the failing handler
    pub handler: usize,
    pub opcode: Opcode,
    pub source: BoxError,
}

impl fmt::Display for PushHandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "push handler #{} failed on opcode {}: {}",
            self.handler, self.opcode, self.source
        )
    }
}

impl StdError for PushHandlerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

/// A handler panicked; the payload is rendered to text when it is a string.
#[non_exhaustive]
#[derive(Debug)]
pub struct HandlerPanic {
    pub message: String,
}

impl HandlerPanic {
    pub(crate) fn from_payload(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self { message }
    }
}

impl fmt::Display for HandlerPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler panicked: {}", self.message)
    }
}

impl StdError for HandlerPanic {}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<RequestTimeout> for Error {
    fn from(err: RequestTimeout) -> Self {
        Error::with_source(Kind::Timeout, err)
    }
}

impl From<ConnectionLost> for Error {
    fn from(err: ConnectionLost) -> Self {
        Error::with_source(Kind::ConnectionLost, err)
    }
}

impl From<Cancelled> for Error {
    fn from(err: Cancelled) -> Self {
        Error::with_source(Kind::Cancelled, err)
    }
}

impl From<ServerError> for Error {
    fn from(err: ServerError) -> Self {
        Error::with_source(Kind::Protocol, err)
    }
}

impl From<Handshake> for Error {
    fn from(err: Handshake) -> Self {
        Error::with_source(Kind::Handshake, err)
    }
}
