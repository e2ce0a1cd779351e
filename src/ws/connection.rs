#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::{CancellationToken, DropGuard};
use url::Url;

use super::config::Config;
use super::correlation::{CorrelationTable, MAX_DEADLINE, Reply};
use super::dispatch::{Command, DispatchLoop};
use super::envelope::{Envelope, Opcode};
use super::error::WsError;
use super::push::{PushRegistry, SubscriptionId};
use super::traits::EventParser;
use super::{handshake, keepalive};
use crate::error::{BoxError, Error, HandlerPanic};
use crate::types::{ClientDescriptor, Event, Identity, NotificationParser, SyncState};
use crate::{DEFAULT_ENDPOINT, Result};

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport
    Disconnected,
    /// Opening the transport
    Connecting,
    /// Transport open, session init and sync in progress
    Handshaking,
    /// Handshake and sync succeeded
    Synced {
        /// When the sync completed
        since: Instant,
    },
    /// Orderly shutdown in progress
    Closing,
}

impl ConnectionState {
    /// Check if the connection is ready for application traffic.
    #[must_use]
    pub const fn is_synced(self) -> bool {
        matches!(self, Self::Synced { .. })
    }
}

/// Why a connection generation ended.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// [`Connection::close`] was called or the connection was dropped
    Closed,
    /// The socket closed or failed while reading or writing
    TransportLost(String),
    /// Session init or sync failed after the transport opened
    HandshakeFailed(String),
    /// The transport could not be opened; no generation was started
    ConnectFailed(String),
}

/// Passed to [`Connection::on_disconnect`] callbacks.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnected {
    /// Generation that just ended, or the current counter for
    /// [`DisconnectReason::ConnectFailed`]
    pub generation: u64,
    pub reason: DisconnectReason,
}

type DisconnectCallback = Arc<dyn Fn(&Disconnected) + Send + Sync>;

/// Request path into one generation's dispatch loop.
#[derive(Clone)]
pub(crate) struct Link {
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    seq: Arc<AtomicU64>,
}

impl Link {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Frame and send a request, then wait for its response.
    ///
    /// Dropping the returned future deregisters the waiter, so a late response is
    /// treated as unmatched.
    pub(crate) async fn request(
        &self,
        opcode: Opcode,
        payload: Value,
        timeout: Duration,
    ) -> Result<Envelope> {
        // Process-wide counter, never reset across generations
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let frame = Envelope::request(seq, opcode, payload).encode()?;
        let (reply, rx): (Reply, _) = oneshot::channel();

        self.commands
            .send(Command::Send {
                seq,
                opcode,
                frame,
                deadline: tokio::time::Instant::now() + timeout.min(MAX_DEADLINE),
                timeout,
                reply,
            })
            .map_err(|_e| WsError::NotConnected)?;

        let mut guard = CancelOnDrop {
            commands: &self.commands,
            generation: self.generation,
            seq,
            armed: true,
        };
        let outcome = rx.await;
        guard.armed = false;

        match outcome {
            Ok(result) => result,
            // The loop went away without settling the waiter
            Err(_) => Err(Error::connection_lost(self.generation)),
        }
    }

    async fn pending(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or_default()
    }
}

struct CancelOnDrop<'a> {
    commands: &'a mpsc::UnboundedSender<Command>,
    generation: u64,
    seq: u64,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            _ = self.commands.send(Command::Cancel {
                generation: self.generation,
                seq: self.seq,
            });
        }
    }
}

/// State shared by the connection handle and its dispatch loop.
pub(crate) struct Core<E, P> {
    pub(crate) config: Config,
    pub(crate) parser: P,
    pub(crate) registry: PushRegistry<E>,
    state_tx: watch::Sender<ConnectionState>,
    link: RwLock<Option<Link>>,
    seq: Arc<AtomicU64>,
    generation: AtomicU64,
    disconnect_callbacks: RwLock<Vec<DisconnectCallback>>,
    snapshot: RwLock<Option<Arc<SyncState>>>,
}

impl<E, P> Core<E, P> {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn link(&self) -> Option<Link> {
        self.link
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open a new generation and make its link current.
    fn attach(&self, commands: mpsc::UnboundedSender<Command>) -> Link {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let link = Link {
            generation,
            commands,
            seq: Arc::clone(&self.seq),
        };
        *self.link.write().unwrap_or_else(PoisonError::into_inner) = Some(link.clone());
        self.set_state(ConnectionState::Handshaking);
        link
    }

    /// Drop the link of `generation` if it is still current.
    ///
    /// Whoever detaches a generation is responsible for retiring it.
    pub(crate) fn detach(&self, generation: u64, next: ConnectionState) -> bool {
        let mut link = self.link.write().unwrap_or_else(PoisonError::into_inner);
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            *link = None;
            self.set_state(next);
            true
        } else {
            false
        }
    }

    fn promote(&self, generation: u64, snapshot: SyncState) -> bool {
        let link = self.link.read().unwrap_or_else(PoisonError::into_inner);
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(snapshot));
            self.set_state(ConnectionState::Synced {
                since: Instant::now(),
            });
            true
        } else {
            false
        }
    }

    /// Close out a detached generation and notify `on_disconnect` callbacks.
    pub(crate) fn retire(&self, generation: u64, reason: DisconnectReason) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
        self.config
            .record(format!("[connection] generation {generation} ended: {reason:?}"));

        self.notify(&Disconnected { generation, reason });
    }

    /// Run `on_disconnect` callbacks, containing their panics.
    fn notify(&self, event: &Disconnected) {
        let generation = event.generation;
        // Snapshot so callbacks may register further callbacks
        let callbacks: Vec<_> = self
            .disconnect_callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Arc::clone)
            .collect();
        for callback in &callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                let panic = HandlerPanic::from_payload(panic.as_ref());
                #[cfg(feature = "tracing")]
                tracing::warn!(generation, error = %panic, "disconnect callback failed");
                #[cfg(not(feature = "tracing"))]
                let _ = &panic;
            }
        }
    }
}

/// Background tasks of one live generation.
struct Session {
    generation: u64,
    token: CancellationToken,
    /// Stops the tasks if the connection handle is dropped without `close`
    _guard: DropGuard,
    dispatch: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

impl Session {
    /// Cancel and await the keepalive, then the dispatch loop, which owns the socket.
    async fn shutdown(self) {
        self.token.cancel();
        if let Some(keepalive) = self.keepalive {
            log_join("keepalive", keepalive.await);
        }
        log_join("dispatch", self.dispatch.await);
    }
}

fn log_join(task: &'static str, joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        #[cfg(feature = "tracing")]
        tracing::error!(task, error = %e, "connection task failed");
        #[cfg(not(feature = "tracing"))]
        let _ = (task, &e);
    }
}

struct Inner<E, P> {
    core: Arc<Core<E, P>>,
    endpoint: String,
    /// Serializes `connect` and `close`
    session: Mutex<Option<Session>>,
}

/// Client for the Max realtime protocol.
///
/// One `Connection` multiplexes many in-flight requests over a single WebSocket and
/// routes server pushes to registered handlers:
/// - [`connect`](Self::connect) opens the transport, runs session init and the
///   initial sync, and starts the keepalive
/// - [`send_request`](Self::send_request) pipelines requests and matches responses
///   by sequence number, in any arrival order
/// - push handlers and [`on_disconnect`](Self::on_disconnect) callbacks outlive
///   individual transports
///
/// The connection never reconnects on its own. Watch [`state_receiver`](Self::state_receiver)
/// or register [`on_disconnect`](Self::on_disconnect) and call `connect` again, or use
/// `reconnect::run` (feature `reconnect`).
///
/// # Type Parameters
///
/// - `E`: Event type handed to push handlers
/// - `P`: Parser type that implements [`EventParser<E>`]
///
/// # Example
///
/// ```ignore
/// let connection = Connection::default();
/// connection.register_push_handler(
///     |event: &Event| event.as_message().is_some(),
///     |event| {
///         println!("{event:?}");
///         Ok(())
///     },
/// );
/// connection.connect(&identity, &ClientDescriptor::default()).await?;
/// let reply = connection
///     .request(Opcode::MSG_SEND, &json!({ "chatId": 1, "message": { "text": "hi" } }))
///     .await?;
/// ```
pub struct Connection<E = Event, P = NotificationParser> {
    inner: Arc<Inner<E, P>>,
}

impl<E, P> Clone for Connection<E, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::from_parts(
            DEFAULT_ENDPOINT.to_owned(),
            Config::default(),
            NotificationParser,
        )
    }
}

impl<E, P> Connection<E, P>
where
    E: Clone + Send + Sync + 'static,
    P: EventParser<E>,
{
    /// Create a disconnected client for `endpoint` (`ws://` or `wss://`).
    pub fn new(endpoint: &str, config: Config, parser: P) -> Result<Self> {
        let endpoint = Url::parse(endpoint)?;
        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::validation(format!(
                "unsupported endpoint scheme {}",
                endpoint.scheme()
            )));
        }
        Ok(Self::from_parts(endpoint.into(), config, parser))
    }

    fn from_parts(endpoint: String, config: Config, parser: P) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let core = Core {
            config,
            parser,
            registry: PushRegistry::default(),
            state_tx,
            link: RwLock::new(None),
            seq: Arc::new(AtomicU64::new(0)),
            generation: AtomicU64::new(0),
            disconnect_callbacks: RwLock::new(Vec::new()),
            snapshot: RwLock::new(None),
        };

        Self {
            inner: Arc::new(Inner {
                core: Arc::new(core),
                endpoint,
                session: Mutex::new(None),
            }),
        }
    }

    /// Open the transport, perform session init and the initial sync.
    ///
    /// Fails with [`Kind::Connection`](crate::error::Kind::Connection) when the socket
    /// cannot be opened, and with [`Kind::Handshake`](crate::error::Kind::Handshake)
    /// when session init or sync is rejected or times out. Calling it while a
    /// generation is live fails with [`Kind::Validation`](crate::error::Kind::Validation).
    pub async fn connect(&self, identity: &Identity, descriptor: &ClientDescriptor) -> Result<()> {
        let core = &self.inner.core;
        let mut slot = self.inner.session.lock().await;

        if let Some(session) = slot.take() {
            if core
                .link()
                .is_some_and(|link| link.generation() == session.generation)
            {
                *slot = Some(session);
                return Err(WsError::AlreadyConnected.into());
            }
            // Lost generation, detached by its loop; wait for it to finish retiring
            session.shutdown().await;
        }

        core.set_state(ConnectionState::Connecting);
        #[cfg(feature = "tracing")]
        tracing::info!(endpoint = %self.inner.endpoint, "connecting");

        let stream = match self.open().await {
            Ok(stream) => stream,
            Err(e) => {
                core.set_state(ConnectionState::Disconnected);
                core.config.record(format!("[connection] connect failed: {e}"));
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %e, "unable to open transport");
                core.notify(&Disconnected {
                    generation: core.generation.load(Ordering::SeqCst),
                    reason: DisconnectReason::ConnectFailed(e.to_string()),
                });
                return Err(e);
            }
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let link = core.attach(commands_tx);
        let generation = link.generation();
        let token = CancellationToken::new();
        let table = CorrelationTable::new(generation, core.config.max_pending_requests);
        let dispatch = tokio::spawn(
            DispatchLoop::new(Arc::clone(core), stream, commands_rx, table, token.clone()).run(),
        );
        let mut session = Session {
            generation,
            token: token.clone(),
            _guard: token.clone().drop_guard(),
            dispatch,
            keepalive: None,
        };
        core.config
            .record(format!("[connection] generation {generation} transport open"));

        let snapshot = match handshake::run(&link, identity, descriptor, &core.config).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                core.config
                    .record(format!("[connection] handshake failed: {e}"));
                #[cfg(feature = "tracing")]
                tracing::warn!(generation, error = %e, "handshake failed");
                if core.detach(generation, ConnectionState::Disconnected) {
                    session.shutdown().await;
                    core.retire(generation, DisconnectReason::HandshakeFailed(e.to_string()));
                } else {
                    session.shutdown().await;
                }
                return Err(e);
            }
        };

        #[cfg(feature = "tracing")]
        tracing::info!(
            generation,
            dialogs = snapshot.dialogs.len(),
            chats = snapshot.chats.len(),
            channels = snapshot.channels.len(),
            skipped = snapshot.skipped,
            "sync completed"
        );
        core.config.record(format!(
            "[connection] synced: dialogs={} chats={} channels={}",
            snapshot.dialogs.len(),
            snapshot.chats.len(),
            snapshot.channels.len()
        ));

        if !core.promote(generation, snapshot) {
            session.shutdown().await;
            return Err(Error::connection_lost(generation));
        }

        session.keepalive = Some(tokio::spawn(keepalive::run(
            link,
            core.config.keepalive_interval,
            core.config.request_timeout,
            token,
        )));
        *slot = Some(session);

        Ok(())
    }

    async fn open(&self) -> Result<super::dispatch::WsStream> {
        let mut request = self.inner.endpoint.as_str().into_client_request()?;
        if let Some(origin) = &self.inner.core.config.origin {
            request
                .headers_mut()
                .insert("Origin", HeaderValue::from_str(origin)?);
        }

        let (stream, _) = tokio::time::timeout(
            self.inner.core.config.connect_timeout,
            connect_async(request),
        )
        .await
        .map_err(|_e| WsError::ConnectTimeout)??;

        Ok(stream)
    }

    /// Orderly shutdown.
    ///
    /// Stops the keepalive and dispatch loop and waits for both, closes the socket, and
    /// fails every pending request with [`Kind::Cancelled`](crate::error::Kind::Cancelled).
    /// A no-op when not connected.
    pub async fn close(&self) {
        let core = &self.inner.core;
        let Some(session) = self.inner.session.lock().await.take() else {
            return;
        };

        let generation = session.generation;
        let owned = core.detach(generation, ConnectionState::Closing);
        #[cfg(feature = "tracing")]
        tracing::info!(generation, "closing connection");
        session.shutdown().await;

        if owned {
            core.retire(generation, DisconnectReason::Closed);
        }
    }

    /// Send `payload` under `opcode` and wait up to `timeout` for the response payload.
    ///
    /// Concurrent calls are pipelined over the one socket and may complete in any order.
    /// Errors:
    /// - [`Kind::Connection`](crate::error::Kind::Connection) when not connected
    /// - [`Kind::Timeout`](crate::error::Kind::Timeout) when the deadline passes
    /// - [`Kind::ConnectionLost`](crate::error::Kind::ConnectionLost) when the transport drops first
    /// - [`Kind::Cancelled`](crate::error::Kind::Cancelled) when [`close`](Self::close) runs first
    /// - [`Kind::Protocol`](crate::error::Kind::Protocol) when the server answers with an error
    pub async fn send_request<R: Serialize + ?Sized>(
        &self,
        opcode: Opcode,
        payload: &R,
        timeout: Duration,
    ) -> Result<Value> {
        let payload = serde_json::to_value(payload)?;
        let link = self.inner.core.link().ok_or(WsError::NotConnected)?;
        let response = link.request(opcode, payload, timeout).await?;
        Ok(response.payload)
    }

    /// [`send_request`](Self::send_request) with the configured request timeout.
    pub async fn request<R: Serialize + ?Sized>(&self, opcode: Opcode, payload: &R) -> Result<Value> {
        self.send_request(opcode, payload, self.inner.core.config.request_timeout)
            .await
    }

    /// Register a handler run on the dispatch loop for every push event matching `predicate`.
    ///
    /// Handlers run in registration order, before the next frame is read, and stay
    /// registered across reconnects. Errors and panics are logged and go no further.
    pub fn register_push_handler<F, H>(&self, predicate: F, handler: H) -> SubscriptionId
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
        H: Fn(&E) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.inner.core.registry.register_inline(predicate, handler)
    }

    /// Like [`register_push_handler`](Self::register_push_handler), but each matching event
    /// starts a task tracked by the connection.
    ///
    /// Task failures are logged when they finish. Tasks still running at shutdown are
    /// given the configured grace period, then aborted.
    pub fn register_async_push_handler<F, H, Fut>(&self, predicate: F, handler: H) -> SubscriptionId
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
        H: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.inner.core.registry.register_spawned(predicate, handler)
    }

    /// Stream of push events matching `predicate`.
    ///
    /// Backed by a push handler, so it keeps yielding across reconnects. Events are
    /// dropped while the stream is not being polled only if it has been dropped.
    pub fn subscribe<F>(&self, predicate: F) -> impl Stream<Item = E> + use<E, P, F>
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.register_push_handler(predicate, move |event: &E| {
            // A dropped stream only loses its own events
            _ = tx.send(event.clone());
            Ok(())
        });

        async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }
    }

    /// Register a callback fired once on every transition into
    /// [`ConnectionState::Disconnected`]: when a generation ends, and when `connect`
    /// fails to open the transport.
    pub fn on_disconnect<F>(&self, callback: F)
    where
        F: Fn(&Disconnected) + Send + Sync + 'static,
    {
        self.inner
            .core
            .disconnect_callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(callback));
    }

    /// Get the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.core.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// A transition to [`ConnectionState::Disconnected`] is the signal for an outer
    /// retry loop to call [`connect`](Self::connect) again.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.core.state_tx.subscribe()
    }

    /// Current generation counter.
    ///
    /// Advances when a transport opens and again when its generation ends.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.core.generation.load(Ordering::SeqCst)
    }

    /// Snapshot from the most recent successful sync.
    #[must_use]
    pub fn snapshot(&self) -> Option<Arc<SyncState>> {
        self.inner
            .core
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of requests awaiting a response in the live generation.
    pub async fn pending_requests(&self) -> usize {
        match self.inner.core.link() {
            Some(link) => link.pending().await,
            None => 0,
        }
    }

    /// Number of registered push handlers.
    #[must_use]
    pub fn push_handlers(&self) -> usize {
        self.inner.core.registry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn new_should_reject_non_websocket_endpoints() {
        let error = Connection::new("https://example.com", Config::default(), NotificationParser)
            .err()
            .unwrap();
        assert_eq!(error.kind(), Kind::Validation);

        let error = Connection::new("not a url", Config::default(), NotificationParser)
            .err()
            .unwrap();
        assert_eq!(error.kind(), Kind::Validation);
    }

    #[tokio::test]
    async fn request_without_connection_should_fail() {
        let connection = Connection::default();

        let error = connection
            .send_request(Opcode::PING, &serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert_eq!(error.kind(), Kind::Connection);
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::NotConnected)
        ));
        assert_eq!(connection.connection_state(), ConnectionState::Disconnected);
        assert_eq!(connection.pending_requests().await, 0);
        assert!(connection.snapshot().is_none());
    }

    #[tokio::test]
    async fn close_without_connection_should_be_noop() {
        let connection = Connection::default();
        connection.close().await;

        assert_eq!(connection.generation(), 0);
        assert_eq!(connection.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn subscribe_should_register_handler() {
        let connection = Connection::default();
        let _stream = connection.subscribe(|_| true);

        assert_eq!(connection.push_handlers(), 1);
    }

    #[test]
    fn retire_should_notify_callbacks_and_survive_panics() {
        let connection = Connection::default();
        let seen = Arc::new(RwLock::new(Vec::new()));
        connection.on_disconnect(|_| panic!("callback exploded"));
        let sink = Arc::clone(&seen);
        connection.on_disconnect(move |event| sink.write().unwrap().push(event.clone()));

        connection
            .inner
            .core
            .retire(3, DisconnectReason::TransportLost("reset".to_owned()));

        assert_eq!(
            *seen.read().unwrap(),
            [Disconnected {
                generation: 3,
                reason: DisconnectReason::TransportLost("reset".to_owned()),
            }]
        );
        assert_eq!(connection.generation(), 1);
    }
}
