//! The single task that owns a generation's socket.
//!
//! It reads frames, settles waiters in the correlation table, hands pushes to the
//! registered handlers and performs every socket write, so frames from concurrent
//! callers are never interleaved. The table is confined to this task.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::connection::{ConnectionState, Core, DisconnectReason};
use super::correlation::{CorrelationTable, Reply, Resolution};
use super::envelope::{Envelope, Opcode};
use super::push::HandlerTasks;
use super::traits::EventParser;
use crate::error::{Error, HandlerPanic};

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Requests from connection handles to the dispatch loop.
pub(crate) enum Command {
    /// Register a waiter for `seq`, then write `frame`
    Send {
        seq: u64,
        opcode: Opcode,
        frame: String,
        deadline: Instant,
        timeout: Duration,
        reply: Reply,
    },
    /// The caller stopped waiting for `seq`
    Cancel { generation: u64, seq: u64 },
    PendingCount(oneshot::Sender<usize>),
}

enum Exit {
    /// Shutdown requested through the cancellation token
    Cancelled,
    /// The transport closed or failed
    Lost(String),
}

pub(crate) struct DispatchLoop<E, P> {
    core: Arc<Core<E, P>>,
    generation: u64,
    read: SplitStream<WsStream>,
    write: SplitSink<WsStream, Message>,
    commands: mpsc::UnboundedReceiver<Command>,
    table: CorrelationTable,
    tasks: HandlerTasks,
    token: CancellationToken,
}

impl<E, P> DispatchLoop<E, P>
where
    E: Clone + Send + Sync + 'static,
    P: EventParser<E>,
{
    pub(crate) fn new(
        core: Arc<Core<E, P>>,
        stream: WsStream,
        commands: mpsc::UnboundedReceiver<Command>,
        table: CorrelationTable,
        token: CancellationToken,
    ) -> Self {
        let (write, read) = stream.split();
        Self {
            core,
            generation: table.generation(),
            read,
            write,
            commands,
            table,
            tasks: HandlerTasks::default(),
            token,
        }
    }

    pub(crate) async fn run(mut self) {
        #[cfg(feature = "tracing")]
        tracing::debug!(generation = self.generation, "dispatch loop started");

        let exit = loop {
            tokio::select! {
                biased;

                // Commands and deadlines are polled ahead of socket reads
                () = self.token.cancelled() => break Exit::Cancelled,

                Some(command) = self.commands.recv() => {
                    if let Err(reason) = self.on_command(command).await {
                        break Exit::Lost(reason);
                    }
                }

                Some(seq) = self.table.next_expired() => {
                    if self.table.expire(seq) {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(generation = self.generation, seq, "request timed out");
                    }
                }

                frame = self.read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_frame(text.as_bytes()),
                    Some(Ok(Message::Binary(bytes))) => self.on_frame(&bytes),
                    Some(Ok(Message::Close(frame))) => {
                        break Exit::Lost(frame.map_or_else(
                            || "closed by peer".to_owned(),
                            |f| format!("closed by peer: {} {}", f.code, f.reason),
                        ));
                    }
                    Some(Ok(_)) => {
                        // Control frames are answered by tungstenite
                    }
                    Some(Err(e)) => break Exit::Lost(e.to_string()),
                    None => break Exit::Lost("stream ended".to_owned()),
                },

                Some(joined) = self.tasks.join_next() => HandlerTasks::observe(joined),
            }
        };

        self.finish(exit).await;
    }

    async fn on_command(&mut self, command: Command) -> std::result::Result<(), String> {
        match command {
            Command::Send {
                seq,
                opcode,
                frame,
                deadline,
                timeout,
                reply,
            } => {
                if !self.table.register(seq, opcode, deadline, timeout, reply) {
                    return Ok(());
                }

                #[cfg(feature = "tracing")]
                tracing::trace!(generation = self.generation, seq, %opcode, "sending frame");

                // Waiter stays registered; teardown fails it with the rest
                self.write
                    .send(Message::Text(frame.into()))
                    .await
                    .map_err(|e| e.to_string())
            }
            Command::Cancel { generation, seq } => {
                if generation == self.generation && self.table.cancel(seq) {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(generation, seq, "request abandoned by caller");
                }
                Ok(())
            }
            Command::PendingCount(tx) => {
                _ = tx.send(self.table.len());
                Ok(())
            }
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    generation = self.generation,
                    frame = %String::from_utf8_lossy(bytes),
                    error = %e,
                    "failed to parse frame"
                );
                self.core
                    .config
                    .record(format!("[connection] malformed frame skipped: {e}"));
                return;
            }
        };

        #[cfg(feature = "tracing")]
        tracing::trace!(
            generation = self.generation,
            seq = envelope.seq,
            opcode = %envelope.opcode,
            cmd = envelope.cmd.0,
            "received frame"
        );

        // Server pushes carry the server's own seq counter and never match a waiter
        if !envelope.cmd.is_reply() {
            self.on_push(&envelope);
            return;
        }

        match self.table.resolve(envelope) {
            Resolution::Resolved { abandoned } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(generation = self.generation, abandoned, "response matched");
                #[cfg(not(feature = "tracing"))]
                let _ = abandoned;
            }
            Resolution::Unmatched(envelope) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    generation = self.generation,
                    seq = envelope.seq,
                    opcode = %envelope.opcode,
                    "dropping response without a pending request"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = envelope;
            }
        }
    }

    fn on_push(&mut self, envelope: &Envelope) {
        let parsed = catch_unwind(AssertUnwindSafe(|| self.core.parser.parse(envelope)))
            .unwrap_or_else(|panic| {
                Err(Error::with_source(
                    crate::error::Kind::Internal,
                    HandlerPanic::from_payload(panic.as_ref()),
                ))
            });

        let event = match parsed {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    generation = self.generation,
                    opcode = %envelope.opcode,
                    error = %e,
                    "failed to decode push"
                );
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                return;
            }
        };

        let matched = self
            .core
            .registry
            .deliver(envelope.opcode, &event, &mut self.tasks);

        #[cfg(feature = "tracing")]
        tracing::trace!(opcode = %envelope.opcode, matched, "push delivered");
        #[cfg(not(feature = "tracing"))]
        let _ = matched;
    }

    async fn finish(mut self, exit: Exit) {
        let generation = self.generation;

        match exit {
            Exit::Lost(reason) => {
                #[cfg(feature = "tracing")]
                tracing::error!(generation, reason = %reason, "connection lost");
                self.core
                    .config
                    .record(format!("[connection] connection lost: {reason}"));

                let owned = self.core.detach(generation, ConnectionState::Disconnected);
                let failed = self.fail_pending(|_| Error::connection_lost(generation));
                #[cfg(feature = "tracing")]
                tracing::debug!(generation, failed, "pending requests failed");
                #[cfg(not(feature = "tracing"))]
                let _ = failed;

                // Stops the keepalive
                self.token.cancel();
                if owned {
                    self.core
                        .retire(generation, DisconnectReason::TransportLost(reason));
                }
            }
            Exit::Cancelled => {
                let failed = self.fail_pending(Error::cancelled);
                #[cfg(feature = "tracing")]
                tracing::debug!(generation, failed, "dispatch loop cancelled");
                #[cfg(not(feature = "tracing"))]
                let _ = failed;

                let grace = self.core.config.shutdown_grace;
                if let Ok(Err(e)) = tokio::time::timeout(grace, self.write.close()).await {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(generation, error = %e, "close handshake failed");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }

                // Handle dropped without `close`
                if self.core.detach(generation, ConnectionState::Disconnected) {
                    self.core.retire(generation, DisconnectReason::Closed);
                }
            }
        }

        self.tasks.shutdown(self.core.config.shutdown_grace).await;
    }

    /// Fail registered waiters and any requests still queued behind them.
    fn fail_pending<F: Fn(u64) -> Error>(&mut self, make: F) -> usize {
        let mut failed = self.table.fail_all(&make);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Send { seq, reply, .. } = command {
                _ = reply.send(Err(make(seq)));
                failed += 1;
            }
        }

        failed
    }
}
