//! Push subscriptions and the tasks spawned by asynchronous handlers.
//!
//! Subscriptions live on the connection rather than on a single socket, so they keep
//! working across reconnects. The list is append-only and consulted in registration
//! order. Handler failures, whether returned errors or panics, are logged here and
//! never reach the dispatch loop or other handlers.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::task::{JoinError, JoinSet};

use super::envelope::Opcode;
use crate::error::{BoxError, HandlerPanic, PushHandlerError};

type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;
type InlineHandler<E> = Box<dyn Fn(&E) -> Result<(), BoxError> + Send + Sync>;
type SpawnedHandler<E> = Box<dyn Fn(E) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Registration index of a push handler.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub usize);

enum Callback<E> {
    /// Runs on the dispatch loop before the next frame is read
    Inline(InlineHandler<E>),
    /// Runs as its own task tracked by [`HandlerTasks`]
    Spawned(SpawnedHandler<E>),
}

struct PushSubscription<E> {
    predicate: Predicate<E>,
    callback: Callback<E>,
}

pub(crate) struct PushRegistry<E> {
    subscriptions: RwLock<Vec<Arc<PushSubscription<E>>>>,
}

impl<E> Default for PushRegistry<E> {
    fn default() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
        }
    }
}

impl<E: Clone + Send + 'static> PushRegistry<E> {
    pub(crate) fn register_inline<F, H>(&self, predicate: F, handler: H) -> SubscriptionId
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
        H: Fn(&E) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.push(PushSubscription {
            predicate: Box::new(predicate),
            callback: Callback::Inline(Box::new(handler)),
        })
    }

    pub(crate) fn register_spawned<F, H, Fut>(&self, predicate: F, handler: H) -> SubscriptionId
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
        H: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.push(PushSubscription {
            predicate: Box::new(predicate),
            callback: Callback::Spawned(Box::new(move |event| handler(event).boxed())),
        })
    }

    fn push(&self, subscription: PushSubscription<E>) -> SubscriptionId {
        // Append-only list of complete entries; a poisoned lock is still consistent
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        subscriptions.push(Arc::new(subscription));
        SubscriptionId(subscriptions.len() - 1)
    }

    pub(crate) fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Offer `event` to every subscription in registration order.
    ///
    /// The list is snapshotted first so handlers may register further handlers without
    /// deadlocking; those only see later frames.
    pub(crate) fn deliver(&self, opcode: Opcode, event: &E, tasks: &mut HandlerTasks) -> usize {
        let snapshot: Vec<_> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Arc::clone)
            .collect();

        let mut matched = 0;
        for (index, subscription) in snapshot.iter().enumerate() {
            match catch_unwind(AssertUnwindSafe(|| (subscription.predicate)(event))) {
                Ok(true) => matched += 1,
                Ok(false) => continue,
                Err(panic) => {
                    log_failure(&PushHandlerError {
                        handler: index,
                        opcode,
                        source: Box::new(HandlerPanic::from_payload(panic.as_ref())),
                    });
                    continue;
                }
            }

            match &subscription.callback {
                Callback::Inline(handler) => {
                    let outcome = match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                        Ok(outcome) => outcome,
                        Err(panic) => Err(Box::new(HandlerPanic::from_payload(panic.as_ref())) as BoxError),
                    };
                    if let Err(source) = outcome {
                        log_failure(&PushHandlerError {
                            handler: index,
                            opcode,
                            source,
                        });
                    }
                }
                Callback::Spawned(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler(event.clone()))) {
                        Ok(future) => tasks.spawn(index, opcode, future),
                        Err(panic) => log_failure(&PushHandlerError {
                            handler: index,
                            opcode,
                            source: Box::new(HandlerPanic::from_payload(panic.as_ref())),
                        }),
                    }
                }
            }
        }

        matched
    }
}

fn log_failure(error: &PushHandlerError) {
    #[cfg(feature = "tracing")]
    tracing::warn!(handler = error.handler, opcode = %error.opcode, error = %error, "push handler failed");
    #[cfg(not(feature = "tracing"))]
    let _ = error;
}

/// Registry of in-flight asynchronous handler tasks for one connection generation.
///
/// Completed tasks are reaped by the dispatch loop so every failure is logged as it
/// happens. On shutdown the remaining tasks get a grace period, then are aborted and
/// joined, so none outlives its connection.
#[derive(Default)]
pub(crate) struct HandlerTasks {
    set: JoinSet<Result<(), PushHandlerError>>,
}

impl HandlerTasks {
    fn spawn(&mut self, handler: usize, opcode: Opcode, future: BoxFuture<'static, Result<(), BoxError>>) {
        self.set.spawn(async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(source)) => Err(PushHandlerError {
                    handler,
                    opcode,
                    source,
                }),
                Err(panic) => Err(PushHandlerError {
                    handler,
                    opcode,
                    source: Box::new(HandlerPanic::from_payload(panic.as_ref())),
                }),
            }
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.set.len()
    }

    /// Wait for the next task to finish. Resolves to `None` at once when none are running.
    pub(crate) async fn join_next(&mut self) -> Option<Result<Result<(), PushHandlerError>, JoinError>> {
        self.set.join_next().await
    }

    pub(crate) fn observe(joined: Result<Result<(), PushHandlerError>, JoinError>) {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(error)) => log_failure(&error),
            Err(error) => {
                #[cfg(feature = "tracing")]
                if error.is_cancelled() {
                    tracing::debug!("push handler task aborted at shutdown");
                } else {
                    tracing::warn!(error = %error, "push handler task failed to join");
                }
                #[cfg(not(feature = "tracing"))]
                let _ = &error;
            }
        }
    }

    /// Give running tasks `grace` to finish, then abort the rest and join them.
    pub(crate) async fn shutdown(mut self, grace: Duration) {
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = self.set.join_next().await {
                Self::observe(joined);
            }
        })
        .await;

        if drained.is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!(remaining = self.set.len(), "aborting push handler tasks");
            self.set.abort_all();
            while let Some(joined) = self.set.join_next().await {
                Self::observe(joined);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Boom;

    impl std::fmt::Display for Boom {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("boom")
        }
    }

    impl std::error::Error for Boom {}

    #[tokio::test]
    async fn deliver_should_follow_registration_order() {
        let registry = PushRegistry::<u32>::default();
        let seen = Arc::new(RwLock::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            registry.register_inline(
                |_| true,
                move |event| {
                    seen.write().unwrap().push((tag, *event));
                    Ok(())
                },
            );
        }

        let mut tasks = HandlerTasks::default();
        assert_eq!(registry.deliver(Opcode::NOTIF_MESSAGE, &7, &mut tasks), 2);
        assert_eq!(*seen.read().unwrap(), [("first", 7), ("second", 7)]);
    }

    #[tokio::test]
    async fn failing_handler_should_not_stop_later_handlers() {
        let registry = PushRegistry::<u32>::default();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register_inline(|_| true, |_| Err(Box::new(Boom) as BoxError));
        registry.register_inline(|_| true, |_| panic!("handler exploded"));
        registry.register_inline(|_| panic!("predicate exploded"), |_| Ok(()));
        let counter = Arc::clone(&calls);
        registry.register_inline(
            |event| *event > 1,
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        let mut tasks = HandlerTasks::default();
        registry.deliver(Opcode::NOTIF_MESSAGE, &1, &mut tasks);
        registry.deliver(Opcode::NOTIF_MESSAGE, &2, &mut tasks);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 4);
    }

    #[tokio::test]
    async fn spawned_failures_should_be_observed() {
        let registry = PushRegistry::<u32>::default();
        registry.register_spawned(|_| true, |_| async { Err(Box::new(Boom) as BoxError) });
        registry.register_spawned(|_| true, |_| async { panic!("async handler exploded") });

        let mut tasks = HandlerTasks::default();
        registry.deliver(Opcode::NOTIF_MESSAGE, &1, &mut tasks);
        assert_eq!(tasks.len(), 2);

        let mut failures = 0;
        while let Some(joined) = tasks.join_next().await {
            if matches!(joined, Ok(Err(_))) {
                failures += 1;
            }
        }
        assert_eq!(failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_should_abort_stragglers_after_grace() {
        let registry = PushRegistry::<u32>::default();
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&finished);
        registry.register_spawned(
            |_| true,
            move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        let mut tasks = HandlerTasks::default();
        registry.deliver(Opcode::NOTIF_MESSAGE, &1, &mut tasks);
        tasks.shutdown(Duration::from_secs(1)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
