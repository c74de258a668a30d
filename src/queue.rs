//! FIFO serialization of connection operations.
//!
//! Opening and closing stream transports must never interleave, including
//! across independent client instances. A `ConnectionQueue` is the single
//! lane those operations run through: strict push order, one operation in
//! flight at a time, one scheduler-tick pause between operations.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

type PendingOp = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

static GLOBAL_QUEUE: OnceLock<ConnectionQueue> = OnceLock::new();

/// Shared FIFO lane for connect/disconnect operations.
///
/// Clones share the same lane. Clients default to the process-wide
/// [`ConnectionQueue::global`] lane so independently constructed instances
/// still serialize against each other; tests inject private lanes.
#[derive(Clone, Default)]
pub struct ConnectionQueue {
    inner: Arc<QueueInner>,
}

#[derive(Default)]
struct QueueInner {
    // The front slot is emptied while its operation runs, so the deque stays
    // non-empty for the whole lifetime of an in-flight operation and `push`
    // can tell a busy lane from an idle one by length alone.
    pending: Mutex<VecDeque<Option<PendingOp>>>,
}

// Queued operations are opaque futures; the lane is described by occupancy.
impl fmt::Debug for ConnectionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionQueue")
            .field("pending", &self.lock_pending().len())
            .finish()
    }
}

impl ConnectionQueue {
    /// Creates an empty private lane.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide lane.
    pub fn global() -> Self {
        GLOBAL_QUEUE.get_or_init(Self::new).clone()
    }

    /// Appends an operation, starting the drain when the lane was idle.
    ///
    /// Operations run strictly in push order and always run eventually; the
    /// lane observes completion only, never success or failure. Must be
    /// called within a Tokio runtime, since draining happens on a spawned
    /// task.
    pub fn push<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let was_idle = {
            let mut pending = self.lock_pending();
            pending.push_back(Some(Box::pin(op)));
            pending.len() == 1
        };

        if was_idle {
            let queue = self.clone();
            tokio::spawn(async move {
                queue.drain().await;
            });
        }
    }

    /// Runs queued operations one at a time until the lane empties.
    async fn drain(&self) {
        loop {
            let Some(op) = self.take_front() else {
                return;
            };

            op.await;
            debounce_tick().await;

            // Popping and the emptiness check share one lock acquisition, so
            // a concurrent push either lands before the pop (and is drained
            // here) or sees an idle lane and starts its own drain.
            let more = {
                let mut pending = self.lock_pending();
                pending.pop_front();
                !pending.is_empty()
            };
            if !more {
                return;
            }
        }
    }

    fn take_front(&self) -> Option<PendingOp> {
        self.lock_pending().front_mut().and_then(Option::take)
    }

    fn lock_pending(&self) -> MutexGuard<'_, VecDeque<Option<PendingOp>>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock_pending().len()
    }
}

/// Yields once so work queued while the finished operation ran gets a chance
/// to execute before the next operation starts.
async fn debounce_tick() {
    tokio::task::yield_now().await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio::time::timeout;

    use super::ConnectionQueue;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime")
    }

    #[test]
    fn runs_operations_in_push_order() {
        runtime().block_on(async {
            let queue = ConnectionQueue::new();
            let order = Arc::new(Mutex::new(Vec::new()));
            let (done_tx, done_rx) = oneshot::channel();

            for index in 0..3 {
                let order = Arc::clone(&order);
                queue.push(async move {
                    order.lock().expect("order lock").push(index);
                });
            }
            queue.push(async move {
                let _ = done_tx.send(());
            });

            timeout(Duration::from_secs(1), done_rx)
                .await
                .expect("queue should drain")
                .expect("done signal");
            assert_eq!(*order.lock().expect("order lock"), vec![0, 1, 2]);
        });
    }

    #[test]
    fn push_during_active_operation_waits_for_the_front() {
        runtime().block_on(async {
            let queue = ConnectionQueue::new();
            let order = Arc::new(Mutex::new(Vec::new()));
            let (started_tx, started_rx) = oneshot::channel();
            let (gate_tx, gate_rx) = oneshot::channel::<()>();
            let (done_tx, done_rx) = oneshot::channel();

            {
                let order = Arc::clone(&order);
                queue.push(async move {
                    order.lock().expect("order lock").push(1);
                    let _ = started_tx.send(());
                    let _ = gate_rx.await;
                });
            }

            timeout(Duration::from_secs(1), started_rx)
                .await
                .expect("first operation should start")
                .expect("started signal");

            {
                let order = Arc::clone(&order);
                queue.push(async move {
                    order.lock().expect("order lock").push(2);
                    let _ = done_tx.send(());
                });
            }

            tokio::task::yield_now().await;
            assert_eq!(*order.lock().expect("order lock"), vec![1]);
            assert_eq!(queue.len(), 2);

            let _ = gate_tx.send(());
            timeout(Duration::from_secs(1), done_rx)
                .await
                .expect("second operation should run after the gate")
                .expect("done signal");
            assert_eq!(*order.lock().expect("order lock"), vec![1, 2]);
        });
    }

    #[test]
    fn idle_lane_runs_a_pushed_operation_immediately() {
        runtime().block_on(async {
            let queue = ConnectionQueue::new();
            let (done_tx, done_rx) = oneshot::channel();

            queue.push(async move {
                let _ = done_tx.send(());
            });

            timeout(Duration::from_secs(1), done_rx)
                .await
                .expect("idle lane should run the operation")
                .expect("done signal");

            // The done signal fires mid-operation; let the drain pop the
            // spent slot before checking emptiness.
            tokio::task::yield_now().await;
            assert_eq!(queue.len(), 0);
        });
    }

    #[test]
    fn clones_share_one_lane() {
        runtime().block_on(async {
            let queue = ConnectionQueue::new();
            let sibling = queue.clone();
            let calls = Arc::new(AtomicUsize::new(0));
            let (done_tx, done_rx) = oneshot::channel();

            for _ in 0..2 {
                let calls = Arc::clone(&calls);
                queue.push(async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                });
            }
            sibling.push(async move {
                let _ = done_tx.send(());
            });

            timeout(Duration::from_secs(1), done_rx)
                .await
                .expect("shared lane should drain")
                .expect("done signal");
            assert_eq!(calls.load(Ordering::SeqCst), 2);
        });
    }

    #[test]
    fn lane_restarts_after_draining_to_empty() {
        runtime().block_on(async {
            let queue = ConnectionQueue::new();

            let (first_tx, first_rx) = oneshot::channel();
            queue.push(async move {
                let _ = first_tx.send(());
            });
            timeout(Duration::from_secs(1), first_rx)
                .await
                .expect("first drain")
                .expect("first signal");

            let (second_tx, second_rx) = oneshot::channel();
            queue.push(async move {
                let _ = second_tx.send(());
            });
            timeout(Duration::from_secs(1), second_rx)
                .await
                .expect("second drain")
                .expect("second signal");
        });
    }

    #[test]
    fn global_lane_is_shared() {
        let first = ConnectionQueue::global();
        let second = ConnectionQueue::global();
        assert!(Arc::ptr_eq(&first.inner, &second.inner));
    }

    #[test]
    fn debug_reports_the_pending_length() {
        let queue = ConnectionQueue::new();
        assert_eq!(format!("{queue:?}"), "ConnectionQueue { pending: 0 }");
    }
}
