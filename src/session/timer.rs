//! Single-shot, cancellable deadlines.
//!
//! An armed deadline is a spawned task that sleeps and then posts an event
//! into the session queue. Because the event may already be queued when
//! the deadline is cancelled, the consumer must [`claim`](DeadlineTimer::claim)
//! an elapsed deadline before acting on it; a cancelled or already-claimed
//! deadline is never claimed.

use std::collections::HashMap;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// Identity of an armed deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeadlineId(u64);

impl std::fmt::Display for DeadlineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deadline-{}", self.0)
    }
}

/// Arms deadlines that post an event of type `E` when they elapse.
pub struct DeadlineTimer<E> {
    tx: mpsc::UnboundedSender<E>,
    runtime: Handle,
    next_id: u64,
    armed: HashMap<DeadlineId, JoinHandle<()>>,
}

impl<E: Send + 'static> DeadlineTimer<E> {
    /// Create a timer posting into `tx`.
    ///
    /// Must be called from within a tokio runtime; deadlines run on that
    /// runtime whichever thread arms them.
    pub fn new(tx: mpsc::UnboundedSender<E>) -> Self {
        Self {
            tx,
            runtime: Handle::current(),
            next_id: 0,
            armed: HashMap::new(),
        }
    }

    /// Arm a deadline. `on_elapsed` builds the event posted after `duration`.
    pub fn arm<F>(&mut self, duration: Duration, on_elapsed: F) -> DeadlineId
    where
        F: FnOnce(DeadlineId) -> E + Send + 'static,
    {
        self.next_id += 1;
        let id = DeadlineId(self.next_id);
        let tx = self.tx.clone();

        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = tx.send(on_elapsed(id));
        });

        trace!("Armed {} for {:?}", id, duration);
        self.armed.insert(id, handle);
        id
    }

    /// Cancel a deadline. Idempotent; a no-op after it elapsed or was claimed.
    pub fn cancel(&mut self, id: DeadlineId) -> bool {
        match self.armed.remove(&id) {
            Some(handle) => {
                handle.abort();
                trace!("Cancelled {}", id);
                true
            }
            None => false,
        }
    }

    /// Claim an elapsed deadline. Returns true exactly once per armed,
    /// uncancelled deadline.
    pub fn claim(&mut self, id: DeadlineId) -> bool {
        self.armed.remove(&id).is_some()
    }

    /// Check if a deadline is still armed.
    pub fn is_armed(&self, id: DeadlineId) -> bool {
        self.armed.contains_key(&id)
    }

    /// Number of armed deadlines.
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    /// Cancel every armed deadline.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }
}

impl<E> Drop for DeadlineTimer<E> {
    fn drop(&mut self) {
        for (_, handle) in self.armed.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_deadline_elapses_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DeadlineTimer::new(tx);

        let id = timer.arm(Duration::from_secs(5), |id| id);
        assert!(timer.is_armed(id));

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(rx.try_recv().ok(), Some(id));
        assert!(timer.claim(id));
        assert!(!timer.claim(id));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_deadline_never_posts() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DeadlineTimer::new(tx);

        let id = timer.arm(Duration::from_secs(5), |id| id);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(timer.cancel(id));
        assert!(!timer.cancel(id));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(timer.armed_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_elapsed_is_noop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DeadlineTimer::new(tx);

        let id = timer.arm(Duration::from_millis(100), |id| id);
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Posted but not yet consumed: cancelling wins over the queued event.
        assert!(timer.cancel(id));
        assert_eq!(rx.try_recv().ok(), Some(id));
        assert!(!timer.claim(id));
    }

    #[tokio::test]
    async fn test_arm_from_thread_outside_runtime() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut timer = DeadlineTimer::new(tx);

        let (timer, id) = std::thread::spawn(move || {
            let id = timer.arm(Duration::from_millis(10), |id| id);
            (timer, id)
        })
        .join()
        .expect("arming off the runtime must not panic");

        assert_eq!(rx.recv().await, Some(id));
        drop(timer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (tx, mut rx) = mpsc::unbounded_channel::<DeadlineId>();
        let mut timer = DeadlineTimer::new(tx);

        timer.arm(Duration::from_secs(1), |id| id);
        timer.arm(Duration::from_secs(2), |id| id);
        assert_eq!(timer.armed_count(), 2);

        timer.cancel_all();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
