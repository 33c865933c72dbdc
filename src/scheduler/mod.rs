use crate::config::LifoSettings;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

/// Why a queue refused a request. `Full` maps to 503, `Timeout` to 502.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    Full,
    Timeout,
}

/// Bounded admission queue with last-in-first-out discipline.
///
/// Up to `max_concurrency` requests hold a slot at once; up to
/// `max_queue_size` more wait. When a slot frees, the *most recently*
/// enqueued waiter is admitted — under overload the freshest requests are
/// the ones most likely to still have a client waiting for them.
pub struct LifoQueue {
    settings: LifoSettings,
    state: Mutex<QueueState>,
}

struct QueueState {
    active: usize,
    /// Waiter stack; push and pop both happen at the back.
    waiters: Vec<oneshot::Sender<()>>,
}

/// RAII slot handle. Dropping it admits the next waiter or frees the slot.
pub struct QueuePermit {
    queue: Arc<LifoQueue>,
}

impl LifoQueue {
    pub fn new(settings: LifoSettings) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state: Mutex::new(QueueState {
                active: 0,
                waiters: Vec::new(),
            }),
        })
    }

    pub fn settings(&self) -> &LifoSettings {
        &self.settings
    }

    /// Wait for admission. Resolves immediately while capacity is free,
    /// otherwise parks on the waiter stack until handed a slot, the queue
    /// overflows, or the configured timeout elapses.
    pub async fn wait(self: &Arc<Self>) -> Result<QueuePermit, QueueError> {
        let rx = {
            let mut state = self.state.lock().expect("lifo lock poisoned");

            if state.active < self.settings.max_concurrency {
                state.active += 1;
                return Ok(QueuePermit {
                    queue: self.clone(),
                });
            }

            // Timed-out waiters leave a dead sender behind; purge them
            // before judging fullness.
            state.waiters.retain(|w| !w.is_closed());
            if state.waiters.len() >= self.settings.max_queue_size {
                return Err(QueueError::Full);
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push(tx);
            rx
        };

        match tokio::time::timeout(self.settings.timeout, rx).await {
            Ok(Ok(())) => Ok(QueuePermit {
                queue: self.clone(),
            }),
            // Sender dropped without handoff: the queue was torn down.
            Ok(Err(_)) => Err(QueueError::Full),
            Err(_) => Err(QueueError::Timeout),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().expect("lifo lock poisoned");
        // Hand the slot to the newest live waiter; `active` stays constant
        // across a handoff.
        while let Some(waiter) = state.waiters.pop() {
            if waiter.send(()).is_ok() {
                return;
            }
        }
        state.active -= 1;
    }
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        self.queue.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(max_concurrency: usize, max_queue_size: usize, timeout: Duration) -> LifoSettings {
        LifoSettings {
            max_concurrency,
            max_queue_size,
            timeout,
        }
    }

    #[tokio::test]
    async fn test_admits_up_to_concurrency() {
        let queue = LifoQueue::new(settings(2, 2, Duration::from_secs(1)));
        let _a = queue.wait().await.unwrap();
        let _b = queue.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_when_queue_full() {
        let queue = LifoQueue::new(settings(1, 1, Duration::from_secs(5)));
        let _active = queue.wait().await.unwrap();

        let q = queue.clone();
        let _queued = tokio::spawn(async move { q.wait().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(queue.wait().await.err(), Some(QueueError::Full));
    }

    #[tokio::test]
    async fn test_times_out_waiting() {
        let queue = LifoQueue::new(settings(1, 4, Duration::from_millis(50)));
        let _active = queue.wait().await.unwrap();
        assert_eq!(queue.wait().await.err(), Some(QueueError::Timeout));
    }

    #[tokio::test]
    async fn test_release_admits_waiter() {
        let queue = LifoQueue::new(settings(1, 4, Duration::from_secs(5)));
        let active = queue.wait().await.unwrap();

        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.wait().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(active);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_last_in_first_out_order() {
        let queue = LifoQueue::new(settings(1, 4, Duration::from_secs(5)));
        let active = queue.wait().await.unwrap();

        let q1 = queue.clone();
        let first = tokio::spawn(async move {
            let permit = q1.wait().await;
            (1, permit)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let q2 = queue.clone();
        let second = tokio::spawn(async move {
            let permit = q2.wait().await;
            (2, permit)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The newest waiter (second) must win the freed slot.
        drop(active);
        let (id, permit) = second.await.unwrap();
        assert_eq!(id, 2);
        assert!(permit.is_ok());

        drop(permit);
        let (id, permit) = first.await.unwrap();
        assert_eq!(id, 1);
        assert!(permit.is_ok());
    }

    #[tokio::test]
    async fn test_timed_out_waiter_does_not_count_as_queued() {
        let queue = LifoQueue::new(settings(1, 1, Duration::from_millis(20)));
        let _active = queue.wait().await.unwrap();

        // Fills the queue slot, then times out and abandons it.
        assert_eq!(queue.wait().await.err(), Some(QueueError::Timeout));

        // The abandoned slot must be reusable.
        let q = queue.clone();
        let waiter = tokio::spawn(async move { q.wait().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        drop(_active);
        assert!(waiter.await.unwrap().is_ok());
    }
}
