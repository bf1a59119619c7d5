//! Deadline-ordered reap queue and the task that drains it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::SessionManager;

/// Pending reap deadlines, earliest first.
#[derive(Debug, Default)]
pub(crate) struct ReapQueue {
    heap: Mutex<BinaryHeap<Reverse<(Instant, String)>>>,
    changed: Notify,
}

impl ReapQueue {
    pub(crate) fn push(&self, deadline: Instant, session_id: String) {
        self.heap.lock().push(Reverse((deadline, session_id)));
        self.changed.notify_one();
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse((deadline, _))| *deadline)
    }

    /// Removes and returns the earliest entry if it is due at `now`.
    pub(crate) fn pop_due(&self, now: Instant) -> Option<(Instant, String)> {
        let mut heap = self.heap.lock();
        match heap.peek() {
            Some(Reverse((deadline, _))) if *deadline <= now => heap.pop().map(|Reverse(e)| e),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.lock().len()
    }
}

/// Sleeps until the earliest deadline, reaps, and repeats. Wakes early when
/// an earlier deadline is queued.
pub(crate) async fn run(
    queue: Arc<ReapQueue>,
    manager: Weak<SessionManager>,
    cancel: CancellationToken,
) {
    loop {
        let next = queue.next_deadline();
        tokio::select! {
            () = cancel.cancelled() => break,
            () = queue.changed.notified() => continue,
            () = sleep_until(next) => {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let reaped = manager.reap_expired_at(Instant::now());
                if !reaped.is_empty() {
                    tracing::debug!(count = reaped.len(), "Reaped sessions");
                }
            }
        }
    }
    tracing::debug!("Session reaper stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pops_in_deadline_order_only_when_due() {
        let queue = ReapQueue::default();
        let now = Instant::now();
        queue.push(now + Duration::from_secs(5), "late".to_string());
        queue.push(now + Duration::from_secs(1), "early".to_string());

        assert_eq!(queue.next_deadline(), Some(now + Duration::from_secs(1)));
        assert!(queue.pop_due(now).is_none());

        let later = now + Duration::from_secs(10);
        assert_eq!(queue.pop_due(later).map(|(_, id)| id).as_deref(), Some("early"));
        assert_eq!(queue.pop_due(later).map(|(_, id)| id).as_deref(), Some("late"));
        assert_eq!(queue.len(), 0);
    }
}
