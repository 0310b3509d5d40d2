//! Deadline watchdog
//!
//! One thread per pool, started the first time a task with a deadline is
//! dispatched. Deadlines sit in a min-heap; the thread sleeps on its channel
//! until the earliest one is due, then tells the manager. Finished tasks are
//! not removed from the heap: an expired entry for a task that is no longer
//! running is simply ignored by the manager.

use crate::core::TaskId;
use crate::pool::manager::Shared;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

struct Deadline {
    at: Instant,
    task: TaskId,
    timeout: Duration,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.task == other.task
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    // Reversed so that BinaryHeap pops the earliest deadline first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.task.cmp(&self.task))
    }
}

/// Handle to a running watchdog thread
pub(crate) struct Watchdog {
    sender: Sender<Deadline>,
    thread: JoinHandle<()>,
}

impl Watchdog {
    pub(crate) fn spawn(name: String, pool: Weak<Shared>) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || run(receiver, pool))?;
        Ok(Self { sender, thread })
    }

    /// Schedule a deadline `timeout` from now
    ///
    /// A timeout too large to represent as an `Instant` never fires, so no
    /// deadline is scheduled for it.
    pub(crate) fn arm(&self, task: TaskId, timeout: Duration) {
        let Some(at) = Instant::now().checked_add(timeout) else {
            log::debug!("{} timeout {:?} is out of range; no deadline", task, timeout);
            return;
        };
        let deadline = Deadline { at, task, timeout };
        if self.sender.send(deadline).is_err() {
            log::warn!("watchdog is gone; {} runs without a deadline", task);
        }
    }

    /// Disconnect the channel and hand back the thread for joining
    pub(crate) fn stop(self) -> JoinHandle<()> {
        drop(self.sender);
        self.thread
    }
}

fn run(receiver: Receiver<Deadline>, pool: Weak<Shared>) {
    let mut heap: BinaryHeap<Deadline> = BinaryHeap::new();

    loop {
        let received = match heap.peek() {
            Some(next) => {
                receiver.recv_timeout(next.at.saturating_duration_since(Instant::now()))
            }
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match received {
            Ok(deadline) => heap.push(deadline),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        while heap.peek().is_some_and(|d| d.at <= now) {
            if let Some(expired) = heap.pop() {
                match pool.upgrade() {
                    Some(shared) => shared.deadline_expired(expired.task, expired.timeout),
                    None => return,
                }
            }
        }
    }

    log::trace!("watchdog exiting with {} pending deadlines", heap.len());
}
