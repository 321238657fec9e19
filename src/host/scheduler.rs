//!
//! Priority send queue: orders outstanding commands for transmission and tracks
//! how many are still in flight for `join_queue`/`is_busy`.
//!

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use super::command::Command;

///
/// Scheduling priority of a `SendTask`. `System` tasks (handshake, resends) preempt
/// `Normal` tasks still waiting in the queue, but never an in-progress send.
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    System,
    Normal,
}

///
/// A queued command awaiting transmission.
///
/// Ordered by priority first, then by `sequence_number` so commands of equal
/// priority are transmitted in enqueue order.
///
#[derive(Clone, Debug)]
pub struct SendTask {
    priority: TaskPriority,
    sequence_number: u64,
    command: Command,
}

impl SendTask {
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn into_command(self) -> Command {
        self.command
    }
}

impl PartialEq for SendTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence_number == other.sequence_number
    }
}

impl Eq for SendTask {}

impl Ord for SendTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.cmp(&self.priority).then_with(|| other.sequence_number.cmp(&self.sequence_number))
    }
}

impl PartialOrd for SendTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    heap: BinaryHeap<SendTask>,
    pending: usize,
}

///
/// Thread-safe priority queue of `SendTask`s, with `join`-style bookkeeping of how
/// many pushed tasks have not yet been marked done.
///
/// A task popped via `pop` is not automatically considered done: the caller must
/// call `mark_done` once it has been fully processed, or `requeue` to put it back
/// unchanged (e.g. after a quota timeout) without affecting the pending count.
///
pub struct SendQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    next_sequence: AtomicU64,
}

impl SendQueue {
    pub fn new() -> Self {
        SendQueue {
            state: Mutex::new(QueueState { heap: BinaryHeap::new(), pending: 0 }),
            notify: Notify::new(),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Allocates the next strictly monotonic sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, AtomicOrdering::Relaxed)
    }

    /// Pushes a new command with a freshly allocated sequence number, counting it
    /// toward `join`/`is_empty` until it is popped and marked done.
    pub fn push(&self, priority: TaskPriority, command: Command) -> SendTask {
        let task = SendTask { priority, sequence_number: self.next_sequence(), command };
        let mut state = self.state.lock().unwrap();
        state.heap.push(task.clone());
        state.pending += 1;
        drop(state);
        self.notify.notify_waiters();
        task
    }

    /// Puts a previously popped task back, unchanged, without affecting the
    /// pending count (the task was never marked done).
    pub fn requeue(&self, task: SendTask) {
        let mut state = self.state.lock().unwrap();
        state.heap.push(task);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Pops the highest-priority task, blocking up to `timeout` if the queue is
    /// empty. Returns `None` on timeout.
    pub async fn pop(&self, timeout: Duration) -> Option<SendTask> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().unwrap();
                if let Some(task) = state.heap.pop() {
                    return Some(task);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }

            if tokio::time::timeout(remaining, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Marks one previously pushed task as fully processed.
    pub fn mark_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending = state.pending.saturating_sub(1);
        drop(state);
        self.notify.notify_waiters();
    }

    /// True if the queue has no queued tasks and no pending (popped-but-not-done)
    /// tasks.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.heap.is_empty() && state.pending == 0
    }

    /// Drains every queued task, discarding them, and clears the pending count.
    /// Used on forced shutdown.
    pub fn purge(&self) -> Vec<SendTask> {
        let mut state = self.state.lock().unwrap();
        let drained: Vec<SendTask> = state.heap.drain().collect();
        state.pending = 0;
        drop(state);
        self.notify.notify_waiters();
        drained
    }

    /// Blocks until the queue is drained and every pushed task has been marked
    /// done.
    pub async fn join(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_empty() {
                return;
            }

            notified.await;
        }
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}
