//! Ordered hand-off of metadata commands from producers to the host pump.
//!
//! Any number of producers append `(Command, Option<CompletionSignal>)`
//! items; exactly one consumer drains them with
//! [`CommandQueue::dequeue_and_dispatch`]. A synchronous producer attaches a
//! [`CompletionSignal`] and waits on it until the consumer has forwarded its
//! command to the sink.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, SyncError};
use crate::types::Command;

/// One-shot latch released by the consumer once a command was processed.
///
/// Clones share the same latch. Waiting after release returns immediately,
/// and releasing more than once has no further effect.
#[derive(Clone, Debug, Default)]
pub struct CompletionSignal {
    inner: Arc<Latch>,
}

#[derive(Debug, Default)]
struct Latch {
    released: Mutex<bool>,
    cond: Condvar,
}

impl CompletionSignal {
    /// Fresh, unreleased signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens the latch and wakes every waiter. Returns false if it was already open.
    pub fn release(&self) -> bool {
        let mut released = self.inner.released.lock();
        if *released {
            return false;
        }
        *released = true;
        self.inner.cond.notify_all();
        true
    }

    /// Blocks until the latch is released.
    pub fn wait(&self) {
        let mut released = self.inner.released.lock();
        while !*released {
            self.inner.cond.wait(&mut released);
        }
    }

    /// Blocks until release or timeout; returns whether the latch is open.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut released = self.inner.released.lock();
        if !*released {
            let _ = self
                .inner
                .cond
                .wait_while_for(&mut released, |r| !*r, timeout);
        }
        *released
    }

    /// Whether the latch has been released.
    pub fn is_released(&self) -> bool {
        *self.inner.released.lock()
    }
}

/// An enqueued command with its optional completion signal.
pub struct QueueItem {
    /// Command to forward.
    pub command: Command,
    /// Released after the command was forwarded, if present.
    pub completion: Option<CompletionSignal>,
}

/// Outcome of one pump step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// The sink accepted the command.
    Forwarded(Command),
    /// The sink rejected the command; it was dropped.
    Rejected(Command),
    /// The queue was closed and is fully drained.
    Closed,
}

impl Dispatch {
    /// Whether the sink accepted the command.
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Dispatch::Forwarded(_))
    }
}

/// Queue counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// Items appended.
    pub enqueued: u64,
    /// Items accepted by the sink.
    pub dispatched: u64,
    /// Items the sink rejected.
    pub failed: u64,
    /// Items currently waiting.
    pub pending: usize,
}

struct State {
    items: VecDeque<QueueItem>,
    closed: bool,
    stats: QueueStats,
}

/// Unbounded multi-producer, single-consumer FIFO of commands.
pub struct CommandQueue {
    state: Mutex<State>,
    available: Condvar,
}

impl CommandQueue {
    /// Empty, open queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
                stats: QueueStats::default(),
            }),
            available: Condvar::new(),
        }
    }

    /// Appends to the tail. Never blocks beyond the internal lock.
    ///
    /// Fails once [`close`](Self::close) was called; the check and the append
    /// happen under the same lock, so an accepted item is always drained.
    pub fn enqueue(&self, command: Command, completion: Option<CompletionSignal>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            debug!("queue closed, refusing {}", command);
            return Err(SyncError::internal(format!("command queue is closed: {}", command)));
        }
        debug!("enqueue {} (sync={})", command, completion.is_some());
        state.items.push_back(QueueItem { command, completion });
        state.stats.enqueued += 1;
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    /// Blocks for the next item, or returns `None` once closed and drained.
    pub fn dequeue(&self) -> Option<QueueItem> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Pops the next item, forwards it to `sink`, then releases its signal.
    ///
    /// Sink failures are logged and the command is dropped; the signal is
    /// released either way so a waiting producer is never stranded.
    pub fn dequeue_and_dispatch<F, E>(&self, sink: F) -> Dispatch
    where
        F: FnOnce(&Command) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        let Some(item) = self.dequeue() else {
            return Dispatch::Closed;
        };

        let outcome = sink(&item.command);
        let dispatch = {
            let mut state = self.state.lock();
            match outcome {
                Ok(()) => {
                    state.stats.dispatched += 1;
                    debug!("dispatched {}", item.command);
                    Dispatch::Forwarded(item.command)
                }
                Err(e) => {
                    state.stats.failed += 1;
                    warn!("sink rejected {}: {}; dropping", item.command, e);
                    Dispatch::Rejected(item.command)
                }
            }
        };

        if let Some(signal) = item.completion {
            signal.release();
        }
        dispatch
    }

    /// Stops the consumer once remaining items are drained.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Items currently waiting.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        let mut stats = state.stats.clone();
        stats.pending = state.items.len();
        stats
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
