//! Turns backend change batches into queued metadata commands.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::block_cache::BlockCache;
use crate::error::Result;
use crate::queue::{CommandQueue, CompletionSignal};
use crate::types::{ChangeEvent, Command, CommandTtl, EntityKind, Stat};

/// Stateless translator shared by the notification handler, the resync
/// walker and the refresh path.
#[derive(Clone)]
pub struct ChangeTranslator {
    queue: Arc<CommandQueue>,
    cache: Arc<BlockCache>,
    ttl: CommandTtl,
}

impl ChangeTranslator {
    /// Translator feeding `queue` and invalidating `cache`.
    pub fn new(queue: Arc<CommandQueue>, cache: Arc<BlockCache>, ttl: CommandTtl) -> Self {
        Self { queue, cache, ttl }
    }

    /// TTLs stamped on produced commands.
    pub fn ttl(&self) -> CommandTtl {
        self.ttl
    }

    /// Whether the downstream queue stopped accepting work.
    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Enqueues one command per event: updated first, then added, then removed.
    ///
    /// Returns the number of commands enqueued, which equals the total number
    /// of events while the queue is open. Once it is closed the batch is dropped.
    pub fn on_changes(
        &self,
        updated: Vec<ChangeEvent>,
        added: Vec<ChangeEvent>,
        removed: Vec<ChangeEvent>,
    ) -> usize {
        debug!(
            "change batch: {} updated, {} added, {} removed",
            updated.len(),
            added.len(),
            removed.len()
        );

        let mut count = 0;
        for event in updated.iter().chain(added.iter()) {
            let queued = match &event.stat {
                Some(stat) => self.put(&event.path, stat, None),
                // A backend that could not stat the entity reports it gone.
                None => self.delete(&event.path, EntityKind::File, None),
            };
            if queued.is_err() {
                return count;
            }
            count += 1;
        }
        for event in &removed {
            let kind = if event.is_directory() {
                EntityKind::Directory
            } else {
                EntityKind::File
            };
            if self.delete(&event.path, kind, None).is_err() {
                return count;
            }
            count += 1;
        }
        count
    }

    /// Invalidates cached bytes of a file and enqueues its put command.
    pub fn put(&self, path: &str, stat: &Stat, completion: Option<CompletionSignal>) -> Result<()> {
        if !stat.is_directory {
            self.cache.invalidate_prefix(path);
        }
        let command = Command::put(stat, path, self.ttl);
        trace!("translated {}", command);
        self.queue.enqueue(command, completion)
    }

    /// Invalidates everything cached at or beneath `path` and enqueues its delete command.
    pub fn delete(&self, path: &str, kind: EntityKind, completion: Option<CompletionSignal>) -> Result<()> {
        self.cache.invalidate_prefix(path);
        let command = Command::delete(path, kind, self.ttl);
        trace!("translated {}", command);
        self.queue.enqueue(command, completion)
    }
}
