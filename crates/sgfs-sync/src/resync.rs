//! Startup walk that rebuilds the command stream from the backend tree.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::translator::ChangeTranslator;
use crate::types::{join_path, ChangeEvent};

/// Counters from one walk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncStats {
    /// Directories listed.
    pub dirs_visited: u64,
    /// Put commands enqueued.
    pub entries_queued: u64,
    /// Listings or stats that failed and were skipped.
    pub errors: u64,
    /// Whether the walk was cut short by a stop request.
    pub stopped: bool,
}

/// Breadth-first walker feeding synthetic "added" batches to the translator.
pub struct ResyncWalker {
    backend: Arc<dyn Backend>,
    translator: ChangeTranslator,
    stop: Arc<AtomicBool>,
}

impl ResyncWalker {
    /// Walker over `backend`.
    pub fn new(backend: Arc<dyn Backend>, translator: ChangeTranslator) -> Self {
        Self {
            backend,
            translator,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Uses `stop` as the flag checked before each directory.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Walks everything reachable from `root_path`.
    ///
    /// The root itself is not emitted. Each child gets exactly one put
    /// command, enqueued before any of its own children are listed.
    pub fn resync(&self, root_path: &str) -> ResyncStats {
        info!("Resync started at {}", root_path);
        let mut stats = ResyncStats::default();
        let mut pending: VecDeque<String> = VecDeque::new();
        pending.push_back(root_path.to_string());

        while let Some(dir) = pending.pop_front() {
            if self.stop.load(Ordering::SeqCst) {
                info!("Resync stopped with {} directories pending", pending.len() + 1);
                stats.stopped = true;
                break;
            }

            self.backend.clear_cache(&dir);
            let names = match self.backend.list_dir(&dir) {
                Ok(Some(names)) => names,
                Ok(None) => {
                    debug!("{} vanished before listing", dir);
                    continue;
                }
                Err(e) => {
                    warn!("Cannot list {}: {}", dir, e);
                    stats.errors += 1;
                    continue;
                }
            };
            stats.dirs_visited += 1;

            for name in names {
                let path = join_path(&dir, &name);
                let stat = match self.backend.stat(&path) {
                    Ok(Some(stat)) => stat,
                    Ok(None) => {
                        debug!("{} listed but not found, skipping", path);
                        continue;
                    }
                    Err(e) => {
                        warn!("Cannot stat {}: {}", path, e);
                        stats.errors += 1;
                        continue;
                    }
                };
                let is_dir = stat.is_directory;
                let event = ChangeEvent {
                    path: path.clone(),
                    stat: Some(stat),
                };
                stats.entries_queued += self.translator.on_changes(vec![], vec![event], vec![]) as u64;
                if is_dir {
                    pending.push_back(path);
                }
            }
        }

        info!(
            "Resync finished: {} dirs, {} entries, {} errors",
            stats.dirs_visited, stats.entries_queued, stats.errors
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::block_cache::BlockCache;
    use crate::queue::{CommandQueue, Dispatch};
    use crate::types::{Command, CommandTtl, CommandVerb, EntityKind};

    fn walker(backend: &MemoryBackend) -> (ResyncWalker, Arc<CommandQueue>) {
        let queue = Arc::new(CommandQueue::new());
        let translator = ChangeTranslator::new(
            queue.clone(),
            Arc::new(BlockCache::default()),
            CommandTtl::default(),
        );
        let backend: Arc<dyn Backend> = Arc::new(backend.clone());
        (ResyncWalker::new(backend, translator), queue)
    }

    fn drain(queue: &CommandQueue) -> Vec<Command> {
        let mut out = Vec::new();
        while !queue.is_empty() {
            if let Dispatch::Forwarded(cmd) = queue.dequeue_and_dispatch(|_| Ok::<(), String>(())) {
                out.push(cmd);
            }
        }
        out
    }

    fn quiet_backend() -> MemoryBackend {
        MemoryBackend::with_role(crate::types::Role::ReadOnly)
    }

    #[test]
    fn test_directory_before_its_file() {
        let backend = quiet_backend();
        backend.add_dir("/a").unwrap();
        backend.add_file("/a/b", b"0123456789").unwrap();

        let (walker, queue) = walker(&backend);
        let stats = walker.resync("/");
        let commands = drain(&queue);

        assert_eq!(stats.entries_queued, 2);
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].path, "/a");
        assert_eq!(commands[0].kind, EntityKind::Directory);
        assert_eq!(commands[1].path, "/a/b");
        assert_eq!(commands[1].kind, EntityKind::File);
        assert_eq!(commands[1].size, Some(10));
        assert!(commands.iter().all(|c| c.verb == CommandVerb::Put));
    }

    #[test]
    fn test_every_path_emitted_once() {
        let backend = quiet_backend();
        backend.add_dir("/x").unwrap();
        backend.add_dir("/x/y").unwrap();
        backend.add_file("/x/y/z", b"z").unwrap();
        backend.add_file("/x/f", b"f").unwrap();
        backend.add_file("/top", b"t").unwrap();

        let (walker, queue) = walker(&backend);
        let stats = walker.resync("/");
        let mut paths: Vec<String> = drain(&queue).into_iter().map(|c| c.path).collect();
        paths.sort();

        assert_eq!(paths, vec!["/top", "/x", "/x/f", "/x/y", "/x/y/z"]);
        assert_eq!(stats.dirs_visited, 3);
    }

    #[test]
    fn test_clears_backend_cache_for_each_directory() {
        let backend = quiet_backend();
        backend.add_dir("/a").unwrap();
        let (walker, _queue) = walker(&backend);
        walker.resync("/");
        assert_eq!(backend.cleared_paths(), vec!["/".to_string(), "/a".to_string()]);
    }

    #[test]
    fn test_missing_root_emits_nothing() {
        let backend = quiet_backend();
        let (walker, queue) = walker(&backend);
        let stats = walker.resync("/nope");
        assert_eq!(stats.entries_queued, 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stop_flag_halts_walk() {
        let backend = quiet_backend();
        backend.add_dir("/a").unwrap();
        let stop = Arc::new(AtomicBool::new(true));
        let (walker, queue) = walker(&backend);
        let stats = walker.with_stop_flag(stop).resync("/");
        assert!(stats.stopped);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_subdirectory_root() {
        let backend = quiet_backend();
        backend.add_dir("/a").unwrap();
        backend.add_file("/a/b", b"1").unwrap();
        backend.add_file("/c", b"2").unwrap();
        let (walker, queue) = walker(&backend);
        walker.resync("/a");
        let paths: Vec<String> = drain(&queue).into_iter().map(|c| c.path).collect();
        assert_eq!(paths, vec!["/a/b"]);
    }
}
