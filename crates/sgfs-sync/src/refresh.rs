//! Synchronous re-validation of a single path.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::Backend;
use crate::error::{Result, SyncError};
use crate::queue::CompletionSignal;
use crate::translator::ChangeTranslator;
use crate::types::EntityKind;

/// Issues a command for one path and waits until the pump has handled it.
pub struct RefreshPath {
    backend: Arc<dyn Backend>,
    translator: ChangeTranslator,
}

impl RefreshPath {
    /// Refresh path over `backend`, producing through `translator`.
    pub fn new(backend: Arc<dyn Backend>, translator: ChangeTranslator) -> Self {
        Self { backend, translator }
    }

    /// Re-validates `path` and blocks until its command was dispatched.
    ///
    /// Returns 0 once the command completed downstream, whatever the sink
    /// decided. Backend failures before anything is queued yield `-errno`.
    /// There is no timeout: a stalled pump blocks the caller.
    pub fn refresh(&self, path: &str) -> i32 {
        match self.issue(path) {
            Ok(signal) => {
                signal.wait();
                debug!("refresh of {} completed", path);
                0
            }
            Err(e) => {
                warn!("refresh of {} failed: {}", path, e);
                -e.to_errno()
            }
        }
    }

    /// Enqueues the command for `path` bound to a fresh signal, without waiting.
    ///
    /// Fails if the queue was closed, including a close racing this call; a
    /// returned signal is always released by the pump.
    pub fn issue(&self, path: &str) -> Result<CompletionSignal> {
        if self.translator.is_closed() {
            return Err(SyncError::internal("driver is shutting down"));
        }

        self.backend.clear_cache(path);
        let signal = CompletionSignal::new();

        let stat = if self.backend.exists(path)? {
            self.backend.stat(path)?
        } else {
            None
        };

        match stat {
            Some(stat) => {
                debug!("refresh {}: present (dir={})", path, stat.is_directory);
                self.translator.put(path, &stat, Some(signal.clone()))?;
            }
            None => {
                debug!("refresh {}: absent", path);
                self.translator.delete(path, EntityKind::File, Some(signal.clone()))?;
            }
        }
        Ok(signal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::block_cache::BlockCache;
    use crate::queue::{CommandQueue, Dispatch};
    use crate::types::{CommandTtl, CommandVerb, Role};
    use std::thread;
    use std::time::Duration;

    fn setup() -> (MemoryBackend, RefreshPath, Arc<CommandQueue>, Arc<BlockCache>) {
        let backend = MemoryBackend::with_role(Role::ReadOnly);
        let queue = Arc::new(CommandQueue::new());
        let cache = Arc::new(BlockCache::default());
        let translator = ChangeTranslator::new(queue.clone(), cache.clone(), CommandTtl::default());
        let refresh = RefreshPath::new(Arc::new(backend.clone()), translator);
        (backend, refresh, queue, cache)
    }

    #[test]
    fn test_absent_path_issues_delete_and_invalidates() {
        let (backend, refresh, queue, cache) = setup();
        cache.get_or_load("/gone", 0, 1, |_, _, _| Ok(vec![1])).unwrap();

        let signal = refresh.issue("/gone").unwrap();

        assert!(!signal.is_released());
        assert!(!cache.contains("/gone", 0, 1));
        assert_eq!(backend.cleared_paths(), vec!["/gone".to_string()]);
        match queue.dequeue_and_dispatch(|_| Ok::<(), String>(())) {
            Dispatch::Forwarded(cmd) => assert_eq!(cmd.verb, CommandVerb::Delete),
            other => panic!("unexpected {:?}", other),
        }
        assert!(signal.is_released());
    }

    #[test]
    fn test_present_file_issues_put_with_size() {
        let (backend, refresh, queue, _) = setup();
        backend.add_file("/f", b"12345").unwrap();
        refresh.issue("/f").unwrap();
        match queue.dequeue_and_dispatch(|_| Ok::<(), String>(())) {
            Dispatch::Forwarded(cmd) => {
                assert_eq!(cmd.verb, CommandVerb::Put);
                assert_eq!(cmd.kind, EntityKind::File);
                assert_eq!(cmd.size, Some(5));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_refresh_blocks_until_dispatched() {
        let (backend, refresh, queue, _) = setup();
        backend.add_dir("/d").unwrap();
        let refresh = Arc::new(refresh);

        let caller = {
            let refresh = refresh.clone();
            thread::spawn(move || refresh.refresh("/d"))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!caller.is_finished());

        let dispatch = queue.dequeue_and_dispatch(|_| Err("rejected"));
        assert!(matches!(dispatch, Dispatch::Rejected(_)));
        assert_eq!(caller.join().unwrap(), 0);
    }

    #[test]
    fn test_close_after_lookup_still_fails_fast() {
        let backend = MemoryBackend::with_role(Role::ReadOnly);
        backend.add_file("/f", b"x").unwrap();
        let queue = Arc::new(CommandQueue::new());
        let translator = ChangeTranslator::new(queue.clone(), Arc::new(BlockCache::default()), CommandTtl::default());
        let refresh = RefreshPath::new(Arc::new(ClosingBackend { inner: backend, queue: queue.clone() }), translator);

        let err = refresh.issue("/f").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
        assert!(queue.is_empty());
        assert!(refresh.refresh("/f") < 0);
    }

    /// Closes the queue from inside `stat`, after the refresh passed its
    /// closed-queue check.
    struct ClosingBackend {
        inner: MemoryBackend,
        queue: Arc<CommandQueue>,
    }

    impl Backend for ClosingBackend {
        fn connect(&self) -> Result<()> {
            self.inner.connect()
        }
        fn close(&self) -> Result<()> {
            self.inner.close()
        }
        fn exists(&self, path: &str) -> Result<bool> {
            self.inner.exists(path)
        }
        fn is_dir(&self, path: &str) -> Result<bool> {
            self.inner.is_dir(path)
        }
        fn stat(&self, path: &str) -> Result<Option<crate::types::Stat>> {
            self.queue.close();
            self.inner.stat(path)
        }
        fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>> {
            self.inner.list_dir(path)
        }
        fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
            self.inner.read(path, offset, length)
        }
        fn clear_cache(&self, path: &str) {
            self.inner.clear_cache(path)
        }
        fn set_notification_handler(&self, handler: crate::backend::NotificationHandler) {
            self.inner.set_notification_handler(handler)
        }
        fn supported_roles(&self) -> &'static [Role] {
            self.inner.supported_roles()
        }
        fn plugin_name(&self) -> &'static str {
            "closing"
        }
    }

    #[test]
    fn test_refresh_after_close_fails_fast() {
        let (_backend, refresh, queue, _) = setup();
        queue.close();
        assert!(refresh.refresh("/x") < 0);
        assert!(queue.is_empty());
    }
}
