//! Driver session: the context object the host runtime talks to.
//!
//! One [`SyncDriver`] owns the backend handle, the block cache and the
//! command queue for the lifetime of the process, and wires the change
//! translator, resync walker, refresh path and read path around them.

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::backend::{Backend, BackendRegistry, NotificationHandler};
use crate::block_cache::{BlockCache, BlockCacheStats};
use crate::config::DriverConfig;
use crate::error::{Result, SyncError};
use crate::queue::{CommandQueue, Dispatch, QueueStats};
use crate::read::ReadPath;
use crate::refresh::RefreshPath;
use crate::resync::{ResyncStats, ResyncWalker};
use crate::translator::ChangeTranslator;
use crate::types::{ChangeEvent, Command, Role};

/// A running driver instance.
pub struct SyncDriver {
    config: DriverConfig,
    role: Role,
    backend: Arc<dyn Backend>,
    cache: Arc<BlockCache>,
    queue: Arc<CommandQueue>,
    refresher: RefreshPath,
    reader: ReadPath,
    resync_thread: Mutex<Option<JoinHandle<ResyncStats>>>,
    stop: Arc<AtomicBool>,
    shut_down: AtomicBool,
}

impl SyncDriver {
    /// Resolves the backend plugin through `registry` and starts the driver.
    pub fn init(
        config: DriverConfig,
        secrets: Option<&Value>,
        role: Role,
        registry: &BackendRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let plugin_config = config.resolved_plugin_config(secrets)?;
        let backend: Arc<dyn Backend> = Arc::from(registry.create(&config.plugin, &plugin_config, role)?);
        Self::with_backend(config, role, backend)
    }

    /// Starts the driver over an already-built backend.
    ///
    /// Fails with a configuration error, before connecting, when the backend
    /// does not support `role`. In discover role the change translator is
    /// registered as the backend's notification handler before connecting,
    /// and the resync walk is started on its own thread if enabled.
    pub fn with_backend(config: DriverConfig, role: Role, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        if !backend.supports(role) {
            return Err(SyncError::config(format!(
                "backend plugin {} does not support role {:?} (supported: {:?})",
                backend.plugin_name(),
                role,
                backend.supported_roles()
            )));
        }
        let cache = Arc::new(BlockCache::new(config.block_cache_config()));
        let queue = Arc::new(CommandQueue::new());
        let translator = ChangeTranslator::new(queue.clone(), cache.clone(), config.command_ttl());

        if role == Role::Discover {
            let handler_translator = translator.clone();
            let handler: NotificationHandler = Arc::new(
                move |updated: Vec<ChangeEvent>, added: Vec<ChangeEvent>, removed: Vec<ChangeEvent>| {
                    handler_translator.on_changes(updated, added, removed);
                },
            );
            backend.set_notification_handler(handler);
        }

        backend.connect()?;
        info!(
            "Backend {} connected (role={:?}, dataset={})",
            backend.plugin_name(),
            role,
            config.dataset_dir
        );

        let stop = Arc::new(AtomicBool::new(false));
        let resync_thread = if role == Role::Discover && config.resync_on_init {
            let walker = ResyncWalker::new(backend.clone(), translator.clone()).with_stop_flag(stop.clone());
            let root = config.dataset_dir.clone();
            let handle = thread::Builder::new()
                .name("sgfs-resync".to_string())
                .spawn(move || walker.resync(&root));
            match handle {
                Ok(handle) => Some(handle),
                Err(e) => {
                    let _ = backend.close();
                    return Err(SyncError::internal(format!("cannot spawn resync thread: {}", e)));
                }
            }
        } else {
            None
        };

        Ok(Self {
            refresher: RefreshPath::new(backend.clone(), translator),
            reader: ReadPath::new(backend.clone(), cache.clone()),
            config,
            role,
            backend,
            cache,
            queue,
            resync_thread: Mutex::new(resync_thread),
            stop,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Blocking host call: forwards the next queued command to `sink`.
    ///
    /// Returns false once the driver was shut down and the queue drained,
    /// true otherwise. Sink rejections are logged and the command dropped.
    pub fn next_command<F, E>(&self, sink: F) -> bool
    where
        F: FnOnce(&Command) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        !matches!(self.pump_once(sink), Dispatch::Closed)
    }

    /// Like [`next_command`](Self::next_command) but returns the full outcome.
    pub fn pump_once<F, E>(&self, sink: F) -> Dispatch
    where
        F: FnOnce(&Command) -> std::result::Result<(), E>,
        E: std::fmt::Display,
    {
        self.queue.dequeue_and_dispatch(sink)
    }

    /// Re-validates `path`; returns 0 once its command was dispatched.
    pub fn refresh(&self, path: &str) -> i32 {
        self.refresher.refresh(path)
    }

    /// Reads a byte range of `path` into `out`.
    pub fn read<W: Write>(&self, path: &str, offset: u64, length: u64, out: &mut W) -> Result<usize> {
        self.reader.read_into(path, offset, length, out)
    }

    /// Waits for the startup walk, if one is running, and returns its counters.
    pub fn wait_for_resync(&self) -> Option<ResyncStats> {
        let handle = self.resync_thread.lock().take()?;
        match handle.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                error!("Resync thread panicked");
                None
            }
        }
    }

    /// Stops producers, closes the queue and the backend. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down driver");
        self.stop.store(true, Ordering::SeqCst);
        self.queue.close();
        self.wait_for_resync();
        if let Err(e) = self.backend.close() {
            warn!("Backend close failed: {}", e);
        }
    }

    /// Role fixed at startup.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Effective configuration.
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Shared backend handle.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Queue counters.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Block cache counters.
    pub fn cache_stats(&self) -> BlockCacheStats {
        self.cache.stats()
    }
}

impl Drop for SyncDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Initializes a driver from a raw configuration mapping.
///
/// Every failure, panics included, is logged and reported as `None`.
pub fn driver_init(config: Value, secrets: Option<Value>, role: Role) -> Option<SyncDriver> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let config = DriverConfig::from_value(config)?;
        SyncDriver::init(config, secrets.as_ref(), role, &BackendRegistry::with_builtin())
    }));
    match outcome {
        Ok(Ok(driver)) => Some(driver),
        Ok(Err(e)) => {
            error!("Driver initialization failed ({:?}): {}", e.kind(), e);
            None
        }
        Err(_) => {
            error!("Driver initialization panicked");
            None
        }
    }
}
