#![warn(missing_docs)]

//! Filesystem gateway driver core.
//!
//! Turns change notifications from a pluggable storage backend into an
//! ordered, blocking stream of metadata commands consumed one at a time by
//! the host, and serves byte-range reads through a bounded, TTL-limited
//! block cache.

pub mod backend;
pub mod block_cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod queue;
pub mod read;
pub mod refresh;
pub mod resync;
pub mod translator;
pub mod types;

pub use backend::{Backend, BackendRegistry, LocalBackend, MemoryBackend, NotificationHandler};
pub use block_cache::{BlockCache, BlockCacheConfig, BlockCacheStats};
pub use config::DriverConfig;
pub use driver::{driver_init, SyncDriver};
pub use error::{ErrorKind, Result, SyncError};
pub use queue::{CommandQueue, CompletionSignal, Dispatch, QueueItem, QueueStats};
pub use read::ReadPath;
pub use refresh::RefreshPath;
pub use resync::{ResyncStats, ResyncWalker};
pub use translator::ChangeTranslator;
pub use types::{ChangeEvent, Command, CommandTtl, CommandVerb, EntityKind, Role, Stat, DIR_MODE, FILE_MODE};
