//! Backend adapter abstraction.
//!
//! A backend exposes filesystem primitives over some storage system and
//! reports changes through a registered [`NotificationHandler`]. Concrete
//! backends are selected at startup through the [`BackendRegistry`].

pub mod local;
pub mod memory;
pub mod registry;

use std::sync::Arc;

use crate::error::Result;
use crate::types::{ChangeEvent, Role, Stat};

pub use local::LocalBackend;
pub use memory::MemoryBackend;
pub use registry::{BackendFactory, BackendRegistry};

/// Callback receiving `(updated, added, removed)` change batches.
pub type NotificationHandler =
    Arc<dyn Fn(Vec<ChangeEvent>, Vec<ChangeEvent>, Vec<ChangeEvent>) + Send + Sync>;

/// Filesystem primitives the driver consumes.
///
/// Implementations serialize their own internal state; the driver calls
/// these from several threads without external locking.
pub trait Backend: Send + Sync {
    /// Connects to the storage system and starts change detection if any.
    fn connect(&self) -> Result<()>;

    /// Stops change detection and releases resources.
    fn close(&self) -> Result<()>;

    /// Whether the path exists.
    fn exists(&self, path: &str) -> Result<bool>;

    /// Whether the path exists and is a directory.
    fn is_dir(&self, path: &str) -> Result<bool>;

    /// Metadata of the path, `None` when it does not exist.
    fn stat(&self, path: &str) -> Result<Option<Stat>>;

    /// Names of the immediate children, `None` when the path is not a listable directory.
    fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>>;

    /// Reads up to `length` bytes starting at `offset`.
    fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>>;

    /// Drops any metadata the backend caches for the path.
    fn clear_cache(&self, path: &str);

    /// Registers the handler invoked whenever the backend detects changes.
    fn set_notification_handler(&self, handler: NotificationHandler);

    /// Roles this backend can serve. The driver refuses to start in any other.
    fn supported_roles(&self) -> &'static [Role];

    /// Whether the backend can serve `role`.
    fn supports(&self, role: Role) -> bool {
        self.supported_roles().contains(&role)
    }

    /// Identifier the backend was registered under.
    fn plugin_name(&self) -> &'static str;
}
