//! In-process backend holding a tree in memory.
//!
//! Mutations raise change notifications the way a watched filesystem would,
//! which makes this backend the reference fixture for driver tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use super::{Backend, NotificationHandler};
use crate::error::{Result, SyncError};
use crate::types::{base_name, ChangeEvent, Role, Stat};

#[derive(Debug, Clone)]
struct Node {
    is_dir: bool,
    data: Vec<u8>,
    modify_time: u64,
}

struct Shared {
    role: Role,
    nodes: RwLock<BTreeMap<String, Node>>,
    handler: Mutex<Option<NotificationHandler>>,
    connected: AtomicBool,
    fail_reads: AtomicBool,
    reads: AtomicU64,
    cache_clears: Mutex<Vec<String>>,
}

/// Memory-resident backend. Clones share the same tree.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

impl MemoryBackend {
    /// Empty tree containing only `/`, discover role.
    pub fn new() -> Self {
        Self::with_role(Role::Discover)
    }

    /// Empty tree for the given role. Notifications are only raised in discover role.
    pub fn with_role(role: Role) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                is_dir: true,
                data: Vec::new(),
                modify_time: now_secs(),
            },
        );
        Self {
            shared: Arc::new(Shared {
                role,
                nodes: RwLock::new(nodes),
                handler: Mutex::new(None),
                connected: AtomicBool::new(false),
                fail_reads: AtomicBool::new(false),
                reads: AtomicU64::new(0),
                cache_clears: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Builds from plugin configuration. Accepts `null` or an object whose
    /// optional `files` map seeds file contents by path.
    pub fn from_config(config: &Value, role: Role) -> Result<Self> {
        let backend = Self::with_role(role);
        match config {
            Value::Null => {}
            Value::Object(map) => {
                if let Some(files) = map.get("files") {
                    let files = files
                        .as_object()
                        .ok_or_else(|| SyncError::config("memory plugin: files must be an object"))?;
                    for (path, content) in files {
                        let content = content.as_str().ok_or_else(|| {
                            SyncError::config(format!("memory plugin: content of {} must be a string", path))
                        })?;
                        backend.seed_file(path, content.as_bytes());
                    }
                }
            }
            _ => return Err(SyncError::config("memory plugin: configuration must be an object")),
        }
        Ok(backend)
    }

    // Inserts a file and any missing parent directories without notifying.
    fn seed_file(&self, path: &str, data: &[u8]) {
        let mut nodes = self.shared.nodes.write();
        let mut parent = parent_of(path);
        let mut missing = Vec::new();
        while !nodes.contains_key(parent) {
            missing.push(parent.to_string());
            parent = parent_of(parent);
        }
        let mtime = now_secs();
        for dir in missing {
            nodes.insert(
                dir,
                Node {
                    is_dir: true,
                    data: Vec::new(),
                    modify_time: mtime,
                },
            );
        }
        nodes.insert(
            path.to_string(),
            Node {
                is_dir: false,
                data: data.to_vec(),
                modify_time: mtime,
            },
        );
    }

    fn stat_of(path: &str, node: &Node) -> Stat {
        Stat {
            is_directory: node.is_dir,
            path: path.to_string(),
            name: base_name(path).to_string(),
            size: if node.is_dir { 0 } else { node.data.len() as u64 },
            checksum: 0,
            create_time: node.modify_time,
            modify_time: node.modify_time,
        }
    }

    fn notify(&self, updated: Vec<ChangeEvent>, added: Vec<ChangeEvent>, removed: Vec<ChangeEvent>) {
        if self.shared.role != Role::Discover {
            return;
        }
        let handler = self.shared.handler.lock().clone();
        if let Some(handler) = handler {
            handler(updated, added, removed);
        }
    }

    fn insert(&self, path: &str, node: Node) -> Result<Stat> {
        let mut nodes = self.shared.nodes.write();
        match nodes.get(parent_of(path)) {
            Some(parent) if parent.is_dir => {}
            _ => {
                return Err(SyncError::NotFound {
                    path: parent_of(path).to_string(),
                })
            }
        }
        let stat = Self::stat_of(path, &node);
        nodes.insert(path.to_string(), node);
        Ok(stat)
    }

    /// Creates a directory and reports it as added.
    pub fn add_dir(&self, path: &str) -> Result<()> {
        let stat = self.insert(
            path,
            Node {
                is_dir: true,
                data: Vec::new(),
                modify_time: now_secs(),
            },
        )?;
        debug!("memory backend: added dir {}", path);
        self.notify(vec![], vec![ChangeEvent::with_stat(stat)], vec![]);
        Ok(())
    }

    /// Creates a file and reports it as added.
    pub fn add_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let stat = self.insert(
            path,
            Node {
                is_dir: false,
                data: data.to_vec(),
                modify_time: now_secs(),
            },
        )?;
        debug!("memory backend: added file {} ({} bytes)", path, data.len());
        self.notify(vec![], vec![ChangeEvent::with_stat(stat)], vec![]);
        Ok(())
    }

    /// Replaces the contents of an existing file and reports it as updated.
    pub fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let stat = {
            let mut nodes = self.shared.nodes.write();
            let node = nodes
                .get_mut(path)
                .filter(|n| !n.is_dir)
                .ok_or_else(|| SyncError::NotFound {
                    path: path.to_string(),
                })?;
            node.data = data.to_vec();
            node.modify_time = now_secs();
            Self::stat_of(path, node)
        };
        self.notify(vec![ChangeEvent::with_stat(stat)], vec![], vec![]);
        Ok(())
    }

    /// Removes a path and everything beneath it, reporting the path as removed.
    pub fn remove(&self, path: &str) -> Result<()> {
        {
            let mut nodes = self.shared.nodes.write();
            if nodes.remove(path).is_none() {
                return Err(SyncError::NotFound {
                    path: path.to_string(),
                });
            }
            let prefix = format!("{}/", path);
            nodes.retain(|k, _| !k.starts_with(&prefix));
        }
        self.notify(vec![], vec![], vec![ChangeEvent::removed(path)]);
        Ok(())
    }

    /// Makes every subsequent read fail with a remote I/O error.
    pub fn fail_reads(&self, fail: bool) {
        self.shared.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Number of reads served (or attempted) so far.
    pub fn read_count(&self) -> u64 {
        self.shared.reads.load(Ordering::SeqCst)
    }

    /// Paths passed to `clear_cache`, in call order.
    pub fn cleared_paths(&self) -> Vec<String> {
        self.shared.cache_clears.lock().clone()
    }

    /// Whether `connect` was called without a later `close`.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn connect(&self) -> Result<()> {
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.shared.nodes.read().contains_key(path))
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self
            .shared
            .nodes
            .read()
            .get(path)
            .map(|n| n.is_dir)
            .unwrap_or(false))
    }

    fn stat(&self, path: &str) -> Result<Option<Stat>> {
        Ok(self
            .shared
            .nodes
            .read()
            .get(path)
            .map(|n| Self::stat_of(path, n)))
    }

    fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>> {
        let nodes = self.shared.nodes.read();
        match nodes.get(path) {
            Some(node) if node.is_dir => {}
            _ => return Ok(None),
        }
        let names = nodes
            .keys()
            .filter(|k| k.as_str() != path && parent_of(k) == path)
            .map(|k| base_name(k).to_string())
            .collect();
        Ok(Some(names))
    }

    fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        self.shared.reads.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncError::remote_io(path, "injected read failure"));
        }
        let nodes = self.shared.nodes.read();
        let node = nodes.get(path).ok_or_else(|| SyncError::NotFound {
            path: path.to_string(),
        })?;
        if node.is_dir {
            return Err(SyncError::remote_io(path, "is a directory"));
        }
        let start = (offset as usize).min(node.data.len());
        let end = start.saturating_add(length as usize).min(node.data.len());
        Ok(node.data[start..end].to_vec())
    }

    fn clear_cache(&self, path: &str) {
        self.shared.cache_clears.lock().push(path.to_string());
    }

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.shared.handler.lock() = Some(handler);
    }

    fn supported_roles(&self) -> &'static [Role] {
        &[Role::Discover, Role::ReadOnly]
    }

    fn plugin_name(&self) -> &'static str {
        "memory"
    }
}
