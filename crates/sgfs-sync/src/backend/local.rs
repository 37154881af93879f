//! Local-directory backend.
//!
//! Driver paths are rooted at the configured `work_root`: `/a/b` maps to
//! `<work_root>/a/b`. In discover role a recursive `notify` watcher turns
//! filesystem events into change batches.

use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{ErrorKind as IoErrorKind, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{Backend, NotificationHandler};
use crate::error::{Result, SyncError};
use crate::types::{base_name, ChangeEvent, Role, Stat};

/// Backend serving a directory of the local filesystem.
pub struct LocalBackend {
    work_root: PathBuf,
    role: Role,
    handler: Arc<Mutex<Option<NotificationHandler>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl LocalBackend {
    /// Backend rooted at `work_root`. Trailing separators are ignored.
    pub fn new(work_root: impl Into<PathBuf>, role: Role) -> Self {
        let work_root: PathBuf = work_root.into();
        let work_root = work_root.components().collect();
        Self {
            work_root,
            role,
            handler: Arc::new(Mutex::new(None)),
            watcher: Mutex::new(None),
        }
    }

    /// Builds from plugin configuration; `work_root` is required.
    pub fn from_config(config: &Value, role: Role) -> Result<Self> {
        let work_root = config
            .get("work_root")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::config("local plugin: work_root is not given"))?;
        Ok(Self::new(work_root, role))
    }

    /// Root directory served by this backend.
    pub fn work_root(&self) -> &Path {
        &self.work_root
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        to_local_path(&self.work_root, path)
    }
}

/// Maps a driver path under `work_root`.
///
/// Returns `None` for paths that would leave `work_root` (`..`, nested roots).
fn to_local_path(work_root: &Path, path: &str) -> Option<PathBuf> {
    let mut local = work_root.to_path_buf();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => local.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                warn!("Rejecting path outside work root: {}", path);
                return None;
            }
        }
    }
    Some(local)
}

fn not_found(path: &str) -> SyncError {
    SyncError::NotFound {
        path: path.to_string(),
    }
}

fn lossy_name(name: &std::ffi::OsStr) -> String {
    let lossy = name.to_string_lossy();
    if let Cow::Owned(_) = lossy {
        warn!("Name is not valid UTF-8, it will not resolve: {:?}", name);
    }
    lossy.into_owned()
}

fn to_driver_path(work_root: &Path, local: &Path) -> Option<String> {
    let relative = local.strip_prefix(work_root).ok()?;
    let mut driver = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            driver.push('/');
            driver.push_str(&lossy_name(part));
        }
    }
    if driver.is_empty() {
        driver.push('/');
    }
    Some(driver)
}

fn epoch_secs(time: std::io::Result<std::time::SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn stat_local(work_root: &Path, path: &str) -> Result<Option<Stat>> {
    let Some(local) = to_local_path(work_root, path) else {
        return Ok(None);
    };
    let metadata = match fs::metadata(local) {
        Ok(m) => m,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(Stat {
        is_directory: metadata.is_dir(),
        path: path.to_string(),
        name: base_name(path).to_string(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        checksum: 0,
        create_time: epoch_secs(metadata.created()),
        modify_time: epoch_secs(metadata.modified()),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Added,
    Updated,
    Removed,
}

fn classify(kind: &EventKind) -> Vec<Transition> {
    match kind {
        EventKind::Create(_) => vec![Transition::Added],
        EventKind::Remove(_) => vec![Transition::Removed],
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => vec![Transition::Removed],
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => vec![Transition::Added],
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            vec![Transition::Removed, Transition::Added]
        }
        EventKind::Modify(_) => vec![Transition::Updated],
        _ => Vec::new(),
    }
}

fn translate_event(work_root: &Path, event: &Event) -> (Vec<ChangeEvent>, Vec<ChangeEvent>, Vec<ChangeEvent>) {
    let mut updated = Vec::new();
    let mut added = Vec::new();
    let mut removed = Vec::new();

    let transitions = classify(&event.kind);
    // Rename(Both) lists the source path first, then the destination.
    let pairs: Vec<(Transition, &PathBuf)> = if transitions.len() == event.paths.len() {
        transitions.iter().copied().zip(event.paths.iter()).collect()
    } else {
        transitions
            .first()
            .map(|t| event.paths.iter().map(|p| (*t, p)).collect())
            .unwrap_or_default()
    };

    for (transition, local) in pairs {
        let Some(path) = to_driver_path(work_root, local) else {
            continue;
        };
        match transition {
            Transition::Removed => removed.push(ChangeEvent::removed(&path)),
            Transition::Added | Transition::Updated => match stat_local(work_root, &path) {
                Ok(Some(stat)) => {
                    let event = ChangeEvent::with_stat(stat);
                    if transition == Transition::Added {
                        added.push(event);
                    } else {
                        updated.push(event);
                    }
                }
                // Gone again before we could stat it.
                Ok(None) => removed.push(ChangeEvent::removed(&path)),
                Err(e) => warn!("Cannot stat {} after change: {}", path, e),
            },
        }
    }

    (updated, added, removed)
}

impl Backend for LocalBackend {
    fn connect(&self) -> Result<()> {
        if self.role != Role::Discover {
            return Ok(());
        }
        if !self.work_root.exists() {
            return Err(SyncError::config(format!(
                "work_root does not exist: {}",
                self.work_root.display()
            )));
        }

        let work_root = self.work_root.clone();
        let handler = self.handler.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let (updated, added, removed) = translate_event(&work_root, &event);
                if updated.is_empty() && added.is_empty() && removed.is_empty() {
                    return;
                }
                debug!(
                    "Local change: {} updated, {} added, {} removed",
                    updated.len(),
                    added.len(),
                    removed.len()
                );
                let handler = handler.lock().clone();
                if let Some(handler) = handler {
                    handler(updated, added, removed);
                }
            }
            Err(e) => error!("Watch error: {:?}", e),
        })
        .map_err(|e| SyncError::internal(format!("failed to create watcher: {}", e)))?;

        watcher
            .watch(&self.work_root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::internal(format!("failed to watch {}: {}", self.work_root.display(), e)))?;
        info!("Watching path: {}", self.work_root.display());

        *self.watcher.lock() = Some(watcher);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(mut watcher) = self.watcher.lock().take() {
            if let Err(e) = watcher.unwatch(&self.work_root) {
                warn!("Failed to unwatch {}: {}", self.work_root.display(), e);
            }
            info!("Stopped watching: {}", self.work_root.display());
        }
        Ok(())
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.local_path(path).is_some_and(|p| p.exists()))
    }

    fn is_dir(&self, path: &str) -> Result<bool> {
        Ok(self.local_path(path).is_some_and(|p| p.is_dir()))
    }

    fn stat(&self, path: &str) -> Result<Option<Stat>> {
        stat_local(&self.work_root, path)
    }

    fn list_dir(&self, path: &str) -> Result<Option<Vec<String>>> {
        let Some(local) = self.local_path(path) else {
            return Ok(None);
        };
        if !local.is_dir() {
            return Ok(None);
        }
        let entries = match fs::read_dir(&local) {
            Ok(entries) => entries,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            names.push(lossy_name(&entry?.file_name()));
        }
        names.sort();
        Ok(Some(names))
    }

    fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let local = self.local_path(path).ok_or_else(|| not_found(path))?;
        let mut file = File::open(local)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.take(length).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn clear_cache(&self, _path: &str) {}

    fn set_notification_handler(&self, handler: NotificationHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn supported_roles(&self) -> &'static [Role] {
        &[Role::Discover, Role::ReadOnly]
    }

    fn plugin_name(&self) -> &'static str {
        "local"
    }
}

impl Drop for LocalBackend {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
