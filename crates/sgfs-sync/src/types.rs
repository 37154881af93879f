//! Core data types shared by every component of the driver.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// Mode bits advertised for files; the gateway only exposes data read-only.
pub const FILE_MODE: u32 = 0o444;
/// Mode bits advertised for directories.
pub const DIR_MODE: u32 = 0o555;

/// Metadata of one backend entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// True when the entity is a directory.
    pub is_directory: bool,
    /// Driver path of the entity.
    pub path: String,
    /// Final path component.
    pub name: String,
    /// Size in bytes; 0 for directories.
    pub size: u64,
    /// Backend checksum, 0 when the backend has none.
    pub checksum: u64,
    /// Creation time, seconds since epoch.
    pub create_time: u64,
    /// Modification time, seconds since epoch.
    pub modify_time: u64,
}

impl Stat {
    /// Stat of a regular file with the given size.
    pub fn file(path: &str, size: u64) -> Self {
        Self {
            is_directory: false,
            path: path.to_string(),
            name: base_name(path).to_string(),
            size,
            checksum: 0,
            create_time: 0,
            modify_time: 0,
        }
    }

    /// Stat of a directory.
    pub fn dir(path: &str) -> Self {
        Self {
            is_directory: true,
            path: path.to_string(),
            name: base_name(path).to_string(),
            size: 0,
            checksum: 0,
            create_time: 0,
            modify_time: 0,
        }
    }
}

/// One filesystem entity transition reported by a backend.
///
/// A missing `stat` means the entity was removed (or could not be statted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Driver path of the entity.
    pub path: String,
    /// Current metadata, if any.
    pub stat: Option<Stat>,
}

impl ChangeEvent {
    /// Event carrying fresh metadata for its path.
    pub fn with_stat(stat: Stat) -> Self {
        Self {
            path: stat.path.clone(),
            stat: Some(stat),
        }
    }

    /// Event for a removed path.
    pub fn removed(path: &str) -> Self {
        Self {
            path: path.to_string(),
            stat: None,
        }
    }

    /// Whether the event refers to a directory, as far as it is known.
    pub fn is_directory(&self) -> bool {
        self.stat.as_ref().map(|s| s.is_directory).unwrap_or(false)
    }
}

/// Verb of a metadata command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandVerb {
    /// Create or update the path downstream.
    Put,
    /// Remove the path downstream.
    Delete,
}

/// Kind of entity a command describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

impl EntityKind {
    fn mode(self) -> u32 {
        match self {
            EntityKind::File => FILE_MODE,
            EntityKind::Directory => DIR_MODE,
        }
    }
}

/// Metadata TTLs stamped on every command, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandTtl {
    /// Downstream read TTL.
    pub read_ttl_ms: u64,
    /// Downstream write TTL.
    pub write_ttl_ms: u64,
}

impl Default for CommandTtl {
    fn default() -> Self {
        Self {
            read_ttl_ms: 300_000,
            write_ttl_ms: 300_000,
        }
    }
}

/// A put/delete directive describing one path's current metadata state.
///
/// Commands are immutable once built; the queue hands them to the sink by value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Put or delete.
    #[serde(rename = "op")]
    pub verb: CommandVerb,
    /// File or directory.
    #[serde(rename = "f_type")]
    pub kind: EntityKind,
    /// Advertised permission bits.
    pub mode: u32,
    /// File size; absent for directories and deletes.
    pub size: Option<u64>,
    /// Driver path.
    pub path: String,
    /// Read TTL in milliseconds.
    pub read_ttl: u64,
    /// Write TTL in milliseconds.
    pub write_ttl: u64,
}

impl Command {
    /// Put command matching the given stat.
    pub fn put(stat: &Stat, path: &str, ttl: CommandTtl) -> Self {
        let kind = if stat.is_directory {
            EntityKind::Directory
        } else {
            EntityKind::File
        };
        Self {
            verb: CommandVerb::Put,
            kind,
            mode: kind.mode(),
            size: match kind {
                EntityKind::File => Some(stat.size),
                EntityKind::Directory => None,
            },
            path: path.to_string(),
            read_ttl: ttl.read_ttl_ms,
            write_ttl: ttl.write_ttl_ms,
        }
    }

    /// Delete command for a path.
    pub fn delete(path: &str, kind: EntityKind, ttl: CommandTtl) -> Self {
        Self {
            verb: CommandVerb::Delete,
            kind,
            mode: kind.mode(),
            size: None,
            path: path.to_string(),
            read_ttl: ttl.read_ttl_ms,
            write_ttl: ttl.write_ttl_ms,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self.verb {
            CommandVerb::Put => "put",
            CommandVerb::Delete => "delete",
        };
        let kind = match self.kind {
            EntityKind::File => "file",
            EntityKind::Directory => "dir",
        };
        write!(f, "{} {} {}", verb, kind, self.path)
    }
}

/// Role of the process, fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Walks the dataset and watches it for changes.
    Discover,
    /// Serves reads only.
    ReadOnly,
}

impl FromStr for Role {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "discover" => Ok(Role::Discover),
            "read-only" | "readonly" | "read" => Ok(Role::ReadOnly),
            other => Err(SyncError::config(format!("unknown role: {}", other))),
        }
    }
}

/// Joins a driver directory path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Final component of a driver path; `/` for the root.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/";
    }
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}
