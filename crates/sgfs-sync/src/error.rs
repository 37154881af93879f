//! Error types for the sync driver.

use thiserror::Error;

/// Closed set of error classes surfaced to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The requested path does not exist on the backend.
    NotFound,
    /// The backend failed while serving a request.
    RemoteIo,
    /// Missing or malformed configuration.
    Config,
    /// Anything else.
    Internal,
}

/// Error variants for driver operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Wraps standard I/O errors coming out of a backend.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The path is not present on the backend.
    #[error("Path not found: {path}")]
    NotFound {
        /// Driver path that was looked up.
        path: String,
    },

    /// The backend failed to serve a request for a path.
    #[error("Remote I/O failure on {path}: {reason}")]
    RemoteIo {
        /// Driver path being accessed.
        path: String,
        /// Backend-supplied description.
        reason: String,
    },

    /// Configuration is missing a setting or cannot be parsed.
    #[error("Configuration error: {msg}")]
    Config {
        /// Description of the problem.
        msg: String,
    },

    /// No backend plugin is registered under the requested identifier.
    #[error("Backend plugin not found: {name}")]
    PluginNotFound {
        /// Requested plugin identifier.
        name: String,
    },

    /// Unexpected internal failure.
    #[error("Internal error: {msg}")]
    Internal {
        /// Description of the failure.
        msg: String,
    },
}

/// Result type alias for driver operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Shorthand for a [`SyncError::Config`].
    pub fn config(msg: impl Into<String>) -> Self {
        SyncError::Config { msg: msg.into() }
    }

    /// Shorthand for a [`SyncError::Internal`].
    pub fn internal(msg: impl Into<String>) -> Self {
        SyncError::Internal { msg: msg.into() }
    }

    /// Shorthand for a [`SyncError::RemoteIo`].
    pub fn remote_io(path: &str, reason: impl ToString) -> Self {
        SyncError::RemoteIo {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Classifies this error into the host-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            SyncError::Io(_) => ErrorKind::RemoteIo,
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::RemoteIo { .. } => ErrorKind::RemoteIo,
            SyncError::Config { .. } => ErrorKind::Config,
            SyncError::PluginNotFound { .. } => ErrorKind::Config,
            SyncError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Maps the error onto the errno the host reports for a failed request.
    pub fn to_errno(&self) -> i32 {
        use libc::*;
        match self.kind() {
            ErrorKind::NotFound => ENOENT,
            ErrorKind::RemoteIo => EREMOTEIO,
            ErrorKind::Config => EINVAL,
            ErrorKind::Internal => EIO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_errno() {
        let err = SyncError::NotFound {
            path: "/missing".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_errno(), libc::ENOENT);
    }

    #[test]
    fn test_remote_io_errno() {
        let err = SyncError::remote_io("/x", "connection reset");
        assert_eq!(err.kind(), ErrorKind::RemoteIo);
        assert_eq!(err.to_errno(), libc::EREMOTEIO);
    }

    #[test]
    fn test_plugin_not_found_is_config() {
        let err = SyncError::PluginNotFound {
            name: "ftp".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Config);
        assert_eq!(err.to_errno(), libc::EINVAL);
    }

    #[test]
    fn test_io_error_classification() {
        let missing = SyncError::from(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(missing.kind(), ErrorKind::NotFound);

        let denied = SyncError::from(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(denied.kind(), ErrorKind::RemoteIo);
    }

    #[test]
    fn test_display_messages_non_empty() {
        let errors = [
            SyncError::NotFound {
                path: "/a".to_string(),
            },
            SyncError::remote_io("/a", "boom"),
            SyncError::config("bad"),
            SyncError::internal("oops"),
            SyncError::PluginNotFound {
                name: "x".to_string(),
            },
        ];
        for err in errors {
            assert!(!err.to_string().is_empty());
        }
    }
}
