//! Byte-range reads served through the block cache.

use std::io::Write;
use std::sync::Arc;

use tracing::debug;

use crate::backend::Backend;
use crate::block_cache::BlockCache;
use crate::error::{ErrorKind, Result, SyncError};

/// Read path combining the backend with the shared block cache.
pub struct ReadPath {
    backend: Arc<dyn Backend>,
    cache: Arc<BlockCache>,
}

impl ReadPath {
    /// Read path over `backend`, caching in `cache`.
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<BlockCache>) -> Self {
        Self { backend, cache }
    }

    /// Returns the bytes of `[offset, offset + length)` of `path`.
    ///
    /// Fails with `NotFound` without touching the cache when the backend
    /// does not know the path; backend read failures become `RemoteIo`.
    pub fn read(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>> {
        let exists = self
            .backend
            .exists(path)
            .map_err(|e| SyncError::remote_io(path, e))?;
        if !exists {
            return Err(SyncError::NotFound {
                path: path.to_string(),
            });
        }

        let backend = &self.backend;
        self.cache.get_or_load(path, offset, length, |p, o, l| {
            debug!("cache miss {} [{}+{}]", p, o, l);
            backend.read(p, o, l).map_err(|e| match e.kind() {
                ErrorKind::RemoteIo => e,
                _ => SyncError::remote_io(p, e),
            })
        })
    }

    /// Reads the range and writes it to `out`, returning the byte count.
    pub fn read_into<W: Write>(&self, path: &str, offset: u64, length: u64, out: &mut W) -> Result<usize> {
        let data = self.read(path, offset, length)?;
        out.write_all(&data)
            .map_err(|e| SyncError::internal(format!("output sink for {}: {}", path, e)))?;
        Ok(data.len())
    }
}
