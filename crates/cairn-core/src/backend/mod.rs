//! The key-value contract the engine depends on.
//!
//! The core never reaches past this interface: stores serialize records to
//! opaque byte strings and hand them to a [`Backend`]. Optional extensions
//! (blob streaming, filesystem paths) are advertised through
//! [`Capability`] flags and probed before use.

mod directory;
mod memory;

pub use directory::DirectoryBackend;
pub use memory::MemoryBackend;

use std::path::PathBuf;
use thiserror::Error as ThisError;

///
/// BackendError
///

#[derive(Debug, ThisError)]
pub enum BackendError {
    #[error("key already exists: {key}")]
    KeyExists { key: String },

    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("operation '{operation}' not supported by this backend")]
    Unsupported { operation: String },
}

impl From<crate::serialize::CodecError> for BackendError {
    fn from(err: crate::serialize::CodecError) -> Self {
        Self::Codec(err.to_string())
    }
}

///
/// Capability
///
/// Optional extensions a backend may advertise. Callers probe these before
/// using the corresponding operations.
///

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Capability {
    /// Values are held in discrete files.
    Files,
    /// `path()` resolves keys to real filesystem paths.
    Filesystem,
    ObjectsOpt,
    MetricsOpt,
    RawOpt,
    IndexOpt,
    Index,
}

/// Lazily pulled byte chunks of one stored blob.
pub type ByteStream = Box<dyn Iterator<Item = Result<Vec<u8>, BackendError>> + Send>;

///
/// Backend
///

pub trait Backend: Send + Sync {
    /// Create; fails with [`BackendError::KeyExists`] if the key is taken.
    fn add(&self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    /// Overwrite; creates the key if missing.
    fn update(&self, key: &str, value: &[u8]) -> Result<(), BackendError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    fn has(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.get(key)?.is_some())
    }

    /// Idempotent delete.
    fn remove(&self, key: &str) -> Result<(), BackendError>;

    /// Lexicographic enumeration of the keys under `prefix`.
    fn keys(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    /// Flush durable state.
    fn sync(&self) -> Result<(), BackendError> {
        Ok(())
    }

    /// Remove everything.
    fn clear(&self) -> Result<(), BackendError>;

    fn capabilities(&self) -> &'static [Capability];

    /// Stream the value at `key` in chunks of at most `chunk_size` bytes.
    ///
    /// The default materializes the value; backends with `RawOpt` should
    /// override with a genuinely incremental read.
    fn stream(&self, key: &str, chunk_size: usize) -> Result<ByteStream, BackendError> {
        match self.get(key)? {
            Some(bytes) => Ok(chunk_bytes(bytes, chunk_size)),
            None => Err(BackendError::KeyNotFound {
                key: key.to_owned(),
            }),
        }
    }

    /// Filesystem path of the value at `key`; only meaningful when
    /// [`Capability::Filesystem`] is advertised.
    fn path(&self, key: &str) -> Result<PathBuf, BackendError> {
        let _ = key;
        Err(BackendError::Unsupported {
            operation: "path".to_owned(),
        })
    }
}

pub(crate) fn chunk_bytes(bytes: Vec<u8>, chunk_size: usize) -> ByteStream {
    let chunk_size = chunk_size.max(1);
    let chunks: Vec<Vec<u8>> = bytes.chunks(chunk_size).map(<[u8]>::to_vec).collect();
    Box::new(chunks.into_iter().map(Ok))
}

pub(crate) fn has_capability(backend: &dyn Backend, capability: Capability) -> bool {
    backend.capabilities().contains(&capability)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_covers_all_bytes() {
        let data: Vec<u8> = (0..=255).collect();
        let chunks: Vec<Vec<u8>> = chunk_bytes(data.clone(), 100)
            .map(Result::unwrap)
            .collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), data);
    }

    #[test]
    fn chunking_empty_yields_no_chunks() {
        assert_eq!(chunk_bytes(Vec::new(), 64).count(), 0);
    }
}
