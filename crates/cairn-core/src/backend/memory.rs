use crate::backend::{chunk_bytes, Backend, BackendError, ByteStream, Capability};
use parking_lot::Mutex;
use std::collections::BTreeMap;

///
/// MemoryBackend
///
/// Process-local backend over a sorted map. Nothing is durable; `sync` is a
/// no-op. Intended for tests and caches.
///

#[derive(Default)]
pub struct MemoryBackend {
    values: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl Backend for MemoryBackend {
    fn add(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        let mut values = self.values.lock();
        if values.contains_key(key) {
            return Err(BackendError::KeyExists {
                key: key.to_owned(),
            });
        }
        values.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn update(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        self.values.lock().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn has(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.values.lock().contains_key(key))
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        self.values.lock().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let values = self.values.lock();
        Ok(values
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn clear(&self) -> Result<(), BackendError> {
        self.values.lock().clear();
        Ok(())
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Files]
    }

    fn stream(&self, key: &str, chunk_size: usize) -> Result<ByteStream, BackendError> {
        match self.values.lock().get(key) {
            Some(bytes) => Ok(chunk_bytes(bytes.clone(), chunk_size)),
            None => Err(BackendError::KeyNotFound {
                key: key.to_owned(),
            }),
        }
    }
}
