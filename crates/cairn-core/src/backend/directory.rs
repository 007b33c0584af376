use crate::backend::{Backend, BackendError, ByteStream, Capability};
use crate::KEY_SEPARATOR;
use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
};

///
/// DirectoryBackend
///
/// Stores each value as one file under a root directory; `/`-separated key
/// segments become path segments. Writes land in a sibling temp file and
/// are renamed into place. Every operation hits the filesystem directly,
/// so `sync` has nothing left to flush.
///

pub struct DirectoryBackend {
    root: PathBuf,
}

impl DirectoryBackend {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> Result<PathBuf, BackendError> {
        let mut path = self.root.clone();
        for segment in key.split(KEY_SEPARATOR) {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(BackendError::Codec(format!("unusable key: '{key}'")));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn write(&self, path: &Path, value: &[u8]) -> Result<(), BackendError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp~");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Drop now-empty directories left behind by a removal.
    fn prune(&self, mut dir: PathBuf) {
        while dir != self.root {
            let empty = fs::read_dir(&dir).map(|mut d| d.next().is_none());
            if !matches!(empty, Ok(true)) || fs::remove_dir(&dir).is_err() {
                return;
            }
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => return,
            }
        }
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> Result<(), BackendError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_temp = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(".tmp~"));
            if is_temp {
                continue;
            }
            if path.is_dir() {
                self.collect_keys(&path, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join(&KEY_SEPARATOR.to_string());
                out.push(key);
            }
        }
        Ok(())
    }
}

impl Backend for DirectoryBackend {
    fn add(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        let path = self.key_path(key)?;
        if path.exists() {
            return Err(BackendError::KeyExists {
                key: key.to_owned(),
            });
        }
        self.write(&path, value)
    }

    fn update(&self, key: &str, value: &[u8]) -> Result<(), BackendError> {
        let path = self.key_path(key)?;
        self.write(&path, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let path = self.key_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn has(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.key_path(key)?.is_file())
    }

    fn remove(&self, key: &str) -> Result<(), BackendError> {
        let path = self.key_path(key)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                if let Some(parent) = path.parent() {
                    self.prune(parent.to_path_buf());
                }
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<(), BackendError> {
        fs::remove_dir_all(&self.root)?;
        fs::create_dir_all(&self.root)?;
        Ok(())
    }

    fn capabilities(&self) -> &'static [Capability] {
        &[Capability::Files, Capability::Filesystem, Capability::RawOpt]
    }

    fn stream(&self, key: &str, chunk_size: usize) -> Result<ByteStream, BackendError> {
        let path = self.key_path(key)?;
        let file = fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::KeyNotFound {
                    key: key.to_owned(),
                }
            } else {
                e.into()
            }
        })?;
        Ok(Box::new(FileChunks {
            file,
            chunk_size: chunk_size.max(1),
            done: false,
        }))
    }

    fn path(&self, key: &str) -> Result<PathBuf, BackendError> {
        self.key_path(key)
    }
}

struct FileChunks {
    file: fs::File,
    chunk_size: usize,
    done: bool,
}

impl Iterator for FileChunks {
    type Item = Result<Vec<u8>, BackendError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < self.chunk_size {
            match self.file.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.done = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }
        if filled == 0 {
            return None;
        }
        buf.truncate(filled);
        Some(Ok(buf))
    }
}
