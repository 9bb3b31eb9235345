//! Directory-backed object store.
//!
//! Keys are relative paths under the root (`data_tickets/20240305_0900.csv`).
//! A bucket mounted as a filesystem works the same way. Directory placeholders
//! are implicit: `list` only reports files.

use std::fs;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{ObjectMeta, ObjectStore, StoreError};

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|part| matches!(part, Component::Normal(_)));
        if !safe {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .map(|part| part.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }

    fn walk(&self, dir: &Path, out: &mut Vec<ObjectMeta>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StoreError::io(&dir.display().to_string(), err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| StoreError::io(&dir.display().to_string(), err))?;
            let path = entry.path();
            let meta = entry
                .metadata()
                .map_err(|err| StoreError::io(&path.display().to_string(), err))?;
            if meta.is_dir() {
                self.walk(&path, out)?;
                continue;
            }
            if is_temp_file(&path) {
                continue;
            }
            let Some(key) = self.key_for(&path) else {
                continue;
            };
            let modified = meta
                .modified()
                .map_err(|err| StoreError::io(&key, err))?;
            out.push(ObjectMeta {
                key,
                last_modified: DateTime::<Utc>::from(modified),
            });
        }
        Ok(())
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with('.') && name.ends_with(".tmp"))
}

impl ObjectStore for FsObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, StoreError> {
        let mut out = Vec::new();
        self.walk(&self.root, &mut out)?;
        out.retain(|obj| obj.key.starts_with(prefix));
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::io(key, err)
            }
        })
    }

    fn put(&self, key: &str, body: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        fs::create_dir_all(parent).map_err(|err| StoreError::io(key, err))?;

        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let tmp = parent.join(format!(".{file_name}.tmp"));
        let mut file = fs::File::create(&tmp).map_err(|err| StoreError::io(key, err))?;
        file.write_all(body).map_err(|err| StoreError::io(key, err))?;
        file.sync_all().map_err(|err| StoreError::io(key, err))?;
        drop(file);
        fs::rename(&tmp, &path).map_err(|err| StoreError::io(key, err))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(key, err)),
        }
    }
}
