use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tempfile::Builder;

use crate::cache::CacheBackend;
use crate::error::KiraError;

/// Durable cache backend: one JSON document per key under a root directory.
///
/// Keys are `step/strategy/digest`, so each step owns a subdirectory and a
/// step-scoped invalidation is a directory removal. Entries are written with
/// [`write_atomic`]; an interrupted write leaves at most a stray temp file.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: Utf8PathBuf,
}

impl FileStore {
    pub fn new() -> Result<Self, KiraError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("kira-netpharm"))
                    .ok()
            })
            .ok_or_else(|| {
                KiraError::Filesystem("unable to resolve cache directory".to_string())
            })?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn entry_path(&self, key: &str) -> Result<Utf8PathBuf, KiraError> {
        let relative = Utf8Path::new(key);
        let safe = relative.components().all(|component| {
            matches!(component, camino::Utf8Component::Normal(_))
        });
        if key.is_empty() || !safe {
            return Err(KiraError::CacheUnavailable(format!("unsafe cache key: {key}")));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

/// Write through a temp file in the destination directory, then rename over
/// the target.
pub fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
    let parent = path
        .parent()
        .ok_or_else(|| KiraError::Filesystem("invalid destination path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    let temp = Builder::new()
        .prefix(".kira-np-tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    fs::write(temp.path(), content).map_err(|err| KiraError::Filesystem(err.to_string()))?;
    temp.persist(path.as_std_path())
        .map_err(|err| KiraError::Filesystem(err.to_string()))?;
    Ok(())
}

impl CacheBackend for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KiraError> {
        let path = self.entry_path(key)?;
        match fs::read(path.as_std_path()) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(KiraError::CacheUnavailable(format!("read {path}: {err}"))),
        }
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), KiraError> {
        let path = self.entry_path(key)?;
        write_atomic(&path, value)
            .map_err(|err| KiraError::CacheUnavailable(err.to_string()))
    }

    fn delete(&self, key: &str) -> Result<(), KiraError> {
        let path = self.entry_path(key)?;
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(KiraError::CacheUnavailable(format!("remove {path}: {err}"))),
        }
    }

    fn delete_prefix(&self, prefix: &str) -> Result<usize, KiraError> {
        let scope = prefix.trim_end_matches('/');
        let dir = if scope.is_empty() {
            self.root.clone()
        } else {
            let safe = Utf8Path::new(scope)
                .components()
                .all(|component| matches!(component, camino::Utf8Component::Normal(_)));
            if !safe {
                return Err(KiraError::CacheUnavailable(format!("unsafe cache prefix: {prefix}")));
            }
            self.root.join(scope)
        };
        if !dir.as_std_path().exists() {
            return Ok(0);
        }
        let removed = walk_dir(dir.as_std_path())?
            .iter()
            .filter(|path| is_entry(path))
            .count();
        if scope.is_empty() {
            for entry in fs::read_dir(dir.as_std_path())
                .map_err(|err| KiraError::CacheUnavailable(err.to_string()))?
            {
                let path = entry
                    .map_err(|err| KiraError::CacheUnavailable(err.to_string()))?
                    .path();
                remove_path(&path)?;
            }
        } else {
            remove_path(dir.as_std_path())?;
        }
        Ok(removed)
    }
}

fn is_entry(path: &Path) -> bool {
    path.is_file() && path.extension().map(|ext| ext == "json").unwrap_or(false)
}

fn remove_path(path: &Path) -> Result<(), KiraError> {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    result.map_err(|err| KiraError::CacheUnavailable(format!("remove {}: {err}", path.display())))
}

fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, KiraError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries =
            fs::read_dir(&path).map_err(|err| KiraError::CacheUnavailable(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| KiraError::CacheUnavailable(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn store() -> (tempfile::TempDir, FileStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("cache")).unwrap();
        (temp, FileStore::new_with_root(root))
    }

    #[test]
    fn layout_paths() {
        let (_temp, store) = store();
        let path = store.entry_path("targets/chembl/abc123").unwrap();
        assert!(path.ends_with("targets/chembl/abc123.json"));
        assert_matches!(
            store.entry_path("../escape"),
            Err(KiraError::CacheUnavailable(_))
        );
    }

    #[test]
    fn round_trip_and_delete() {
        let (_temp, store) = store();
        assert_eq!(store.get("targets/chembl/k1").unwrap(), None);
        store.put("targets/chembl/k1", b"{}").unwrap();
        assert_eq!(store.get("targets/chembl/k1").unwrap(), Some(b"{}".to_vec()));
        store.delete("targets/chembl/k1").unwrap();
        assert_eq!(store.get("targets/chembl/k1").unwrap(), None);
        store.delete("targets/chembl/k1").unwrap();
    }

    #[test]
    fn delete_prefix_scopes_by_step() {
        let (_temp, store) = store();
        store.put("targets/chembl/k1", b"1").unwrap();
        store.put("targets/stitch/k2", b"2").unwrap();
        store.put("disease/omim/k3", b"3").unwrap();

        assert_eq!(store.delete_prefix("targets/").unwrap(), 2);
        assert_eq!(store.get("targets/chembl/k1").unwrap(), None);
        assert!(store.get("disease/omim/k3").unwrap().is_some());

        assert_eq!(store.delete_prefix("").unwrap(), 1);
        assert!(store.root().as_std_path().exists());
        assert_eq!(store.delete_prefix("missing/").unwrap(), 0);
    }
}
