use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use cohort_store::error::{Error as StoreError, Result as StoreResult};
use cohort_store::Storage;

const TMP_MARKER: &str = ".tmp-";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Local filesystem storage rooted at a directory.
///
/// Object paths are `/`-separated and relative to the root. Writes go to a
/// sibling temp file which is fsynced and renamed over the target, so readers
/// never observe a partial object.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StoreError::Storage(format!(
                "path '{path}' escapes the storage root"
            )));
        }
        Ok(self.root.join(rel))
    }
}

fn storage_err(op: &str, path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Storage(format!("{op} {}: {e}", path.display()))
}

impl Storage for FsStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> StoreResult<()> {
        let target = self.resolve(path)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).map_err(|e| storage_err("mkparent", &parent, e))?;

        let file_name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StoreError::Storage(format!("path '{path}' has no file name")))?;
        let tmp = parent.join(format!(
            ".{file_name}{TMP_MARKER}{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let written = (|| {
            let mut f = File::create(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
            fs::rename(&tmp, &target)
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(storage_err("write", &target, e));
        }
        Ok(())
    }

    fn read(&self, path: &str) -> StoreResult<Option<Vec<u8>>> {
        let p = self.resolve(path)?;
        match fs::read(&p) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err("read", &p, e)),
        }
    }

    fn delete(&self, path: &str) -> StoreResult<()> {
        let p = self.resolve(path)?;
        match fs::remove_file(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("delete", &p, e)),
        }
    }

    fn list(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let start = self.resolve(prefix)?;
        let mut results = Vec::new();

        if !start.exists() {
            return Ok(results);
        }

        fn visit_dirs(root: &Path, dir: &Path, results: &mut Vec<String>) -> std::io::Result<()> {
            if dir.is_dir() {
                for entry in fs::read_dir(dir)? {
                    let path = entry?.path();
                    if path.is_dir() {
                        visit_dirs(root, &path, results)?;
                    } else if let Ok(rel) = path.strip_prefix(root) {
                        let rel = rel
                            .components()
                            .filter_map(|c| c.as_os_str().to_str())
                            .collect::<Vec<_>>()
                            .join("/");
                        if !rel.contains(TMP_MARKER) {
                            results.push(rel);
                        }
                    }
                }
            }
            Ok(())
        }

        if start.is_file() {
            results.push(prefix.trim_start_matches('/').to_string());
        } else {
            visit_dirs(&self.root, &start, &mut results)
                .map_err(|e| storage_err("list", &start, e))?;
        }
        results.sort();
        Ok(results)
    }
}
