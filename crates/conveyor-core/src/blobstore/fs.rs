//! Filesystem-backed blob store.
//!
//! Layout: `<root>/<key>` with the key's slashes as directories. Writes go
//! through a temp file in the destination directory followed by a rename;
//! `FailIfExists` uses `O_CREAT|O_EXCL` via `OpenOptions::create_new` so the
//! precondition is atomic rather than check-then-write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{validate_key, BlobStore, BlobStoreError, Result, WritePrecondition};

pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn cat(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(key)?;
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BlobStoreError::NotFound(key.to_string())
            } else {
                BlobStoreError::Io(e)
            }
        })
    }

    fn copy(&self, data: &[u8], key: &str, precondition: WritePrecondition) -> Result<()> {
        let path = self.blob_path(key)?;
        let dir = path.parent().expect("validated keys have a parent");
        fs::create_dir_all(dir)?;

        match precondition {
            WritePrecondition::None => {
                let tmp = path.with_extension("tmp-write");
                fs::write(&tmp, data)?;
                fs::rename(&tmp, &path)?;
            }
            WritePrecondition::FailIfExists => {
                let mut file = fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|e| {
                        if e.kind() == std::io::ErrorKind::AlreadyExists {
                            BlobStoreError::PreconditionFailed(key.to_string())
                        } else {
                            BlobStoreError::Io(e)
                        }
                    })?;
                file.write_all(data)?;
            }
        }
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.blob_path(key)?.is_file())
    }
}
