//! # Image Storage
//!
//! One slot per homework id under the storage root:
//!
//! ```text
//! <root>/<HOMEWORK_ID>/latest.bmp
//! ```
//!
//! Writes go to a temp file inside the slot and are renamed over
//! `latest.bmp`, so the viewer sees either the previous image or the new one,
//! never a partial file. Concurrent uploads to the same id race and the last
//! rename wins.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::common::identifier::Identifier;

/// File name of the current image inside a slot.
pub const IMAGE_FILE_NAME: &str = "latest.bmp";

/// Prefix of in-flight temp files. The viewer ignores dot-files.
pub const TEMP_FILE_PREFIX: &str = ".upload-";

/// Handle to the storage root. Cheap to clone and shared by all handlers.
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Open an existing storage root.
    ///
    /// The root is provisioned externally and is never created here. Fails
    /// if the path is missing, is not a directory, or cannot be written to.
    /// Temp files left in the slots by a previous process are removed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();

        let metadata = fs::metadata(&root)
            .with_context(|| format!("storage root {} is not accessible", root.display()))?;
        if !metadata.is_dir() {
            bail!("storage root {} is not a directory", root.display());
        }

        // Probe writability the same way uploads write: a temp file in the directory.
        NamedTempFile::new_in(&root)
            .with_context(|| format!("storage root {} is not writable", root.display()))?;

        let storage = Self { root };
        let swept = storage
            .sweep_stale_uploads()
            .with_context(|| format!("failed to scan storage root {}", storage.root.display()))?;
        if swept > 0 {
            info!("Removed {} stale upload temp files", swept);
        }
        Ok(storage)
    }

    /// Delete `.upload-*` files inside every slot. Only safe while no
    /// upload is in flight, i.e. before the listener starts.
    fn sweep_stale_uploads(&self) -> io::Result<usize> {
        let mut removed = 0;
        for slot in fs::read_dir(&self.root)? {
            let slot = slot?;
            if !slot.file_type()?.is_dir() {
                continue;
            }
            let entries = match fs::read_dir(slot.path()) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Cannot scan slot {}: {}", slot.path().display(), e);
                    continue;
                }
            };
            for entry in entries.flatten() {
                let is_temp = entry
                    .file_name()
                    .to_str()
                    .map_or(false, |name| name.starts_with(TEMP_FILE_PREFIX));
                if !is_temp || !entry.file_type().map_or(false, |t| t.is_file()) {
                    continue;
                }
                match fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Cannot remove {}: {}", entry.path().display(), e),
                }
            }
        }
        Ok(removed)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn slot_path(&self, id: &Identifier) -> PathBuf {
        self.root.join(id.as_str())
    }

    pub fn image_path(&self, id: &Identifier) -> PathBuf {
        self.slot_path(id).join(IMAGE_FILE_NAME)
    }

    /// Durably replace the image for `id` with `payload`.
    ///
    /// Returns the path of the stored image. On any error the previous image
    /// is untouched and the temp file is removed when it drops.
    pub fn store(&self, id: &Identifier, payload: &[u8]) -> io::Result<PathBuf> {
        let slot = self.slot_path(id);
        match fs::create_dir(&slot) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let mut temp = Builder::new().prefix(TEMP_FILE_PREFIX).tempfile_in(&slot)?;
        temp.write_all(payload)?;
        temp.as_file().sync_all()?;

        let target = slot.join(IMAGE_FILE_NAME);
        temp.persist(&target).map_err(|e| e.error)?;
        sync_dir(&slot)?;

        Ok(target)
    }

    /// [`Storage::store`] on the blocking thread pool.
    pub async fn store_async(&self, id: Identifier, payload: Vec<u8>) -> io::Result<PathBuf> {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || storage.store(&id, &payload))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("store task failed: {}", e)))?
    }

    /// Read the current image for `id`, or `None` if it was never uploaded.
    pub fn load(&self, id: &Identifier) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.image_path(id)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::identifier::validate;
    use tempfile::TempDir;

    fn slot_entries(storage: &Storage, id: &Identifier) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(storage.slot_path(id))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let id = validate("ABC123456").unwrap();

        assert_eq!(storage.load(&id).unwrap(), None);

        let path = storage.store(&id, &[1, 2, 3, 4]).unwrap();
        assert_eq!(path, dir.path().join("ABC123456").join(IMAGE_FILE_NAME));
        assert_eq!(storage.load(&id).unwrap(), Some(vec![1, 2, 3, 4]));
    }

    #[test]
    fn test_second_upload_replaces_first() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let id = validate("ABCDEF123").unwrap();

        storage.store(&id, &[0xaa; 100]).unwrap();
        storage.store(&id, &[0xbb; 3]).unwrap();

        assert_eq!(storage.load(&id).unwrap(), Some(vec![0xbb; 3]));
        assert_eq!(slot_entries(&storage, &id), vec![IMAGE_FILE_NAME.to_string()]);
    }

    #[test]
    fn test_failed_commit_keeps_slot_clean() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let id = validate("000000001").unwrap();

        // A directory where the image should be makes the rename fail.
        fs::create_dir_all(storage.image_path(&id)).unwrap();

        assert!(storage.store(&id, &[1, 2, 3]).is_err());
        assert_eq!(slot_entries(&storage, &id), vec![IMAGE_FILE_NAME.to_string()]);
        assert!(storage.image_path(&id).is_dir());
    }

    #[test]
    fn test_open_removes_leftover_temp_files() {
        let dir = TempDir::new().unwrap();
        let slot = dir.path().join("ABC123456");
        fs::create_dir(&slot).unwrap();
        fs::write(slot.join(IMAGE_FILE_NAME), b"kept").unwrap();
        fs::write(slot.join(".upload-x1y2z3"), b"half").unwrap();
        fs::write(slot.join(".upload-a9b8c7"), b"half").unwrap();
        fs::write(dir.path().join(".upload-root"), b"not in a slot").unwrap();

        let storage = Storage::open(dir.path()).unwrap();
        let id = validate("ABC123456").unwrap();

        assert_eq!(slot_entries(&storage, &id), vec![IMAGE_FILE_NAME.to_string()]);
        assert_eq!(storage.load(&id).unwrap(), Some(b"kept".to_vec()));
        assert!(dir.path().join(".upload-root").exists());
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("not-provisioned");

        let err = Storage::open(&missing).unwrap_err();
        assert!(err.to_string().contains("not accessible"), "{}", err);
        assert!(!missing.exists());
    }

    #[test]
    fn test_file_as_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("photos");
        fs::write(&file, b"").unwrap();

        let err = Storage::open(&file).unwrap_err();
        assert!(err.to_string().contains("not a directory"), "{}", err);
    }

    #[test]
    fn test_root_removed_after_start_is_storage_error() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("photos");
        fs::create_dir(&root).unwrap();
        let storage = Storage::open(&root).unwrap();
        fs::remove_dir(&root).unwrap();

        let id = validate("ABC123456").unwrap();
        assert!(storage.store(&id, &[1]).is_err());
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_store_async() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let id = validate("FFFFFFFFF").unwrap();

        storage.store_async(id.clone(), vec![7; 16]).await.unwrap();
        assert_eq!(storage.load(&id).unwrap(), Some(vec![7; 16]));
    }
}
