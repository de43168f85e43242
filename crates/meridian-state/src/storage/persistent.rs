use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use meridian_core::serialize;
use tracing::debug;

use super::{scan, Storage, WriteBatch};
use crate::error::StateError;

/// File-backed storage: the whole map is rewritten as one bincode snapshot
/// on every write (temporary file, then rename). Memory is only updated
/// once the snapshot is on disk.
#[derive(Debug, Clone)]
pub struct FileStorage {
    path: PathBuf,
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl FileStorage {
    pub fn new<P: Into<PathBuf>>(path: P) -> Result<Self, StateError> {
        let path = path.into();
        let data = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serialize::from_bytes(&bytes).map_err(|e| StateError::Corrupt {
                what: "snapshot",
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StateError::io(&path, e)),
        };

        debug!("Opened {:?} with {} keys", path, data.len());
        Ok(FileStorage { path, data })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), StateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
        }

        let bytes = serialize::to_bytes(data)?;
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &bytes).map_err(|e| StateError::io(&tmp_path, e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| StateError::io(&self.path, e))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.data.get(key).cloned())
    }

    fn write(&mut self, batch: WriteBatch) -> Result<(), StateError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut next = self.data.clone();
        batch.apply_to(&mut next);
        self.save(&next)?;
        self.data = next;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        Ok(scan(&self.data, prefix))
    }
}
