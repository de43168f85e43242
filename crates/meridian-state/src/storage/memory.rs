use std::collections::BTreeMap;

use super::{scan, Storage, WriteBatch};
use crate::error::StateError;

/// Ordered map kept in memory. Used by tests and throwaway nodes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StateError> {
        Ok(self.data.get(key).cloned())
    }

    fn write(&mut self, batch: WriteBatch) -> Result<(), StateError> {
        batch.apply_to(&mut self.data);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StateError> {
        Ok(scan(&self.data, prefix))
    }
}
