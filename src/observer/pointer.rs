//! Single-slot persistence of the scan being tracked.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;

use crate::observer::signals::ClientScanPointer;

#[derive(Debug, Error)]
pub enum PointerError {
    #[error("pointer I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pointer is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Where the active-scan pointer survives restarts.
pub trait PointerStore: Send + Sync {
    fn load(&self) -> Result<Option<ClientScanPointer>, PointerError>;
    fn save(&self, pointer: &ClientScanPointer) -> Result<(), PointerError>;
    fn clear(&self) -> Result<(), PointerError>;
}

/// Pointer kept as a JSON file, written through a temp file and rename.
pub struct FilePointerStore {
    path: PathBuf,
}

impl FilePointerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PointerStore for FilePointerStore {
    fn load(&self) -> Result<Option<ClientScanPointer>, PointerError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, pointer: &ClientScanPointer) -> Result<(), PointerError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(pointer)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn clear(&self) -> Result<(), PointerError> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// Process-local pointer slot.
#[derive(Default)]
pub struct MemoryPointerStore {
    slot: Mutex<Option<ClientScanPointer>>,
}

impl MemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PointerStore for MemoryPointerStore {
    fn load(&self) -> Result<Option<ClientScanPointer>, PointerError> {
        Ok(self.slot.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save(&self, pointer: &ClientScanPointer) -> Result<(), PointerError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(pointer.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), PointerError> {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_store_round_trip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePointerStore::new(dir.path().join("active_scan.json"));
        assert!(store.load().unwrap().is_none());

        let pointer = ClientScanPointer::new("s1", "username", "jdoe");
        store.save(&pointer).unwrap();
        assert_eq!(store.load().unwrap(), Some(pointer));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        // Clearing twice is fine.
        store.clear().unwrap();
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active_scan.json");
        fs::write(&path, b"{not json").unwrap();
        let store = FilePointerStore::new(path);
        assert!(matches!(store.load(), Err(PointerError::Serialization(_))));
    }
}
