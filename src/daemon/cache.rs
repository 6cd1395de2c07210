//! Volume Cache
//!
//! Fixed number of slots holding decoded volumes, keyed by the file's
//! device and inode. Each entry counts its users; only entries with no
//! users can be evicted. The cache never blocks: a full table of busy
//! entries is an error.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::volume::{read_volume, Volume, VolumeError};

use super::subprocess::VolumeSource;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache full: all {slots} slots have users")]
    CapacityExceeded { slots: usize },

    #[error("Could not get information about {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not read volume {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: VolumeError,
    },

    #[error("{0} is not loaded")]
    NotLoaded(PathBuf),

    #[error("{path} has {users} other users")]
    InUse { path: PathBuf, users: usize },
}

/// Filesystem identity of a volume file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

impl FileId {
    pub fn of(path: &Path) -> Result<Self, CacheError> {
        let meta = std::fs::metadata(path).map_err(|source| CacheError::Stat {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }
}

/// Reference to a cache slot, valid while its user count is held
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeHandle(usize);

/// A loaded volume
#[derive(Debug)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub id: FileId,
    pub users: usize,
    pub volume: Volume,
}

/// Summary of one entry for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub path: PathBuf,
    pub id: FileId,
    pub users: usize,
    pub truncated: bool,
    pub memory: usize,
}

pub struct VolumeCache {
    slots: Vec<Option<CacheEntry>>,
    /// Successful decodes since creation
    loads: u64,
}

impl VolumeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            loads: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn loads(&self) -> u64 {
        self.loads
    }

    /// Slots holding a volume
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    fn find(&self, id: FileId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|e| e.id == id))
    }

    /// Empty slot first, then the first entry nobody uses
    fn free_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(Option::is_none)
            .or_else(|| {
                self.slots
                    .iter()
                    .position(|s| s.as_ref().is_some_and(|e| e.users == 0))
            })
    }

    fn load(path: &Path, deadline: Option<Instant>) -> Result<Volume, CacheError> {
        let source = VolumeSource::open(path).map_err(|source| CacheError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        if source.is_pipe() {
            debug!("Decompressing {}", path.display());
        }
        read_volume(source, deadline).map_err(|source| CacheError::Decode {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Get a handle to the volume at `path`, decoding it if needed, and
    /// count one more user.
    pub fn acquire(&mut self, path: &Path, deadline: Option<Instant>) -> Result<VolumeHandle, CacheError> {
        let id = FileId::of(path)?;

        if let Some(idx) = self.find(id) {
            let truncated = self.slots[idx]
                .as_ref()
                .is_some_and(|e| e.volume.is_truncated());
            if !truncated {
                if let Some(entry) = self.slots[idx].as_mut() {
                    entry.users += 1;
                    debug!("Reusing {} ({} users)", path.display(), entry.users);
                }
                return Ok(VolumeHandle(idx));
            }
            info!("Rereading truncated volume {}", path.display());
            return self.refresh(idx, path, id, deadline);
        }

        let idx = self.free_slot().ok_or(CacheError::CapacityExceeded {
            slots: self.slots.len(),
        })?;
        if let Some(old) = self.slots[idx].take() {
            debug!("Evicting {} from slot {}", old.path.display(), idx);
        }
        let volume = Self::load(path, deadline)?;
        self.loads += 1;
        info!(
            "Loaded {} into slot {} ({} sweeps{})",
            path.display(),
            idx,
            volume.sweep_count(),
            if volume.is_truncated() { ", truncated" } else { "" }
        );
        self.slots[idx] = Some(CacheEntry {
            path: path.to_path_buf(),
            id,
            users: 1,
            volume,
        });
        Ok(VolumeHandle(idx))
    }

    /// Decode again into an occupied slot and count one more user.
    ///
    /// On failure the old volume stays if someone still uses it, otherwise
    /// the slot is emptied.
    fn refresh(
        &mut self,
        idx: usize,
        path: &Path,
        id: FileId,
        deadline: Option<Instant>,
    ) -> Result<VolumeHandle, CacheError> {
        let users = self.slots[idx].as_ref().map_or(0, |e| e.users);
        match Self::load(path, deadline) {
            Ok(volume) => {
                self.loads += 1;
                self.slots[idx] = Some(CacheEntry {
                    path: path.to_path_buf(),
                    id,
                    users: users + 1,
                    volume,
                });
                Ok(VolumeHandle(idx))
            }
            Err(e) => {
                if users == 0 {
                    self.slots[idx] = None;
                }
                Err(e)
            }
        }
    }

    /// Discard any cached copy of `path` and decode it again. Fails if the
    /// entry has users.
    pub fn reload(&mut self, path: &Path, deadline: Option<Instant>) -> Result<VolumeHandle, CacheError> {
        let id = FileId::of(path)?;
        if let Some(idx) = self.find(id) {
            let users = self.slots[idx].as_ref().map_or(0, |e| e.users);
            if users > 0 {
                return Err(CacheError::InUse {
                    path: path.to_path_buf(),
                    users,
                });
            }
            self.slots[idx] = None;
        }
        self.acquire(path, deadline)
    }

    /// Drop one user of `path`. Unknown paths and unused entries are left
    /// alone.
    pub fn release(&mut self, path: &Path) {
        let idx = match FileId::of(path) {
            Ok(id) => self.find(id),
            // File may be gone; fall back to the name it was loaded under
            Err(_) => self
                .slots
                .iter()
                .position(|s| s.as_ref().is_some_and(|e| e.path == path)),
        };
        if let Some(idx) = idx {
            self.release_handle(VolumeHandle(idx));
        }
    }

    pub fn release_handle(&mut self, handle: VolumeHandle) {
        match self.slots.get_mut(handle.0).and_then(Option::as_mut) {
            Some(entry) if entry.users > 0 => {
                entry.users -= 1;
                debug!("Released {} ({} users)", entry.path.display(), entry.users);
            }
            Some(_) => {}
            None => warn!("Release of empty cache slot {}", handle.0),
        }
    }

    pub fn get(&self, handle: VolumeHandle) -> Option<&Volume> {
        self.slots
            .get(handle.0)
            .and_then(Option::as_ref)
            .map(|e| &e.volume)
    }

    pub fn entry(&self, path: &Path) -> Result<&CacheEntry, CacheError> {
        let id = FileId::of(path)?;
        self.find(id)
            .and_then(|idx| self.slots[idx].as_ref())
            .ok_or_else(|| CacheError::NotLoaded(path.to_path_buf()))
    }

    /// Users of the entry for `path`, if loaded
    pub fn users(&self, path: &Path) -> Option<usize> {
        self.entry(path).ok().map(|e| e.users)
    }

    pub fn list(&self) -> Vec<EntryInfo> {
        self.slots
            .iter()
            .flatten()
            .map(|e| EntryInfo {
                path: e.path.clone(),
                id: e.id,
                users: e.users,
                truncated: e.volume.is_truncated(),
                memory: e.volume.memory_size(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_a_stat_error() {
        let dir = TempDir::new().unwrap();
        let mut cache = VolumeCache::new(2);
        let err = cache.acquire(&dir.path().join("missing"), None).unwrap_err();
        assert!(matches!(err, CacheError::Stat { .. }));
        assert_eq!(cache.occupied(), 0);
    }

    #[test]
    fn failed_decode_leaves_slot_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![1u8; 20_000]).unwrap();

        let mut cache = VolumeCache::new(1);
        let err = cache.acquire(&path, None).unwrap_err();
        assert!(matches!(
            err,
            CacheError::Decode {
                source: VolumeError::BadMagicNumber { .. },
                ..
            }
        ));
        assert_eq!(cache.occupied(), 0);
        assert!(cache.list().is_empty());
    }

    #[test]
    fn releasing_unknown_path_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let mut cache = VolumeCache::new(1);
        cache.release(&dir.path().join("never-loaded"));
        cache.release_handle(VolumeHandle(0));
        assert_eq!(cache.occupied(), 0);
    }
}
