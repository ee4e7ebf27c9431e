use crate::{error::RegistryError, sync::RwLock, threading::ThreadHandle};
use std::{collections::HashMap, thread::ThreadId};

#[derive(Debug, Default)]
struct Maps {
    by_native: HashMap<ThreadId, ThreadHandle>,
    by_logical: HashMap<ThreadHandle, ThreadId>,
}

/// Bidirectional map between host threads and the guest threads they run.
///
/// Both directions live under a single lock so a lookup never observes one
/// half of a registration.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    maps: RwLock<Maps>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, native: ThreadId, logical: ThreadHandle) -> Result<(), RegistryError> {
        let mut maps = self.maps.write();
        if let Some(&existing) = maps.by_native.get(&native) {
            return Err(RegistryError::AlreadyRegistered { native, existing });
        }
        // A guest thread moving to a new host thread drops its old mapping
        if let Some(old_native) = maps.by_logical.insert(logical, native) {
            maps.by_native.remove(&old_native);
        }
        maps.by_native.insert(native, logical);
        Ok(())
    }

    /// Removes `logical` and its host mapping. Returns the host thread it was
    /// mapped to, or `None` if it was not registered.
    pub fn unregister(&self, logical: ThreadHandle) -> Option<ThreadId> {
        let mut maps = self.maps.write();
        let native = maps.by_logical.remove(&logical)?;
        maps.by_native.remove(&native);
        Some(native)
    }

    pub fn lookup(&self, native: ThreadId) -> Option<ThreadHandle> {
        self.maps.read().by_native.get(&native).copied()
    }

    pub fn lookup_host(&self, logical: ThreadHandle) -> Option<ThreadId> {
        self.maps.read().by_logical.get(&logical).copied()
    }

    /// Like [`lookup_host`](Self::lookup_host), as an explicit result.
    pub fn require_host(&self, logical: ThreadHandle) -> Result<ThreadId, RegistryError> {
        self.lookup_host(logical)
            .ok_or(RegistryError::NotRegistered(logical))
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_logical.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All current registrations, in no particular order.
    pub fn snapshot(&self) -> Vec<(ThreadHandle, ThreadId)> {
        self.maps
            .read()
            .by_logical
            .iter()
            .map(|(&logical, &native)| (logical, native))
            .collect()
    }
}
