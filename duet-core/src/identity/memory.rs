// SPDX-FileCopyrightText: 2026 Duet Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-memory identity directory.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{validate_handle, DirectoryError, Identity, IdentityDirectory, IdentityId};

#[derive(Default)]
struct Entries {
    by_handle: HashMap<String, Identity>,
    by_id: HashMap<IdentityId, Identity>,
}

/// Directory backed by a process-local map. Contents do not survive restarts.
#[derive(Default)]
pub struct MemoryIdentityDirectory {
    entries: RwLock<Entries>,
}

impl MemoryIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a directory pre-populated with the given handles.
    pub fn with_handles<'a>(
        handles: impl IntoIterator<Item = &'a str>,
    ) -> Result<Self, DirectoryError> {
        let directory = Self::new();
        for handle in handles {
            directory.register(handle)?;
        }
        Ok(directory)
    }

    /// Returns the number of registered identities.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IdentityDirectory for MemoryIdentityDirectory {
    fn resolve(&self, handle: &str) -> Result<Identity, DirectoryError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .by_handle
            .get(handle)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(handle.to_string()))
    }

    fn get(&self, id: &IdentityId) -> Result<Identity, DirectoryError> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(id.to_string()))
    }

    fn register(&self, handle: &str) -> Result<Identity, DirectoryError> {
        validate_handle(handle)?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.by_handle.contains_key(handle) {
            return Err(DirectoryError::AlreadyRegistered(handle.to_string()));
        }

        let identity = Identity::new(IdentityId::generate(), handle);
        entries
            .by_handle
            .insert(handle.to_string(), identity.clone());
        entries.by_id.insert(identity.id().clone(), identity.clone());
        Ok(identity)
    }
}
