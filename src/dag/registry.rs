// src/dag/registry.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard};

use crate::errors::{ExpctlError, Result};
use crate::resource::ResourceManager;
use crate::types::Guid;

/// Hands out unique guids, honouring explicitly requested ones.
#[derive(Debug, Default)]
pub struct GuidGenerator {
    assigned: BTreeSet<Guid>,
    next: Guid,
}

impl GuidGenerator {
    /// Assign `requested`, or the smallest free guid above every guid
    /// assigned so far.
    pub fn next(&mut self, requested: Option<Guid>) -> Result<Guid> {
        let guid = match requested {
            Some(guid) if self.assigned.contains(&guid) => {
                return Err(ExpctlError::DuplicateGuid(guid));
            }
            Some(guid) => guid,
            None => {
                let mut guid = self.next.max(1);
                while self.assigned.contains(&guid) {
                    guid += 1;
                }
                guid
            }
        };

        self.assigned.insert(guid);
        self.next = self.next.max(guid + 1);
        Ok(guid)
    }
}

/// Guid -> resource map of one experiment.
///
/// Readers (pool workers, drivers) share the map; only the controller
/// inserts.
#[derive(Default)]
pub struct Registry {
    resources: RwLock<BTreeMap<Guid, Arc<dyn ResourceManager>>>,
    guids: Mutex<GuidGenerator>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, guid: Guid) -> Option<Arc<dyn ResourceManager>> {
        self.read().get(&guid).cloned()
    }

    pub fn try_get(&self, guid: Guid) -> Result<Arc<dyn ResourceManager>> {
        self.get(guid).ok_or(ExpctlError::UnknownResource(guid))
    }

    pub fn contains(&self, guid: Guid) -> bool {
        self.read().contains_key(&guid)
    }

    /// Registered guids in ascending order.
    pub fn guids(&self) -> Vec<Guid> {
        self.read().keys().copied().collect()
    }

    pub fn all(&self) -> Vec<Arc<dyn ResourceManager>> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn allocate(&self, requested: Option<Guid>) -> Result<Guid> {
        self.guids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next(requested)
    }

    pub(crate) fn insert(&self, rm: Arc<dyn ResourceManager>) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(rm.guid(), rm);
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<Guid, Arc<dyn ResourceManager>>> {
        self.resources.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("guids", &self.guids())
            .finish()
    }
}
