//! In-memory registry of running containers.

use std::collections::BTreeMap;

use crate::types::ContainerRecord;

/// Maps container id to its [`ContainerRecord`].
///
/// Iteration is ordered by id, so two renders of the same registry always
/// visit containers in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerRegistry {
    containers: BTreeMap<String, ContainerRecord>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `record` under `id`, replacing any previous record.
    pub fn upsert(&mut self, id: impl Into<String>, record: ContainerRecord) {
        self.containers.insert(id.into(), record);
    }

    /// Removes `id`, returning its record if it was known.
    pub fn remove(&mut self, id: &str) -> Option<ContainerRecord> {
        self.containers.remove(id)
    }

    pub fn all(&self) -> impl Iterator<Item = (&str, &ContainerRecord)> {
        self.containers.iter().map(|(id, record)| (id.as_str(), record))
    }

    pub fn clear(&mut self) {
        self.containers.clear();
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}
