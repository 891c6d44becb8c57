use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use super::item::ResourceKey;

/// Idle items ordered by their last validation time.
#[derive(Debug, Default)]
pub(crate) struct IdleQueue {
    order: BTreeSet<(DateTime<Utc>, ResourceKey)>,
    index: HashMap<ResourceKey, DateTime<Utc>>,
}

impl IdleQueue {
    pub(crate) fn push(&mut self, key: ResourceKey, validated: DateTime<Utc>) {
        self.remove(&key);
        self.index.insert(key.clone(), validated);
        self.order.insert((validated, key));
    }

    pub(crate) fn remove(&mut self, key: &ResourceKey) -> bool {
        match self.index.remove(key) {
            Some(validated) => self.order.remove(&(validated, key.clone())),
            None => false,
        }
    }

    pub(crate) fn contains(&self, key: &ResourceKey) -> bool {
        self.index.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn oldest_first(&self) -> impl Iterator<Item = &ResourceKey> {
        self.order.iter().map(|(_, key)| key)
    }

    pub(crate) fn newest_first(&self) -> impl Iterator<Item = &ResourceKey> {
        self.order.iter().rev().map(|(_, key)| key)
    }
}
