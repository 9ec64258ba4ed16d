//! Deduplicated set of interface/virtual IP associations.

use crate::types::VipAssociation;
use indexmap::IndexSet;
use tracing::debug;

/// VIP associations driving the generated notify scripts.
///
/// Insertion order is kept so regenerated scripts are stable.
#[derive(Debug, Clone, Default)]
pub struct VipPairRegistry {
    pairs: IndexSet<VipAssociation>,
}

impl VipPairRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Union with `associations`. Returns whether membership changed.
    pub fn add(&mut self, associations: &[VipAssociation]) -> bool {
        let before = self.pairs.len();
        self.pairs.extend(associations.iter().cloned());
        let added = self.pairs.len() - before;
        debug!(added, total = self.pairs.len(), "Registered VIP associations");
        added > 0
    }

    /// Difference with `associations`. Returns whether membership changed.
    pub fn remove(&mut self, associations: &[VipAssociation]) -> bool {
        let before = self.pairs.len();
        for association in associations {
            self.pairs.shift_remove(association);
        }
        let removed = before - self.pairs.len();
        debug!(removed, total = self.pairs.len(), "Removed VIP associations");
        removed > 0
    }

    pub fn contains(&self, association: &VipAssociation) -> bool {
        self.pairs.contains(association)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VipAssociation> {
        self.pairs.iter()
    }

    /// Snapshot in insertion order
    pub fn to_vec(&self) -> Vec<VipAssociation> {
        self.pairs.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}
