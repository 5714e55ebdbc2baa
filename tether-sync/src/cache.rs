//! Sorted, identity-unique local cache.
//!
//! Invariants after every operation:
//! - items are sorted ascending under `Ord`,
//! - no two items share an identity.
//!
//! New items go after every item that precedes-or-equals them, so equal
//! items keep their existing relative order.

use crate::item::Identifiable;
use crate::protocol::ChangeKind;

/// Ordered sequence of synchronized items.
#[derive(Debug, Clone)]
pub struct OrderedCache<T> {
    items: Vec<T>,
}

impl<T> Default for OrderedCache<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: Identifiable + Ord> OrderedCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Cache position of the item with identity `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|e| e.id() == Some(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// First index whose item does not precede-or-equal `item`.
    pub fn insertion_index(&self, item: &T) -> usize {
        self.items.partition_point(|e| e <= item)
    }

    /// Insert or replace by identity.
    ///
    /// Returns `Modified` when an item with the same identity was present
    /// (it is re-positioned, since its order key may have changed) and
    /// `Added` otherwise.
    pub fn upsert(&mut self, item: T) -> ChangeKind {
        let existing = item.id().and_then(|id| self.position(id));
        let kind = match existing {
            Some(pos) => {
                self.items.remove(pos);
                ChangeKind::Modified
            }
            None => ChangeKind::Added,
        };
        let index = self.insertion_index(&item);
        self.items.insert(index, item);
        kind
    }

    /// Remove the item with identity `id`. Missing identities are a no-op.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.position(id).map(|pos| self.items.remove(pos))
    }

    /// Apply one remote change. Returns the effective kind, or `None` when
    /// the change had no effect (removal of an absent identity).
    pub fn apply(&mut self, kind: ChangeKind, item: T) -> Option<ChangeKind> {
        match kind {
            ChangeKind::Added | ChangeKind::Modified => Some(self.upsert(item)),
            ChangeKind::Removed => item
                .id()
                .and_then(|id| self.remove(id))
                .map(|_| ChangeKind::Removed),
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Whether the cache invariants hold.
    pub fn is_consistent(&self) -> bool {
        let sorted = self.items.windows(2).all(|w| w[0] <= w[1]);
        let mut ids: Vec<&str> = self.items.iter().filter_map(|e| e.id()).collect();
        let total = ids.len();
        ids.sort_unstable();
        ids.dedup();
        sorted && ids.len() == total
    }
}

impl<'a, T> IntoIterator for &'a OrderedCache<T> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
