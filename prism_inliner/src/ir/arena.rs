//! Arena storage for tree IR.
//!
//! Nodes, blocks and symbols all live in arenas and are addressed by typed
//! indices. Commoning a sub-expression means two parents holding the same
//! `Id<Node>`, so rewriting one reference never requires aliasing a pointer.
//!
//! Traversals that must not revisit a slot carry an explicit [`BitSet`]
//! keyed by arena index instead of stamping the node itself.

use std::marker::PhantomData;
use std::ops::{Index, IndexMut};

// =============================================================================
// Typed ID
// =============================================================================

/// A type-safe index into an [`Arena<T>`].
///
/// Traits are implemented by hand so that `Id<T>` is `Copy`/`Eq`/`Hash`
/// no matter what `T` implements.
pub struct Id<T> {
    index: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Copy for Id<T> {}

impl<T> Clone for Id<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Id<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for Id<T> {}

impl<T> PartialOrd for Id<T> {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Id<T> {
    #[inline]
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.index.cmp(&other.index)
    }
}

impl<T> std::hash::Hash for Id<T> {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

impl<T> Id<T> {
    /// Create an ID from a raw index.
    #[inline]
    pub const fn new(index: u32) -> Self {
        Id {
            index,
            _marker: PhantomData,
        }
    }

    /// Raw index.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Index as usize, for slice and bit-set access.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.index as usize
    }

    /// Sentinel for "no item".
    pub const INVALID: Self = Id {
        index: u32::MAX,
        _marker: PhantomData,
    };

    /// Check whether this ID refers to an item.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.index != u32::MAX
    }
}

impl<T> std::fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.index)
        } else {
            write!(f, "#INVALID")
        }
    }
}

impl<T> std::fmt::Display for Id<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.index)
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

// =============================================================================
// Arena
// =============================================================================

/// Append-only storage for homogeneous IR items.
///
/// Slots are never freed individually. A node that loses its last
/// reference stays in the arena with a zero reference count.
#[derive(Debug, Clone)]
pub struct Arena<T> {
    items: Vec<T>,
}

impl<T> Arena<T> {
    /// Create an empty arena.
    #[inline]
    pub fn new() -> Self {
        Arena { items: Vec::new() }
    }

    /// Allocate an item and return its ID.
    #[inline]
    pub fn alloc(&mut self, item: T) -> Id<T> {
        let index = self.items.len() as u32;
        self.items.push(item);
        Id::new(index)
    }

    /// Get an item by ID.
    #[inline]
    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.items.get(id.as_usize())
    }

    /// Get an item mutably by ID.
    #[inline]
    pub fn get_mut(&mut self, id: Id<T>) -> Option<&mut T> {
        self.items.get_mut(id.as_usize())
    }

    /// Number of allocated slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check whether nothing has been allocated.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate over all items with their IDs.
    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.items
            .iter()
            .enumerate()
            .map(|(i, item)| (Id::new(i as u32), item))
    }

    /// Iterate over all IDs.
    #[inline]
    pub fn ids(&self) -> impl Iterator<Item = Id<T>> {
        (0..self.items.len() as u32).map(Id::new)
    }

    /// The ID the next allocation will receive.
    #[inline]
    pub fn next_id(&self) -> Id<T> {
        Id::new(self.items.len() as u32)
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<Id<T>> for Arena<T> {
    type Output = T;

    #[inline]
    fn index(&self, id: Id<T>) -> &Self::Output {
        &self.items[id.as_usize()]
    }
}

impl<T> IndexMut<Id<T>> for Arena<T> {
    #[inline]
    fn index_mut(&mut self, id: Id<T>) -> &mut Self::Output {
        &mut self.items[id.as_usize()]
    }
}

// =============================================================================
// Secondary Map
// =============================================================================

/// Side table keyed by arena IDs.
///
/// Used for per-block analysis results (loop membership, always-reached)
/// that belong to one traversal and not to the block itself.
#[derive(Debug, Clone)]
pub struct SecondaryMap<K, V> {
    values: Vec<V>,
    _marker: PhantomData<fn() -> K>,
}

impl<K, V: Default + Clone> SecondaryMap<K, V> {
    /// Create an empty map.
    pub fn new() -> Self {
        SecondaryMap {
            values: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Create a map pre-sized for an arena of `capacity` slots.
    pub fn with_capacity(capacity: usize) -> Self {
        SecondaryMap {
            values: vec![V::default(); capacity],
            _marker: PhantomData,
        }
    }

    /// Get a value by ID.
    pub fn get(&self, id: Id<K>) -> Option<&V> {
        self.values.get(id.as_usize())
    }

    /// Get a value mutably, growing the table if needed.
    pub fn entry(&mut self, id: Id<K>) -> &mut V {
        let idx = id.as_usize();
        if idx >= self.values.len() {
            self.values.resize(idx + 1, V::default());
        }
        &mut self.values[idx]
    }

    /// Set a value by ID.
    pub fn set(&mut self, id: Id<K>, value: V) {
        *self.entry(id) = value;
    }
}

impl<K, V: Default + Clone> Default for SecondaryMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Bit Set
// =============================================================================

/// A compact bit set keyed by arena index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitSet {
    bits: Vec<u64>,
}

impl BitSet {
    /// Create an empty bit set.
    pub fn new() -> Self {
        BitSet { bits: Vec::new() }
    }

    /// Create a bit set with room for `n` bits.
    pub fn with_capacity(n: usize) -> Self {
        BitSet {
            bits: vec![0; n.div_ceil(64)],
        }
    }

    fn ensure_capacity(&mut self, n: usize) {
        let words = n.div_ceil(64);
        if words > self.bits.len() {
            self.bits.resize(words, 0);
        }
    }

    /// Set a bit. Returns `true` if it was previously clear.
    #[inline]
    pub fn insert(&mut self, index: usize) -> bool {
        self.ensure_capacity(index + 1);
        let word = index / 64;
        let mask = 1u64 << (index % 64);
        let fresh = self.bits[word] & mask == 0;
        self.bits[word] |= mask;
        fresh
    }

    /// Clear a bit.
    #[inline]
    pub fn remove(&mut self, index: usize) {
        let word = index / 64;
        if word < self.bits.len() {
            self.bits[word] &= !(1u64 << (index % 64));
        }
    }

    /// Check whether a bit is set.
    #[inline]
    pub fn contains(&self, index: usize) -> bool {
        let word = index / 64;
        word < self.bits.len() && (self.bits[word] & (1u64 << (index % 64))) != 0
    }

    /// Union with another bit set (`self |= other`).
    pub fn union_with(&mut self, other: &BitSet) {
        if other.bits.len() > self.bits.len() {
            self.bits.resize(other.bits.len(), 0);
        }
        for (i, &word) in other.bits.iter().enumerate() {
            self.bits[i] |= word;
        }
    }

    /// Check whether no bit is set.
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.bits.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Iterate over set bit indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits.iter().enumerate().flat_map(|(word_idx, &word)| {
            (0..64).filter_map(move |bit| {
                if (word & (1u64 << bit)) != 0 {
                    Some(word_idx * 64 + bit)
                } else {
                    None
                }
            })
        })
    }
}

impl Default for BitSet {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Slot {
        weight: i32,
    }

    #[test]
    fn test_arena_alloc_and_index() {
        let mut arena: Arena<Slot> = Arena::new();
        let a = arena.alloc(Slot { weight: 10 });
        let b = arena.alloc(Slot { weight: 20 });

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(arena.next_id().index(), 2);

        arena[b].weight = 200;
        assert_eq!(arena[a].weight, 10);
        assert_eq!(arena[b].weight, 200);
        assert!(arena.get(Id::new(7)).is_none());
    }

    #[test]
    fn test_secondary_map_grows_on_entry() {
        let mut arena: Arena<Slot> = Arena::new();
        let a = arena.alloc(Slot { weight: 1 });
        let b = arena.alloc(Slot { weight: 2 });

        let mut flags: SecondaryMap<Slot, bool> = SecondaryMap::new();
        *flags.entry(b) = true;

        assert_eq!(flags.get(a), Some(&false));
        assert_eq!(flags.get(b), Some(&true));
    }

    #[test]
    fn test_bit_set_insert_reports_freshness() {
        let mut set = BitSet::new();
        assert!(set.insert(64));
        assert!(!set.insert(64));
        set.insert(3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![3, 64]);
        set.remove(3);
        assert!(!set.contains(3));
        assert_eq!(set.count(), 1);
    }

    #[test]
    fn test_bit_set_union() {
        let mut a = BitSet::new();
        a.insert(0);
        let mut b = BitSet::new();
        b.insert(130);
        a.union_with(&b);
        assert!(a.contains(0) && a.contains(130));
        assert!(!BitSet::with_capacity(10).contains(5));
        assert!(BitSet::new().is_empty());
    }

    #[test]
    fn test_id_invalid() {
        let id: Id<Slot> = Id::INVALID;
        assert!(!id.is_valid());
        assert!(Id::<Slot>::new(0).is_valid());
        assert_eq!(format!("{:?}", Id::<Slot>::new(4)), "#4");
    }
}
