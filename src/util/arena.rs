//! Generation-stamped slot arena for the operation pool.
//!
//! Operation storage is pooled and reused: a logical operation reference is
//! a (slot id, generation) pair rather than a bare pointer, so a reference
//! held past an operation's reclamation resolves as stale instead of
//! observing whatever now occupies the slot.
//!
//! # Design
//!
//! - Slots live in a `Vec`; vacant slots form an intrusive free list
//! - Each slot carries a generation counter bumped on removal
//! - Lookups validate the generation and return `None` for stale indices

use core::fmt;
use core::hash::{Hash, Hasher};

/// An index into an arena, qualified by the slot generation at which the
/// referenced value was inserted.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArenaIndex {
    slot: u32,
    generation: u32,
}

impl ArenaIndex {
    /// Creates an arena index from raw parts (primarily for testing).
    #[must_use]
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Returns the raw slot number.
    #[must_use]
    pub const fn slot(self) -> u32 {
        self.slot
    }

    /// Returns the generation stamp.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for ArenaIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaIndex({}:{})", self.slot, self.generation)
    }
}

impl Hash for ArenaIndex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64((u64::from(self.slot) << 32) | u64::from(self.generation));
    }
}

enum Slot<T> {
    Occupied { value: T, generation: u32 },
    Vacant { next_free: Option<u32>, generation: u32 },
}

/// A slot arena with generation-validated indices.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<u32>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    /// Creates a new empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            len: 0,
        }
    }

    /// Returns the number of occupied slots.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the arena has no occupied slots.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Inserts a value, reusing a vacant slot if one exists.
    pub fn insert(&mut self, value: T) -> ArenaIndex {
        self.len += 1;
        if let Some(free) = self.free_head {
            let slot = &mut self.slots[free as usize];
            match slot {
                Slot::Vacant {
                    next_free,
                    generation,
                } => {
                    let generation = *generation;
                    self.free_head = *next_free;
                    *slot = Slot::Occupied { value, generation };
                    ArenaIndex {
                        slot: free,
                        generation,
                    }
                }
                Slot::Occupied { .. } => unreachable!("free list pointed to occupied slot"),
            }
        } else {
            let slot = u32::try_from(self.slots.len()).expect("arena overflow");
            self.slots.push(Slot::Occupied {
                value,
                generation: 0,
            });
            ArenaIndex {
                slot,
                generation: 0,
            }
        }
    }

    /// Removes the value at the given index, bumping the slot generation so
    /// outstanding copies of the index become stale.
    pub fn remove(&mut self, index: ArenaIndex) -> Option<T> {
        let slot = self.slots.get_mut(index.slot as usize)?;
        match slot {
            Slot::Occupied { generation, .. } if *generation == index.generation => {
                let next_generation = generation.wrapping_add(1);
                let old = core::mem::replace(
                    slot,
                    Slot::Vacant {
                        next_free: self.free_head,
                        generation: next_generation,
                    },
                );
                self.free_head = Some(index.slot);
                self.len -= 1;
                match old {
                    Slot::Occupied { value, .. } => Some(value),
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => None,
        }
    }

    /// Returns the value at the given index, or `None` if the index is stale.
    #[must_use]
    pub fn get(&self, index: ArenaIndex) -> Option<&T> {
        match self.slots.get(index.slot as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Returns a mutable reference, or `None` if the index is stale.
    pub fn get_mut(&mut self, index: ArenaIndex) -> Option<&mut T> {
        match self.slots.get_mut(index.slot as usize)? {
            Slot::Occupied { value, generation } if *generation == index.generation => Some(value),
            _ => None,
        }
    }

    /// Returns true if the index refers to a live value.
    #[must_use]
    pub fn contains(&self, index: ArenaIndex) -> bool {
        self.get(index).is_some()
    }

    /// Iterates over all occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (ArenaIndex, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| match slot {
                Slot::Occupied { value, generation } => Some((
                    ArenaIndex {
                        slot: u32::try_from(i).expect("arena overflow"),
                        generation: *generation,
                    },
                    value,
                )),
                Slot::Vacant { .. } => None,
            })
    }
}

impl<T: fmt::Debug> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}
