//! An arena of entries, indexed by the state each entry is in.
//!
//! Every entry lives in exactly one bucket: the one matching its state.
//! Moving an entry between buckets, looking up the first entry of a bucket,
//! and counting a bucket are all O(1).

use std::fmt::Debug;

/// A finite set of states which entries may occupy.
pub(crate) trait State: Copy + Eq + Debug {
    /// The number of distinct states.
    const COUNT: usize;

    /// A dense index in `0..Self::COUNT`.
    fn index(self) -> usize;
}

/// A hook invoked on an entry whenever it changes state.
pub(crate) trait Transition<S> {
    fn on_transition(&mut self, _from: S, _to: S) {}
}

/// Refers to one entry of a [Buckets] arena.
///
/// Keys are never reused: removing an entry invalidates its key, even if
/// the slot it occupied is later filled by a different entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Key {
    index: u32,
    generation: u32,
}

/// What a [Buckets::foreach] visitor wants done with the visited entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Visit<S> {
    /// Leave the entry alone and keep going.
    Next,
    /// Move the entry into another state and keep going.
    Set(S),
    /// Leave the entry alone and end the scan.
    Stop,
}

struct Occupied<S, T> {
    state: S,
    // Position of this entry within the bucket for "state"
    position: usize,
    value: T,
}

struct Slot<S, T> {
    generation: u32,
    entry: Option<Occupied<S, T>>,
}

pub(crate) struct Buckets<S, T> {
    slots: Vec<Slot<S, T>>,
    free: Vec<u32>,
    buckets: Vec<Vec<Key>>,
}

impl<S: State, T: Transition<S>> Default for Buckets<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: State, T: Transition<S>> Buckets<S, T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            buckets: (0..S::COUNT).map(|_| Vec::new()).collect(),
        }
    }

    fn occupied(&self, key: Key) -> Option<&Occupied<S, T>> {
        let slot = self.slots.get(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn occupied_mut(&mut self, key: Key) -> Option<&mut Occupied<S, T>> {
        let slot = self.slots.get_mut(key.index as usize)?;
        if slot.generation != key.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    // Removes "key" from the bucket it sits in.
    fn unlink(&mut self, key: Key, state: S, position: usize) {
        let bucket = &mut self.buckets[state.index()];
        let removed = bucket.swap_remove(position);
        debug_assert_eq!(removed, key);
        if let Some(moved) = bucket.get(position).copied() {
            if let Some(entry) = self.occupied_mut(moved) {
                entry.position = position;
            }
        }
    }

    // Appends "key" to the bucket for "state", returning its position.
    fn link(&mut self, key: Key, state: S) -> usize {
        let bucket = &mut self.buckets[state.index()];
        bucket.push(key);
        bucket.len() - 1
    }

    /// Adds a new entry in the given state.
    pub(crate) fn insert(&mut self, value: T, state: S) -> Key {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let key = Key {
            index,
            generation: self.slots[index as usize].generation,
        };
        let position = self.link(key, state);
        self.slots[index as usize].entry = Some(Occupied {
            state,
            position,
            value,
        });
        key
    }

    /// Removes an entry, returning it if it existed.
    pub(crate) fn remove(&mut self, key: Key) -> Option<T> {
        let occupied = self.occupied(key)?;
        let (state, position) = (occupied.state, occupied.position);
        self.unlink(key, state, position);

        let slot = &mut self.slots[key.index as usize];
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(key.index);
        Some(entry.value)
    }

    pub(crate) fn get(&self, key: Key) -> Option<&T> {
        self.occupied(key).map(|entry| &entry.value)
    }

    pub(crate) fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        self.occupied_mut(key).map(|entry| &mut entry.value)
    }

    pub(crate) fn state(&self, key: Key) -> Option<S> {
        self.occupied(key).map(|entry| entry.state)
    }

    /// Moves an entry into a new state.
    ///
    /// Returns false if the entry does not exist. Setting an entry to the
    /// state it is already in does nothing.
    pub(crate) fn set(&mut self, key: Key, state: S) -> bool {
        let Some(occupied) = self.occupied(key) else {
            return false;
        };
        let (from, position) = (occupied.state, occupied.position);
        if from == state {
            return true;
        }
        self.unlink(key, from, position);
        let position = self.link(key, state);
        if let Some(entry) = self.occupied_mut(key) {
            entry.state = state;
            entry.position = position;
            entry.value.on_transition(from, state);
        }
        true
    }

    /// The oldest entry in a state, if any.
    pub(crate) fn next(&self, state: S) -> Option<Key> {
        self.buckets[state.index()].first().copied()
    }

    pub(crate) fn count(&self, state: S) -> usize {
        self.buckets[state.index()].len()
    }

    pub(crate) fn total(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.len()).sum()
    }

    /// A snapshot of the keys currently in a state.
    pub(crate) fn keys(&self, state: S) -> Vec<Key> {
        self.buckets[state.index()].clone()
    }

    /// Visits every entry in a state.
    ///
    /// Entries moved into a different state by the visitor are not visited
    /// again, even if they are moved into the state being scanned.
    pub(crate) fn foreach<F>(&mut self, state: S, mut visitor: F)
    where
        F: FnMut(Key, &mut T) -> Visit<S>,
    {
        for key in self.keys(state) {
            let Some(entry) = self.get_mut(key) else {
                continue;
            };
            match visitor(key, entry) {
                Visit::Next => (),
                Visit::Set(to) => {
                    self.set(key, to);
                }
                Visit::Stop => return,
            }
        }
    }

    /// Finds the first entry in a state which satisfies a predicate.
    pub(crate) fn find<F>(&self, state: S, mut pred: F) -> Option<Key>
    where
        F: FnMut(&T) -> bool,
    {
        self.buckets[state.index()]
            .iter()
            .copied()
            .find(|key| self.get(*key).is_some_and(&mut pred))
    }

    /// Iterates over every entry, in no particular order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (Key, S, &T)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let entry = slot.entry.as_ref()?;
            let key = Key {
                index: index as u32,
                generation: slot.generation,
            };
            Some((key, entry.state, &entry.value))
        })
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        let mut seen = 0;
        for (state_index, bucket) in self.buckets.iter().enumerate() {
            for (position, key) in bucket.iter().enumerate() {
                let entry = self.occupied(*key).expect("Bucket refers to a missing entry");
                assert_eq!(entry.state.index(), state_index, "Entry in wrong bucket");
                assert_eq!(entry.position, position, "Entry has stale position");
                seen += 1;
            }
        }
        let occupied = self.slots.iter().filter(|s| s.entry.is_some()).count();
        assert_eq!(seen, occupied, "Every entry must be in exactly one bucket");
    }
}
