//! Fixed-capacity open-addressing hash map.
//!
//! Storage is an inline array sized at compile time; no operation allocates
//! and every probe sequence is bounded by the capacity.

/// Keys usable in a [`FixedMap`].
pub trait SlotKey: Copy + Eq {
    fn slot_hash(&self) -> u32;
}

impl SlotKey for i32 {
    #[inline(always)]
    fn slot_hash(&self) -> u32 {
        (*self as u32).wrapping_mul(0x9E37_79B9)
    }
}

impl SlotKey for u32 {
    #[inline(always)]
    fn slot_hash(&self) -> u32 {
        self.wrapping_mul(0x9E37_79B9)
    }
}

/// Returned when an insert finds every slot occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityError;

impl core::fmt::Display for CapacityError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("fixed map is full")
    }
}

#[derive(Clone)]
pub struct FixedMap<K, V, const N: usize> {
    slots: [Option<(K, V)>; N],
    len: usize,
}

impl<K: SlotKey, V: Copy, const N: usize> Default for FixedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SlotKey, V: Copy, const N: usize> FixedMap<K, V, N> {
    pub const fn new() -> Self {
        Self {
            slots: [None; N],
            len: 0,
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    fn home(key: &K) -> usize {
        key.slot_hash() as usize % N
    }

    /// Index of the slot holding `key`, if present.
    fn find(&self, key: &K) -> Option<usize> {
        if N == 0 {
            return None;
        }
        let mut idx = Self::home(key);
        for _ in 0..N {
            match &self.slots[idx] {
                Some((k, _)) if k == key => return Some(idx),
                Some(_) => idx = (idx + 1) % N,
                None => return None,
            }
        }
        None
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let idx = self.find(key)?;
        self.slots[idx].as_ref().map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let idx = self.find(key)?;
        self.slots[idx].as_mut().map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.find(key).is_some()
    }

    /// Inserts or overwrites `key`, returning the previous value.
    pub fn insert(&mut self, key: K, value: V) -> Result<Option<V>, CapacityError> {
        if N == 0 {
            return Err(CapacityError);
        }
        let mut idx = Self::home(&key);
        for _ in 0..N {
            match self.slots[idx] {
                Some((k, ref mut v)) if k == key => {
                    let old = *v;
                    *v = value;
                    return Ok(Some(old));
                }
                Some(_) => idx = (idx + 1) % N,
                None => {
                    self.slots[idx] = Some((key, value));
                    self.len += 1;
                    return Ok(None);
                }
            }
        }
        Err(CapacityError)
    }

    /// Returns the value for `key`, inserting `init()` first when absent.
    /// `None` when the key is absent and either `init` declines or the
    /// map is full.
    pub fn get_or_try_insert_with<F>(&mut self, key: K, init: F) -> Option<&mut V>
    where
        F: FnOnce() -> Option<V>,
    {
        if self.find(&key).is_none() {
            let value = init()?;
            self.insert(key, value).ok()?;
        }
        self.get_mut(&key)
    }

    /// Removes `key`, shifting displaced entries back so later lookups
    /// never hit a stale gap.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let mut hole = self.find(key)?;
        let (_, removed) = self.slots[hole].take()?;
        self.len -= 1;

        let mut idx = (hole + 1) % N;
        for _ in 0..N {
            let Some((k, _)) = &self.slots[idx] else {
                break;
            };
            let home = Self::home(k);
            // Entry may move into the hole only if the hole lies on its
            // probe path from `home` to `idx`.
            let dist_idx = (idx + N - home) % N;
            let dist_hole = (hole + N - home) % N;
            if dist_hole <= dist_idx {
                self.slots[hole] = self.slots[idx].take();
                hole = idx;
            }
            idx = (idx + 1) % N;
        }
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.slots = [None; N];
        self.len = 0;
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.slots
            .iter()
            .filter_map(|slot| slot.as_ref().map(|(k, v)| (k, v)))
    }
}
