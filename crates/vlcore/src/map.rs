//! Open-addressed, linear-probing, tombstone-aware hash map keyed by
//! [`VlStr`]. One implementation backs globals, the native registry, and the
//! constant-string intern pool, as spec'd.

use crate::vlstr::VlStr;

/// The map's sole failure mode: the host allocator refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Oom;

impl std::fmt::Display for Oom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "allocation refused")
    }
}

impl std::error::Error for Oom {}

#[derive(Clone)]
enum Slot<V> {
    Empty,
    Occupied(VlStr, V),
    Tombstone,
}

/// An open-addressed map from interned strings to `V`.
pub struct VlMap<V> {
    slots: Vec<Slot<V>>,
    occupied: usize,
    tombstones: usize,
}

impl<V> Default for VlMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> VlMap<V> {
    const MIN_CAPACITY: usize = 8;
    const LOAD_FACTOR_PCT: usize = 70;

    /// An empty map with capacity 0. The first `put` allocates.
    pub fn new() -> Self {
        VlMap {
            slots: Vec::new(),
            occupied: 0,
            tombstones: 0,
        }
    }

    /// Allocates storage for at least `capacity` slots, rounded up to the
    /// next power of two, minimum 8.
    pub fn with_capacity(capacity: usize) -> Result<Self, Oom> {
        let cap = next_pow2(capacity.max(Self::MIN_CAPACITY));
        let mut m = VlMap {
            slots: Vec::new(),
            occupied: 0,
            tombstones: 0,
        };
        m.alloc(cap)?;
        Ok(m)
    }

    fn alloc(&mut self, capacity: usize) -> Result<(), Oom> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| Oom)?;
        slots.resize_with(capacity, || Slot::Empty);
        self.slots = slots;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    fn mask(&self) -> usize {
        self.slots.len() - 1
    }

    /// Finds either the slot holding `key` (a hit) or the slot that should
    /// receive `key` on insert (the first tombstone seen, else the first
    /// empty slot).
    fn probe(&self, key: &VlStr) -> ProbeResult {
        self.probe_raw(key.hash(), key.as_bytes())
    }

    /// Probes by raw hash and bytes, without requiring the caller to have
    /// allocated a `VlStr` for the query key. This is what lets
    /// `get_by_bytes` do a lookup with "no allocation required", per spec.
    fn probe_raw(&self, hash: u32, bytes: &[u8]) -> ProbeResult {
        if self.slots.is_empty() {
            return ProbeResult::Empty(0);
        }
        let mask = self.mask();
        let mut idx = (hash as usize) & mask;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[idx] {
                Slot::Empty => {
                    return match first_tombstone {
                        Some(t) => ProbeResult::Tombstone(t),
                        None => ProbeResult::Empty(idx),
                    };
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Occupied(k, _) => {
                    if k.hash() == hash && k.as_bytes() == bytes {
                        return ProbeResult::Hit(idx);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Upserts `key -> value`, rehashing first if the load factor bound
    /// would be exceeded.
    pub fn put(&mut self, key: VlStr, value: V) -> Result<(), Oom> {
        if self.slots.is_empty() {
            self.alloc(Self::MIN_CAPACITY)?;
        } else if (self.occupied + self.tombstones + 1) * 100 > self.slots.len() * Self::LOAD_FACTOR_PCT {
            self.rehash(self.slots.len() * 2)?;
        }
        match self.probe(&key) {
            ProbeResult::Hit(idx) => {
                self.slots[idx] = Slot::Occupied(key, value);
            }
            ProbeResult::Tombstone(idx) => {
                self.slots[idx] = Slot::Occupied(key, value);
                self.occupied += 1;
                self.tombstones -= 1;
            }
            ProbeResult::Empty(idx) => {
                self.slots[idx] = Slot::Occupied(key, value);
                self.occupied += 1;
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &VlStr) -> Option<&V> {
        if self.slots.is_empty() {
            return None;
        }
        match self.probe(key) {
            ProbeResult::Hit(idx) => match &self.slots[idx] {
                Slot::Occupied(_, v) => Some(v),
                _ => unreachable!(),
            },
            _ => None,
        }
    }

    /// Looks up by raw bytes without allocating a `VlStr` for the query —
    /// the probe key is built from a hash and a borrowed byte slice only.
    pub fn get_by_bytes(&self, bytes: &[u8]) -> Option<&V> {
        if self.slots.is_empty() {
            return None;
        }
        let hash = crate::vlstr::fnv1a(bytes);
        match self.probe_raw(hash, bytes) {
            ProbeResult::Hit(idx) => match &self.slots[idx] {
                Slot::Occupied(_, v) => Some(v),
                _ => unreachable!(),
            },
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: &VlStr) -> Option<&mut V> {
        if self.slots.is_empty() {
            return None;
        }
        match self.probe(key) {
            ProbeResult::Hit(idx) => match &mut self.slots[idx] {
                Slot::Occupied(_, v) => Some(v),
                _ => unreachable!(),
            },
            _ => None,
        }
    }

    pub fn contains_key(&self, key: &VlStr) -> bool {
        self.get(key).is_some()
    }

    /// Converts an occupied slot to a tombstone. Returns whether a key was
    /// actually removed.
    pub fn del(&mut self, key: &VlStr) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        match self.probe(key) {
            ProbeResult::Hit(idx) => {
                self.slots[idx] = Slot::Tombstone;
                self.occupied -= 1;
                self.tombstones += 1;
                true
            }
            _ => false,
        }
    }

    /// Rehashes into fresh storage of `new_capacity` (rounded up to the next
    /// power of two, minimum 4), dropping tombstones.
    pub fn rehash(&mut self, new_capacity: usize) -> Result<(), Oom> {
        let new_capacity = next_pow2(new_capacity.max(4));
        let old_slots = std::mem::take(&mut self.slots);
        self.alloc(new_capacity)?;
        self.occupied = 0;
        self.tombstones = 0;
        for slot in old_slots {
            if let Slot::Occupied(k, v) = slot {
                // Re-insertion without re-checking the load factor: capacity
                // just grew, so this cannot trigger a nested rehash, per the
                // "put proceeds without re-checking load factor for the same
                // call" tie-break.
                let mask = self.mask();
                let mut idx = (k.hash() as usize) & mask;
                loop {
                    if matches!(self.slots[idx], Slot::Empty) {
                        break;
                    }
                    idx = (idx + 1) & mask;
                }
                self.slots[idx] = Slot::Occupied(k, v);
                self.occupied += 1;
            }
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VlStr, &V)> {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(k, v) => Some((k, v)),
            _ => None,
        })
    }
}

enum ProbeResult {
    Hit(usize),
    Tombstone(usize),
    Empty(usize),
}

fn next_pow2(n: usize) -> usize {
    n.next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(s: &str) -> VlStr {
        VlStr::new(s.as_bytes())
    }

    #[test]
    fn empty_map_get_del() {
        let m: VlMap<i32> = VlMap::new();
        assert_eq!(m.get(&k("x")), None);
        let mut m = m;
        assert!(!m.del(&k("x")));
    }

    #[test]
    fn put_then_get_round_trips() {
        let mut m = VlMap::new();
        m.put(k("a"), 1).unwrap();
        m.put(k("b"), 2).unwrap();
        assert_eq!(m.get(&k("a")), Some(&1));
        assert_eq!(m.get(&k("b")), Some(&2));
        assert_eq!(m.get(&k("c")), None);
    }

    #[test]
    fn put_overwrites_existing_key() {
        let mut m = VlMap::new();
        m.put(k("a"), 1).unwrap();
        m.put(k("a"), 2).unwrap();
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(&k("a")), Some(&2));
    }

    #[test]
    fn del_then_get_signals_absence() {
        let mut m = VlMap::new();
        m.put(k("a"), 1).unwrap();
        assert!(m.del(&k("a")));
        assert_eq!(m.get(&k("a")), None);
        assert!(!m.del(&k("a")));
    }

    #[test]
    fn insert_prefers_earliest_tombstone() {
        let mut m: VlMap<i32> = VlMap::with_capacity(8).unwrap();
        m.put(k("a"), 1).unwrap();
        m.del(&k("a")).then_some(()).unwrap();
        let cap_before = m.capacity();
        m.put(k("z"), 2).unwrap();
        // Re-using the tombstone must not trigger a capacity change.
        assert_eq!(m.capacity(), cap_before);
        assert_eq!(m.get(&k("z")), Some(&2));
    }

    #[test]
    fn load_factor_triggers_rehash() {
        let mut m: VlMap<i32> = VlMap::new();
        for i in 0..6 {
            m.put(k(&format!("key{i}")), i).unwrap();
        }
        // 6 occupied of capacity 8 exceeds 70%, must have doubled by now.
        assert!(m.capacity() >= 16);
        for i in 0..6 {
            assert_eq!(m.get(&k(&format!("key{i}"))), Some(&i));
        }
    }

    #[test]
    fn rehash_drops_tombstones() {
        let mut m: VlMap<i32> = VlMap::new();
        for i in 0..4 {
            m.put(k(&format!("key{i}")), i).unwrap();
        }
        m.del(&k("key0"));
        m.del(&k("key1"));
        let cap = m.capacity();
        m.rehash(cap * 2).unwrap();
        assert_eq!(m.tombstones, 0);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn get_by_bytes_matches_get() {
        let mut m = VlMap::new();
        m.put(k("name"), 7).unwrap();
        assert_eq!(m.get_by_bytes(b"name"), Some(&7));
        assert_eq!(m.get_by_bytes(b"nope"), None);
    }

    #[test]
    fn stress_insert_delete_reinsert() {
        let mut m: VlMap<usize> = VlMap::new();
        for i in 0..10_000 {
            m.put(k(&format!("k{i}")), i).unwrap();
        }
        for i in (0..10_000).step_by(2) {
            assert!(m.del(&k(&format!("k{i}"))));
        }
        for i in 10_000..15_000 {
            m.put(k(&format!("k{i}")), i).unwrap();
        }
        let expected = 5_000 + 5_000;
        assert_eq!(m.len(), expected);
        for i in (0..10_000).step_by(2) {
            assert_eq!(m.get(&k(&format!("k{i}"))), None);
        }
        for i in (1..10_000).step_by(2) {
            assert_eq!(m.get(&k(&format!("k{i}"))), Some(&i));
        }
        for i in 10_000..15_000 {
            assert_eq!(m.get(&k(&format!("k{i}"))), Some(&i));
        }
        assert!(m.capacity().is_power_of_two());
        assert!((m.occupied + m.tombstones) * 100 <= m.capacity() * VlMap::<usize>::LOAD_FACTOR_PCT);
    }
}
