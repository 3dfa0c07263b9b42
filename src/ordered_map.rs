//! §4.5 Ordered map (general key).
//!
//! Same open-addressing/power-of-two/load-factor discipline as the
//! string-keyed `Table`, but keys are arbitrary hashable values (null,
//! bool, number, string, range) and a slot carries an `empty` flag instead
//! of relying on a sentinel key — `Value::Null` is itself a legal key, so
//! "no key" can't be represented by the key field the way `Table` uses
//! `None`. Backs the `Map` heap object and `enum` instances (§3, §4.10
//! `OP_ENUM`).
//!
//! Hashing and equality need to dereference `Object(GcRef)` values (a
//! string compares by identity, a range by field values), so every lookup
//! takes a `&Heap` to resolve those handles.

use crate::gc::Heap;
use crate::value::Value;

const MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone)]
struct Slot {
    key: Value,
    value: Value,
    hash: u64,
    empty: bool,
    /// Monotonic insertion counter, used only to make iteration order
    /// stable for display and for `enum` bodies — the open-addressed
    /// layout itself has no intrinsic order.
    seq: u64,
}

impl Slot {
    fn empty() -> Self {
        Slot { key: Value::Null, value: Value::Null, hash: 0, empty: true, seq: 0 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderedMap {
    slots: Vec<Slot>,
    count: usize,
    next_seq: u64,
}

impl OrderedMap {
    pub fn new() -> Self {
        OrderedMap::default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn find_slot(slots: &[Slot], capacity: usize, heap: &Heap, key: Value, hash: u64) -> usize {
        let mask = capacity as u64 - 1;
        let mut index = (hash & mask) as usize;
        let mut first_tombstone: Option<usize> = None;
        loop {
            let slot = &slots[index];
            if slot.empty {
                if slot.hash == u64::MAX {
                    // tombstone marker (see delete())
                    if first_tombstone.is_none() {
                        first_tombstone = Some(index);
                    }
                } else {
                    return first_tombstone.unwrap_or(index);
                }
            } else if slot.hash == hash && heap.values_equal(slot.key, key) {
                return index;
            }
            index = ((index as u64 + 1) & mask) as usize;
        }
    }

    fn grow(&mut self, heap: &Heap, new_capacity: usize) {
        let mut new_slots: Vec<Slot> = (0..new_capacity).map(|_| Slot::empty()).collect();
        for slot in self.slots.drain(..) {
            if !slot.empty {
                let idx = Self::find_slot(&new_slots, new_capacity, heap, slot.key, slot.hash);
                new_slots[idx] = slot;
            }
        }
        self.slots = new_slots;
    }

    pub fn get(&self, heap: &Heap, key: Value) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let hash = heap.hash_value(key);
        let idx = Self::find_slot(&self.slots, self.slots.len(), heap, key, hash);
        let slot = &self.slots[idx];
        if slot.empty { None } else { Some(slot.value) }
    }

    pub fn contains(&self, heap: &Heap, key: Value) -> bool {
        self.get(heap, key).is_some()
    }

    pub fn set(&mut self, heap: &Heap, key: Value, value: Value) -> bool {
        if self.count + 1 > (self.slots.len() as f64 * MAX_LOAD) as usize {
            let new_capacity = if self.slots.len() < 8 { 8 } else { self.slots.len() * 2 };
            self.grow(heap, new_capacity);
        }
        let hash = heap.hash_value(key);
        let idx = Self::find_slot(&self.slots, self.slots.len(), heap, key, hash);
        let is_new = self.slots[idx].empty;
        if is_new {
            self.count += 1;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.slots[idx] = Slot { key, value, hash, empty: false, seq };
        is_new
    }

    pub fn delete(&mut self, heap: &Heap, key: Value) -> bool {
        if self.count == 0 {
            return false;
        }
        let hash = heap.hash_value(key);
        let idx = Self::find_slot(&self.slots, self.slots.len(), heap, key, hash);
        if self.slots[idx].empty {
            return false;
        }
        self.slots[idx] = Slot { key: Value::Null, value: Value::Null, hash: u64::MAX, empty: true, seq: 0 };
        self.count -= 1;
        true
    }

    /// Iterate entries in insertion order — used for stringification and
    /// for giving `enum` members stable auto-increment ordering.
    pub fn iter_in_order(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        let mut ordered: Vec<&Slot> = self.slots.iter().filter(|s| !s.empty).collect();
        ordered.sort_by_key(|s| s.seq);
        ordered.into_iter().map(|s| (s.key, s.value))
    }

    /// Right-biased union (`+`): entries in `other` overwrite `self`.
    pub fn union(&self, heap: &Heap, other: &OrderedMap) -> OrderedMap {
        let mut result = self.clone();
        for (k, v) in other.iter_in_order() {
            result.set(heap, k, v);
        }
        result
    }

    pub fn keys(&self) -> Vec<Value> {
        self.iter_in_order().map(|(k, _)| k).collect()
    }

    pub fn all_refs(&self) -> impl Iterator<Item = Value> + '_ {
        self.slots.iter().filter(|s| !s.empty).flat_map(|s| [s.key, s.value])
    }
}
