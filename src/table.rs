//! §4.4 Hash table (string-keyed).
//!
//! Open-addressed with linear probing, capacity a power of two, load factor
//! capped at 0.75 — a direct port of `tea_table.c`'s `find_entry`/
//! `adjust_capacity`/`tea_table_set`. Used for the string-intern set
//! (`State::strings`), globals, module value tables, and class
//! methods/statics/instance fields — every string-keyed value table named
//! in §3/§4.4.
//!
//! Keys are `GcRef`s naming interned `StrObj`s. Because interning makes
//! equal bytes the same handle (Invariant 2), key comparison never touches
//! the heap — the entry also caches the key's hash so probing and resizing
//! don't need heap access either.

use crate::object::GcRef;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone)]
struct Entry {
    /// `None` means either a never-used slot or a tombstone; distinguished
    /// by `value` the way `tea_table_set`/`tea_table_delete` do (a
    /// tombstone stores `Bool(true)`, an empty slot stores `Null`).
    key: Option<GcRef>,
    hash: u64,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry { key: None, hash: 0, value: Value::Null }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Table {
    entries: Vec<Entry>,
    count: usize,
}

impl Table {
    pub fn new() -> Self {
        Table { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn find_slot(entries: &[Entry], capacity: usize, key: GcRef, hash: u64) -> usize {
        let mask = capacity as u64 - 1;
        let mut index = (hash & mask) as usize;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None if !entry.is_tombstone() => {
                    return tombstone.unwrap_or(index);
                }
                None => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = ((index as u64 + 1) & mask) as usize;
        }
    }

    fn grow(&mut self, new_capacity: usize) {
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut new_count = 0;
        for entry in self.entries.drain(..) {
            if let Some(key) = entry.key {
                let slot = Self::find_slot(&new_entries, new_capacity, key, entry.hash);
                new_entries[slot] = Entry { key: Some(key), hash: entry.hash, value: entry.value };
                new_count += 1;
            }
        }
        self.entries = new_entries;
        self.count = new_count;
    }

    pub fn get(&self, key: GcRef, hash: u64) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let slot = Self::find_slot(&self.entries, self.entries.len(), key, hash);
        self.entries[slot].key.map(|_| self.entries[slot].value)
    }

    pub fn contains(&self, key: GcRef, hash: u64) -> bool {
        self.get(key, hash).is_some()
    }

    /// Find an interned key by raw hash without already holding a
    /// `GcRef` for it — `tea_table_find_string`'s probe, used only by the
    /// string-intern table to check "does this byte sequence already have
    /// a canonical object?" before allocating one.
    pub fn find_interned(&self, hash: u64, mut matches: impl FnMut(GcRef) -> bool) -> Option<GcRef> {
        if self.count == 0 || self.entries.is_empty() {
            return None;
        }
        let mask = self.entries.len() as u64 - 1;
        let mut index = (hash & mask) as usize;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(k) if entry.hash == hash && matches(k) => return Some(k),
                _ => {}
            }
            index = ((index as u64 + 1) & mask) as usize;
        }
    }

    /// Returns `true` if this inserted a brand-new key (mirrors
    /// `tea_table_set`'s return value, used by `OP_SET_GLOBAL`/
    /// `OP_SET_MODULE` to detect "assignment to undefined name").
    pub fn set(&mut self, key: GcRef, hash: u64, value: Value) -> bool {
        if self.count + 1 > (self.entries.len() as f64 * TABLE_MAX_LOAD) as usize {
            let new_capacity = next_capacity(self.entries.len());
            self.grow(new_capacity);
        }
        let slot = Self::find_slot(&self.entries, self.entries.len(), key, hash);
        let entry = &mut self.entries[slot];
        let is_new = entry.key.is_none();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.hash = hash;
        entry.value = value;
        is_new
    }

    pub fn delete(&mut self, key: GcRef, hash: u64) -> bool {
        if self.count == 0 {
            return false;
        }
        let slot = Self::find_slot(&self.entries, self.entries.len(), key, hash);
        if self.entries[slot].key.is_none() {
            return false;
        }
        self.entries[slot] = Entry { key: None, hash: 0, value: Value::Bool(true) };
        true
    }

    pub fn add_all(&mut self, from: &Table) {
        for (key, hash, value) in from.iter() {
            self.set(key, hash, value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (GcRef, u64, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.hash, e.value)))
    }

    /// Delete every entry whose key object is unmarked, *before* the GC
    /// sweep frees those strings (§4.9, `tea_table_remove_white`).
    pub fn remove_white(&mut self, is_marked: impl Fn(GcRef) -> bool) {
        let stale: Vec<(GcRef, u64)> =
            self.entries.iter().filter_map(|e| e.key.filter(|k| !is_marked(*k)).map(|k| (k, e.hash))).collect();
        for (key, hash) in stale {
            self.delete(key, hash);
        }
    }
}

fn next_capacity(current: usize) -> usize {
    if current < 8 { 8 } else { current * 2 }
}
