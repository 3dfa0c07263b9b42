//! §4.3 String interning.
//!
//! `intern` is the single gate every string-producing operation passes
//! through — literals, identifier constants, concatenation, repetition,
//! formatted strings, and buffer-ownership transfers all call this so that
//! Invariant 2 (string equality ⇔ pointer equality) holds everywhere.
//!
//! The cached hash uses `xxhash-rust`'s XXH64, the hashing crate already in
//! the teacher's dependency stack (`angelscript-compiler` hashes symbol
//! names with it) — a drop-in stand-in for spec.md's "FNV-1a-style" cache,
//! which spec.md §3 only requires to be *a* cached hash, not a specific
//! algorithm.

use crate::gc::Heap;
use crate::object::{GcRef, Obj, StrObj};
use crate::table::Table;
use crate::value::Value;
use xxhash_rust::xxh64::xxh64;

pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxh64(bytes, 0)
}

/// Return the canonical `StrObj` for `bytes`, allocating and interning a
/// new one only if an equal string isn't already present.
pub fn intern(heap: &mut Heap, table: &mut Table, bytes: &[u8]) -> GcRef {
    let hash = hash_bytes(bytes);
    if let Some(existing) = table.find_interned(hash, |candidate| match heap.get(candidate) {
        Obj::Str(s) => s.bytes.as_ref() == bytes,
        _ => false,
    }) {
        return existing;
    }
    let r = heap.insert(Obj::Str(StrObj { bytes: bytes.into(), hash }));
    table.set(r, hash, Value::Bool(true));
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::GcConfig;

    #[test]
    fn equal_bytes_intern_to_the_same_handle() {
        let mut heap = Heap::new(GcConfig::default());
        let mut table = Table::new();
        let a = intern(&mut heap, &mut table, b"hello");
        let b = intern(&mut heap, &mut table, b"hello");
        assert_eq!(a, b);
        let c = intern(&mut heap, &mut table, b"world");
        assert_ne!(a, c);
    }
}
