//! Component A: atom table & fingerprint (spec §4.1).
//!
//! Strings used as identifiers (author, commitid, log text, path, symbol)
//! are interned once and compared thereafter by pointer. Each interned entry
//! also carries a small Bloom-style fingerprint so callers can cheaply rule
//! out "this atom cannot be a member of that set" without touching the
//! genuine membership structure.
//!
//! The original locks a process-wide singleton with "scan unlocked, then
//! lock and re-scan before inserting." Per §9's re-architecture note about
//! global mutable tables, this is an explicit context object
//! ([`AtomTable`]) rather than a `static`; the locking discipline is
//! preserved using a [`std::sync::RwLock`]: lookups take a read lock (many
//! readers run concurrently), insertion takes a write lock and re-checks in
//! case another thread won the race.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Number of independent hash mixes folded into each atom's fingerprint.
const BLOOM_K: usize = 9;
/// Width in bits of the fingerprint word vector (matches `BLOOMSIZE` in the
/// original, a 512-bit vector of 8 x 64-bit words).
const BLOOM_WORDS: usize = 8;
const BLOOM_WIDTH: u32 = 64;
const BLOOM_SIZE: u64 = (BLOOM_WORDS as u64) * (BLOOM_WIDTH as u64);

/// A Bloom-style fingerprint: cheap "definitely not present" filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bloom {
    words: [u64; BLOOM_WORDS],
}

impl Bloom {
    fn from_crc(mut seed: u64) -> Self {
        let mut words = [0u64; BLOOM_WORDS];
        for _ in 0..BLOOM_K {
            seed ^= seed >> 12;
            seed ^= seed << 25;
            seed ^= seed >> 27;
            seed = seed.wrapping_mul(2685821657736338717);
            let bit = seed % BLOOM_SIZE;
            words[(bit / BLOOM_WIDTH as u64) as usize] |= 1u64 << (bit % BLOOM_WIDTH as u64);
        }
        Bloom { words }
    }

    /// True if `other` might be a subset of the set this fingerprint
    /// describes. False means "definitely not."
    pub fn may_contain(&self, other: &Bloom) -> bool {
        self.words.iter().zip(other.words.iter()).all(|(a, b)| (a & b) == *b)
    }

    pub fn union(&mut self, other: &Bloom) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= b;
        }
    }
}

/// An interned string. Equality and hashing are by pointer identity, as
/// required by §3 ("equal path atoms are pointer-equal").
#[derive(Clone)]
pub struct Atom(Arc<AtomEntry>);

struct AtomEntry {
    text: Box<str>,
    bloom: Bloom,
}

impl Atom {
    pub fn as_str(&self) -> &str {
        &self.0.text
    }

    pub fn bloom(&self) -> &Bloom {
        &self.0.bloom
    }
}

impl PartialEq for Atom {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Atom {}

impl std::hash::Hash for Atom {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl std::fmt::Debug for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Atom({:?})", self.as_str())
    }
}

impl std::ops::Deref for Atom {
    type Target = str;
    fn deref(&self) -> &str {
        self.as_str()
    }
}

/// crc32 table, computed once lazily (mirrors `generate_crc32_table` in the
/// original, but without the manual "is slot zero populated" guard).
fn crc32_table() -> &'static [u32; 256] {
    use std::sync::OnceLock;
    static TABLE: OnceLock<[u32; 256]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        for (n, slot) in table.iter_mut().enumerate() {
            let mut c = n as u32;
            for _ in 0..8 {
                c = if c & 1 != 0 { (c >> 1) ^ 0xedb88320 } else { c >> 1 };
            }
            *slot = c;
        }
        table
    })
}

fn crc32(s: &str) -> u32 {
    let table = crc32_table();
    let mut crc: u32 = !0;
    for &byte in s.as_bytes() {
        crc = (crc >> 8) ^ table[((crc ^ byte as u32) & 0xff) as usize];
    }
    !crc
}

/// The interning table itself. One instance lives for the whole run, owned
/// by the [`crate::pipeline::Pipeline`].
#[derive(Default)]
pub struct AtomTable {
    buckets: RwLock<HashMap<Box<str>, Atom>>,
}

impl AtomTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning the canonical handle. Repeated calls with
    /// equal content return pointer-equal atoms.
    pub fn intern(&self, s: &str) -> Atom {
        if let Some(atom) = self.buckets.read().unwrap().get(s) {
            return atom.clone();
        }
        let mut buckets = self.buckets.write().unwrap();
        if let Some(atom) = buckets.get(s) {
            return atom.clone();
        }
        let crc = crc32(s);
        let entry =
            Atom(Arc::new(AtomEntry { text: s.into(), bloom: Bloom::from_crc(crc as u64) }));
        buckets.insert(s.into(), entry.clone());
        entry
    }

    pub fn len(&self) -> usize {
        self.buckets.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_pointer_stable() {
        let table = AtomTable::new();
        let a = table.intern("alice");
        let b = table.intern("alice");
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.0, &b.0));
    }

    #[test]
    fn distinct_strings_are_distinct_atoms() {
        let table = AtomTable::new();
        let a = table.intern("alice");
        let b = table.intern("bob");
        assert_ne!(a, b);
    }

    #[test]
    fn bloom_union_contains_members() {
        let table = AtomTable::new();
        let a = table.intern("src/main.rs");
        let mut set = Bloom::default();
        set.union(a.bloom());
        assert!(set.may_contain(a.bloom()));
    }
}
