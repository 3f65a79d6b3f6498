//! Bloom filter over object identities a trace relies on.
//!
//! Membership queries never miss an added object. False positives cause spurious invalidation.

use kestrel_types::{object_addr, ObjRef};

const WORDS: usize = 8;
const HASHES: usize = 6;
const WORD_BITS: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct DependencySet {
    bits: [u32; WORDS],
}

/// FNV-1a over the address bytes; each output byte selects one of the 256 filter bits.
fn address_hash(addr: usize) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in (addr as u64).to_le_bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

impl DependencySet {
    pub const fn new() -> Self {
        Self { bits: [0; WORDS] }
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }

    pub fn add(&mut self, obj: &ObjRef) {
        self.add_addr(object_addr(obj));
    }

    pub fn add_addr(&mut self, addr: usize) {
        let hash = address_hash(addr);
        for i in 0..HASHES {
            let bit = ((hash >> (8 * i)) & 0xFF) as usize;
            self.bits[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
        }
    }

    pub fn may_contain(&self, obj: &ObjRef) -> bool {
        self.may_contain_addr(object_addr(obj))
    }

    pub fn may_contain_addr(&self, addr: usize) -> bool {
        let hash = address_hash(addr);
        (0..HASHES).all(|i| {
            let bit = ((hash >> (8 * i)) & 0xFF) as usize;
            self.bits[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
        })
    }

    pub fn union_with(&mut self, other: &DependencySet) {
        for (dst, src) in self.bits.iter_mut().zip(other.bits) {
            *dst |= src;
        }
    }

    pub fn clear(&mut self) {
        self.bits = [0; WORDS];
    }

    pub fn bits_set(&self) -> u32 {
        self.bits.iter().map(|w| w.count_ones()).sum()
    }
}
