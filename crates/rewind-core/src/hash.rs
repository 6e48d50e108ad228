//! FNV-1a hashing for stable identifiers and schema checksums.
//!
//! FNV-1a is fast, has no dependencies, and produces the same output on
//! every platform and every run, which is all that stream-stable ids need.

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x00000100000001B3;

/// 64-bit FNV-1a over a byte slice.
pub fn fnv1a(bytes: &[u8]) -> u64 {
    fnv1a_extend(FNV_OFFSET, bytes)
}

/// Continue an FNV-1a hash from a previous state.
pub fn fnv1a_extend(mut hash: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// FNV-1a folded to 32 bits (high half XOR low half).
pub fn fnv1a_u32(bytes: &[u8]) -> u32 {
    let h = fnv1a(bytes);
    ((h >> 32) ^ h) as u32
}
