//! Multiplicative instruction signatures.
//!
//! Every mnemonic is mapped to a 32-bit "prime" by a positional polynomial
//! hash. Basic blocks multiply their instruction primes into a 64-bit
//! product, functions multiply their block products; because multiplication
//! is commutative the resulting signatures are independent of instruction
//! scheduling and basic-block layout.

/// Fixed polynomial base for the mnemonic hash. 16777619 is prime and fits
/// comfortably in 32 bits.
const PRIME_BASE: u32 = 16_777_619;

/// Computes `base ^ exponent mod 2^32` by square-and-multiply.
///
/// `ipow32(0, 0) == 1` by definition, matching the usual convention for
/// empty products.
pub fn ipow32(mut base: u32, mut exponent: u32) -> u32 {
    let mut result: u32 = 1;
    while exponent != 0 {
        if exponent & 1 != 0 {
            result = result.wrapping_mul(base);
        }
        exponent >>= 1;
        base = base.wrapping_mul(base);
    }
    result
}

/// Maps a mnemonic string to its 32-bit prime.
///
/// The hash is the polynomial accumulator `sum(byte[i] * BASE^i) mod 2^32`.
/// It is position dependent, so mnemonics that are permutations or
/// space-shifted variants of each other hash differently. Collisions between
/// real mnemonics merely degrade match quality and are detected (and logged)
/// by the instruction cache.
pub fn get_prime(mnemonic: &str) -> u32 {
    let mut hash: u32 = 0;
    for (i, byte) in mnemonic.bytes().enumerate() {
        hash = hash.wrapping_add((byte as u32).wrapping_mul(ipow32(PRIME_BASE, i as u32)));
    }
    hash
}
