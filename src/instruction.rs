//! Instructions and the shared mnemonic cache.
//!
//! Instructions store only their address, prime and operand feature bits.
//! The mnemonic string behind a prime lives in the [`InstructionCache`],
//! which is created once per diff run and shared by every flow graph of both
//! binaries. The cache is safe for concurrent insertion: the first writer of
//! a key wins and later writers observe the existing value.

use log::info;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::lcs::compute_lcs_by;
use crate::prime::get_prime;
use crate::Address;

/// A single disassembled instruction, reduced to what matching needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction {
    address: Address,
    prime: u32,
    features: u32,
}

impl Instruction {
    /// Creates an instruction, computing its prime from `mnemonic` and
    /// registering the mnemonic in the shared cache.
    pub fn new(cache: &InstructionCache, address: Address, mnemonic: &str, features: u32) -> Self {
        let prime = get_prime(mnemonic);
        cache.insert(prime, mnemonic);
        Self {
            address,
            prime,
            features,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn prime(&self) -> u32 {
        self.prime
    }

    pub fn features(&self) -> u32 {
        self.features
    }

    /// Looks the mnemonic back up in the cache.
    pub fn mnemonic(&self, cache: &InstructionCache) -> Option<String> {
        cache.mnemonic(self.prime)
    }
}

/// Run-scoped prime → mnemonic mapping.
///
/// Keys are never erased during a run; entries are write-once. Inserting a
/// different non-empty mnemonic under an existing key is a hash collision:
/// it is logged and the original entry is kept.
#[derive(Debug, Default)]
pub struct InstructionCache {
    map: RwLock<FxHashMap<u32, String>>,
}

impl InstructionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `mnemonic` under `prime`. First writer wins.
    pub fn insert(&self, prime: u32, mnemonic: &str) {
        {
            let map = self.map.read();
            if let Some(existing) = map.get(&prime) {
                // Empty mnemonics occur when an exporter omits the strings
                // to save space; those are not collisions.
                if !existing.is_empty() && !mnemonic.is_empty() && existing != mnemonic {
                    info!(
                        "hash collision detected, mnemonics '{existing}' and '{mnemonic}', \
                         hash: {prime}"
                    );
                }
                return;
            }
        }
        let mut map = self.map.write();
        map.entry(prime).or_insert_with(|| mnemonic.to_string());
    }

    pub fn mnemonic(&self, prime: u32) -> Option<String> {
        self.map.read().get(&prime).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

/// Runs the LCS over two instruction slices, comparing by prime. Returns
/// slice-relative index pairs.
pub fn match_instructions(
    primary: &[Instruction],
    secondary: &[Instruction],
) -> Vec<(usize, usize)> {
    compute_lcs_by(primary, secondary, |a, b| a.prime() == b.prime())
}
