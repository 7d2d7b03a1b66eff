//! Session-Code Allocation
//!
//! Hands out short, human-typable session codes (uppercase letters and
//! digits) that are guaranteed unique among live sessions. Memory is bounded
//! by the number of codes currently issued, not by the size of the code
//! space.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;

/// Characters a session code is built from.
pub const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// How many permutations to materialize per batch when the random draw
/// collides and we fall back to enumeration.
const ENUMERATION_BATCH: u64 = 1000;

/// Allocator for collision-free session codes.
///
/// Codes are distinct-character permutations over [`CODE_ALPHABET`], grouped
/// by length. Allocation picks the smallest length that still has free codes,
/// tries one random candidate (the expected O(1) path), and only on collision
/// enumerates permutations of that length in bounded batches until an unused
/// one turns up.
///
/// # Example
///
/// ```
/// use rendezvous::codes::CodeAllocator;
///
/// let mut codes = CodeAllocator::new();
/// let code = codes.allocate();
/// assert_eq!(code.len(), 1); // nothing issued yet, shortest length wins
/// codes.release(&code);
/// ```
#[derive(Debug, Default)]
pub struct CodeAllocator {
    /// Issued codes, grouped by code length.
    issued: HashMap<usize, HashSet<String>>,
}

impl CodeAllocator {
    /// Create an empty allocator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a code that no other live session holds.
    pub fn allocate(&mut self) -> String {
        let mut length = 1;
        while self.is_full_for(length) {
            length += 1;
        }

        let mut rng = rand::thread_rng();

        // Random draw first: permutation enumeration is costly and almost
        // never needed while the length class is sparsely used.
        let candidate = random_permutation(&mut rng, length);
        let class = self.issued.entry(length).or_default();
        if class.insert(candidate.clone()) {
            return candidate;
        }

        // Collision: walk the permutation space of this length in batches,
        // skipping everything already issued. The class is not full, so some
        // batch must contain a free code.
        let total = permutation_count(CODE_ALPHABET.len(), length);
        let mut start = 0u64;
        loop {
            let end = (start + ENUMERATION_BATCH).min(total);
            let free: Vec<String> = (start..end)
                .map(|index| nth_permutation(index, length))
                .filter(|code| !class.contains(code))
                .collect();
            if let Some(code) = free.choose(&mut rng) {
                class.insert(code.clone());
                return code.clone();
            }
            start = end;
            debug_assert!(start < total, "length class was full despite fullness check");
        }
    }

    /// Return a code to the pool. Unknown codes are ignored.
    pub fn release(&mut self, code: &str) {
        if let Some(class) = self.issued.get_mut(&code.len()) {
            class.remove(code);
            if class.is_empty() {
                self.issued.remove(&code.len());
            }
        }
    }

    /// Number of codes currently issued across all lengths.
    pub fn live(&self) -> usize {
        self.issued.values().map(HashSet::len).sum()
    }

    fn is_full_for(&self, length: usize) -> bool {
        match self.issued.get(&length) {
            None => false,
            Some(class) => class.len() as u64 >= permutation_count(CODE_ALPHABET.len(), length),
        }
    }
}

/// Number of `length`-permutations of an `alphabet_len`-character alphabet.
fn permutation_count(alphabet_len: usize, length: usize) -> u64 {
    if length > alphabet_len {
        return 0;
    }
    ((alphabet_len - length + 1)..=alphabet_len).fold(1u64, |acc, n| acc * n as u64)
}

/// One random distinct-character code of the given length.
fn random_permutation(rng: &mut impl Rng, length: usize) -> String {
    CODE_ALPHABET
        .choose_multiple(rng, length)
        .map(|&b| b as char)
        .collect()
}

/// The `index`-th `length`-permutation of the alphabet, counting in the order
/// a lexicographic enumeration over the alphabet would produce them.
fn nth_permutation(index: u64, length: usize) -> String {
    let mut pool: Vec<u8> = CODE_ALPHABET.to_vec();
    let mut code = String::with_capacity(length);
    let mut rest = index;
    for position in 0..length {
        let per_choice = permutation_count(pool.len() - 1, length - position - 1);
        let choice = (rest / per_choice) as usize;
        rest %= per_choice;
        code.push(pool.remove(choice) as char);
    }
    code
}
