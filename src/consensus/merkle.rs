// Canonical Merkle root: SHA-256 over the concatenation of the
// lexicographically sorted hex transaction hashes. Sorting makes the root
// independent of arrival order; the coinbase is never part of the input.

use crate::crypto::hash::sha256_hex;

pub fn transactions_merkle_root<S: AsRef<str>>(tx_hashes: &[S]) -> String {
    let mut sorted: Vec<&str> = tx_hashes.iter().map(|h| h.as_ref()).collect();
    sorted.sort_unstable();
    sha256_hex(sorted.concat().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_set_root() {
        let root = transactions_merkle_root::<String>(&[]);
        assert_eq!(
            root,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_order_independent() {
        let a = "aa".repeat(32);
        let b = "bb".repeat(32);
        let c = "cc".repeat(32);
        let forward = transactions_merkle_root(&[a.clone(), b.clone(), c.clone()]);
        let shuffled = transactions_merkle_root(&[c, a, b]);
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_root_matches_manual_concat() {
        let a = "11".repeat(32);
        let b = "00".repeat(32);
        let concat = format!("{}{}", b, a);
        assert_eq!(
            transactions_merkle_root(&[a.clone(), b.clone()]),
            sha256_hex(concat.as_bytes())
        );
    }

    #[test]
    fn test_single_hash() {
        let h = "ab".repeat(32);
        assert_eq!(
            transactions_merkle_root(&[h.clone()]),
            sha256_hex(h.as_bytes())
        );
    }
}
