// Cryptographic Hashing Wrappers
use sha2::{Digest, Sha256};

/// SHA-256: block hashes, transaction hashes, node identity digests
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// SHA-256 rendered as a lowercase 64-char hex digest
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_length() {
        let hash = sha256(b"denaro");
        assert_eq!(hash.len(), 32);
    }

    #[test]
    fn test_empty_digest() {
        // SHA-256 of the empty string, used as the Merkle root of an empty block
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
