// Cryptographic Hashing Wrappers
//
// The canonical block payload is ASCII:
//   index || timestamp || data || previous_hash || nonce
// with integers rendered base-10, no padding. Both the pool validator and
// every miner back-end (CPU and GPU) must hash exactly these bytes, so the
// payload builder lives here next to the digest.
use sha2::{Digest, Sha256};

/// SHA-256 of arbitrary bytes as lowercase hex (64 chars).
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical hashing payload for a block or a (template, nonce) pair.
pub fn block_payload(
    index: u64,
    timestamp: i64,
    data: &str,
    previous_hash: &str,
    nonce: i64,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(data.len() + previous_hash.len() + 40);
    buf.extend_from_slice(index.to_string().as_bytes());
    buf.extend_from_slice(timestamp.to_string().as_bytes());
    buf.extend_from_slice(data.as_bytes());
    buf.extend_from_slice(previous_hash.as_bytes());
    buf.extend_from_slice(nonce.to_string().as_bytes());
    buf
}

/// Hash of the canonical payload.
pub fn block_hash(
    index: u64,
    timestamp: i64,
    data: &str,
    previous_hash: &str,
    nonce: i64,
) -> String {
    sha256_hex(&block_payload(index, timestamp, data, previous_hash, nonce))
}

/// A hash meets difficulty `d` iff its first `d` hex characters are '0'.
/// The comparison is on hex nibbles, never raw bytes: one zero byte is
/// TWO zero nibbles, and GPU kernels must apply the same rule.
pub fn meets_difficulty(hash_hex: &str, difficulty: u8) -> bool {
    let d = difficulty as usize;
    hash_hex.len() >= d && hash_hex.as_bytes()[..d].iter().all(|&b| b == b'0')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_vector() {
        // FIPS 180-2 test vector for "abc"
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_payload_is_ascii_concat() {
        let p = block_payload(7, 1700000000, "Block 7", "ab", -3);
        assert_eq!(p, b"71700000000Block 7ab-3");
    }

    #[test]
    fn test_meets_difficulty_nibbles() {
        assert!(meets_difficulty("0abc", 1));
        assert!(meets_difficulty("00bc", 2));
        assert!(!meets_difficulty("a0bc", 1));
        // Difficulty 0 accepts anything
        assert!(meets_difficulty("ffff", 0));
        // Too-short string never passes
        assert!(!meets_difficulty("0", 2));
    }

    #[test]
    fn test_block_hash_matches_manual() {
        let h = block_hash(1, 42, "x", "0", 9);
        assert_eq!(h, sha256_hex(b"142x09"));
        assert_eq!(h.len(), 64);
    }
}
