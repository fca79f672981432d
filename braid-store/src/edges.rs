//! 64-bit edge digests over canonicalized book contents.
//!
//! Byte-equality of two peers' edges is the replication fast-path check:
//! equal edges mean no address or head divergence for a thread, so no
//! follow-up calls are scheduled.

/// Digest a set of identifier byte strings.
///
/// Canonicalization: entries are sorted on their raw bytes and
/// deduplicated, then length-framed into a BLAKE3 hash truncated to 64
/// bits. The empty set has a well-defined digest.
pub fn digest(mut entries: Vec<Vec<u8>>) -> u64 {
    entries.sort();
    entries.dedup();
    let mut hasher = blake3::Hasher::new();
    for entry in &entries {
        hasher.update(&(entry.len() as u64).to_le_bytes());
        hasher.update(entry);
    }
    let hash = hasher.finalize();
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("8 bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_and_duplicates_do_not_matter() {
        let a = digest(vec![b"x".to_vec(), b"y".to_vec()]);
        let b = digest(vec![b"y".to_vec(), b"x".to_vec(), b"x".to_vec()]);
        assert_eq!(a, b);
    }

    #[test]
    fn content_matters() {
        assert_ne!(
            digest(vec![b"x".to_vec()]),
            digest(vec![b"z".to_vec()])
        );
    }

    #[test]
    fn framing_distinguishes_concatenations() {
        // ["ab"] and ["a", "b"] must not collide
        assert_ne!(
            digest(vec![b"ab".to_vec()]),
            digest(vec![b"a".to_vec(), b"b".to_vec()])
        );
    }
}
