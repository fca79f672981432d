//! BLAKE3 content addressing.

use cid::Cid;
use multihash::Multihash;

/// Multicodec for raw bytes.
pub const RAW_CODEC: u64 = 0x55;

/// Multihash code for BLAKE3-256.
pub const BLAKE3_CODE: u64 = 0x1e;

/// Compute the CIDv1 (raw codec, BLAKE3-256) of a byte slice.
pub fn content_cid(data: &[u8]) -> Cid {
    let digest = blake3::hash(data);
    let hash = Multihash::<64>::wrap(BLAKE3_CODE, digest.as_bytes())
        .expect("blake3 digest always fits a 64-byte multihash");
    Cid::new_v1(RAW_CODEC, hash)
}
