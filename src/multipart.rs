//! Part-plan computation and composite ETag math shared by the multipart
//! path. Grounded on this crate's own composite-ETag precedent (previously
//! a server-side multipart assembler): `hex(MD5(concat(part_md5_raw)))-N`.

use crate::types::MAX_PARTS;
use md5::{Digest, Md5};

/// Compute the part plan for an object of `size` bytes targeting
/// `chunk_size` bytes per part. Returns the starting byte offset of each
/// part and the (possibly auto-increased) chunk size actually used.
///
/// If the naive plan would exceed `MAX_PARTS`, the chunk size is
/// recomputed as `size / MAX_PARTS + 1024` — the 1024-byte margin avoids
/// an off-by-one part-count overrun from integer division.
pub fn split(size: u64, chunk_size: u64) -> (Vec<u64>, u64) {
    if size == 0 {
        return (vec![0], chunk_size.max(1));
    }

    let naive_parts = size.div_ceil(chunk_size.max(1));
    let chunk_size = if naive_parts as usize > MAX_PARTS {
        size / MAX_PARTS as u64 + 1024
    } else {
        chunk_size
    };

    let mut indices = Vec::new();
    let mut start = 0u64;
    while start < size {
        indices.push(start);
        start += chunk_size;
    }
    (indices, chunk_size)
}

/// Compose the multipart ETag from the raw MD5 digests of each part, in
/// ascending part-number order, as `"hex(MD5(concat(digests)))-count"`.
pub fn composite_etag(part_md5s: &[[u8; 16]]) -> String {
    let mut concat = Vec::with_capacity(part_md5s.len() * 16);
    for digest in part_md5s {
        concat.extend_from_slice(digest);
    }
    let final_md5 = Md5::digest(&concat);
    format!("\"{}-{}\"", hex::encode(final_md5), part_md5s.len())
}
