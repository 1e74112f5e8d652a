//! Client-side frame masking (RFC 6455 Section 5.3).

/// XOR a 4-byte mask into `data`, byte by byte.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// XOR a 4-byte mask into `data`, a word at a time.
///
/// Equivalent to [`apply_mask`]; used on payloads large enough for the
/// chunked loop to matter.
#[inline]
pub fn apply_mask_fast(data: &mut [u8], mask: [u8; 4]) {
    let mask_word = u32::from_ne_bytes(mask);
    let (chunks, tail) = data.split_at_mut(data.len() & !3);

    for chunk in chunks.chunks_exact_mut(4) {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        chunk.copy_from_slice(&(word ^ mask_word).to_ne_bytes());
    }
    for (i, byte) in tail.iter_mut().enumerate() {
        *byte ^= mask[i];
    }
}
