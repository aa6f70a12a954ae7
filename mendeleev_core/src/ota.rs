use alloc::vec::Vec;

use crate::constants::wire_constants::MAX_PAYLOAD;

/// Splits a firmware image into OTA command payloads.
///
/// The first fragment announces the transfer: index byte 0x00 followed by
/// the total image length as a big-endian u32. Every following fragment is
/// an incrementing (wrapping) index byte plus up to `max_fragment - 1` image
/// bytes. Fragments are sent in order over the ota command channel.
pub fn fragment_image(image: &[u8], max_fragment: usize) -> Vec<Vec<u8>> {
    let chunk_size = max_fragment - 1;
    let mut fragments = Vec::with_capacity(1 + image.len().div_ceil(chunk_size));

    let mut header = Vec::with_capacity(5);
    header.push(0x00);
    header.extend_from_slice(&(image.len() as u32).to_be_bytes());
    fragments.push(header);

    let mut index: u8 = 0;
    for chunk in image.chunks(chunk_size) {
        index = index.wrapping_add(1);
        let mut fragment = Vec::with_capacity(1 + chunk.len());
        fragment.push(index);
        fragment.extend_from_slice(chunk);
        fragments.push(fragment);
    }
    fragments
}

/// Fragment payload limit for the bus: whatever fits in one frame.
pub const fn max_fragment_size() -> usize {
    MAX_PAYLOAD
}
