use crc32fast::Hasher;

/// Compute CRC32 checksum for a byte slice
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// CRC32 folded to 16 bits, used as the per-segment payload checksum
pub fn checksum16(data: &[u8]) -> u16 {
    let crc = crc32(data);
    ((crc >> 16) as u16) ^ (crc as u16)
}
