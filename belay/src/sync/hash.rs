//! 32-bit FNV-1a, the content hash shared with the device-side routines.

/// FNV offset basis.
const OFFSET: u32 = 0x811c_9dc5;
/// FNV prime.
const PRIME: u32 = 0x0100_0193;

/// Hashes `data`.
pub fn fnv1a32(data: &[u8]) -> u32 {
    data.iter()
        .fold(OFFSET, |h, &b| (h ^ u32::from(b)).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vectors() {
        assert_eq!(fnv1a32(b""), 0x811c_9dc5);
        assert_eq!(fnv1a32(b"a"), 0xe40c_292c);
        assert_eq!(fnv1a32(b"foobar"), 0xbf9c_f968);
    }
}
