//! Running checksum over the structurally significant bytes of an image.
//!
//! The integrity code embedded at the end of the container is the CRC-32
//! of everything before it, excluding the integrity sub-element itself.

use crc::{CRC_32_ISO_HDLC, Crc, Digest};

static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Incrementally fed CRC-32 accumulator.
pub struct ImageSignature {
    digest: Digest<'static, u32>,
}

impl ImageSignature {
    pub fn new() -> Self {
        Self {
            digest: CRC32.digest(),
        }
    }

    /// Fold more bytes into the running value.
    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
    }

    /// Consume the accumulator and produce the final value.
    pub fn finalize(self) -> u32 {
        self.digest.finalize()
    }

    /// One-shot checksum, used by encoders and tests.
    pub fn checksum(data: &[u8]) -> u32 {
        CRC32.checksum(data)
    }
}

impl Default for ImageSignature {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ImageSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ImageSignature(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vector() {
        // "123456789" is the standard CRC-32 check input.
        let mut sig = ImageSignature::new();
        sig.update(b"123456789");
        assert_eq!(sig.finalize(), 0xCBF4_3926);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let mut sig = ImageSignature::new();
        for chunk in data.chunks(37) {
            sig.update(chunk);
        }
        assert_eq!(sig.finalize(), ImageSignature::checksum(&data));
    }

    #[test]
    fn test_bit_flip_changes_value() {
        let mut data = vec![0x5Au8; 512];
        let clean = ImageSignature::checksum(&data);
        data[300] ^= 0x01;
        assert_ne!(clean, ImageSignature::checksum(&data));
    }
}
