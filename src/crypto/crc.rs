//! CRC-32 (IEEE) and CRC-32C (Castagnoli) with partial-state variants.
//!
//! The partial functions keep the raw (non-finalized) CRC register, matching
//! the C crc32_partial contract: seed with 0xffffffff, finalize by XOR with
//! 0xffffffff. The backing crates chain finalized values, so the register is
//! inverted on both sides of each call.

pub fn crc32_partial(data: &[u8], crc: u32) -> u32 {
    let mut h = crc32fast::Hasher::new_with_initial(!crc);
    h.update(data);
    !h.finalize()
}

pub fn compute_crc32(data: &[u8]) -> u32 {
    crc32_partial(data, !0u32) ^ !0u32
}

pub fn crc32c_partial(data: &[u8], crc: u32) -> u32 {
    !crc32c::crc32c_append(!crc, data)
}

pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c_partial(data, !0u32) ^ !0u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_values() {
        assert_eq!(compute_crc32(b"123456789"), 0xcbf43926);
        assert_eq!(compute_crc32c(b"123456789"), 0xe3069283);
    }

    #[test]
    fn partial_matches_single_shot() {
        let seed = !0u32;
        let p = crc32_partial(b"56789", crc32_partial(b"1234", seed));
        assert_eq!(p ^ 0xffffffff, compute_crc32(b"123456789"));

        let pc = crc32c_partial(b"56789", crc32c_partial(b"1234", seed));
        assert_eq!(pc ^ 0xffffffff, compute_crc32c(b"123456789"));
    }

    #[test]
    fn empty_input_keeps_state() {
        let seed = 0x1234_5678;
        assert_eq!(crc32_partial(&[], seed), seed);
        assert_eq!(crc32c_partial(&[], seed), seed);
    }
}
