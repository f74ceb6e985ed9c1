//! OS-backed randomness.

use rand::rngs::OsRng;
use rand::RngCore;

/// Thin handle over the OS RNG so call sites can share one value and tests
/// can swap randomness at the seams that take `RngCore` instead.
#[derive(Clone, Copy, Default)]
pub struct SecureRandom;

impl SecureRandom {
    pub fn new() -> Self {
        SecureRandom
    }

    pub fn fill(&self, buf: &mut [u8]) {
        OsRng.fill_bytes(buf);
    }

    pub fn bytes(&self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.fill(&mut buf);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_len() {
        let r = SecureRandom::new();
        assert_eq!(r.bytes(16).len(), 16);
    }
}
