//! Digest helpers over the RustCrypto hashes.

use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::Sha256;

pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

/// SHA-1 over two chunks without concatenating them first.
pub fn sha1_two_chunks(first: &[u8], second: &[u8]) -> [u8; 20] {
    let mut h = Sha1::new();
    h.update(first);
    h.update(second);
    h.finalize().into()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha256_two_chunks(first: &[u8], second: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(first);
    h.update(second);
    h.finalize().into()
}

pub fn sha256_hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha1_vector() {
        assert_eq!(
            hex::encode(sha1(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(hex::encode(sha1_two_chunks(b"a", b"bc")), hex::encode(sha1(b"abc")));
    }

    #[test]
    fn sha256_vector() {
        assert_eq!(
            hex::encode(sha256(b"abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            hex::encode(sha256_two_chunks(b"ab", b"c")),
            hex::encode(sha256(b"abc"))
        );
    }

    #[test]
    fn hmac_sha256_vector() {
        let got = sha256_hmac(b"key", b"The quick brown fox jumps over the lazy dog");
        assert_eq!(
            hex::encode(got),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn md5_vector() {
        assert_eq!(hex::encode(md5(b"abc")), "900150983cd24fb0d6963f7d28e17f72");
    }
}
