//! Crypto primitives: digests, CRC, AES modes, key derivation, DH.

pub mod aes;
pub mod crc;
pub mod dh;
pub mod hash;
pub mod rand;

pub use aes::{
    apply_ctr, create_aes_keys, ctr_stream, decrypt_cbc, encrypt_cbc, validate_secret, Aes256Ctr,
    AesKeyData, MAX_SECRET_LEN, MIN_SECRET_LEN,
};
pub use crc::{compute_crc32, compute_crc32c, crc32_partial, crc32c_partial};
pub use dh::{Dh, TempDhParams, DH_GENERATOR, DH_PARAMS_HASH, TEMP_DH_PARAMS_MAGIC};
pub use hash::{md5, sha1, sha1_two_chunks, sha256, sha256_hmac, sha256_two_chunks};
pub use rand::SecureRandom;
