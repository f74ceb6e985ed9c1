//! Fixed-prime Diffie-Hellman used by the upstream RPC handshake.
//!
//! The 2048-bit prime and generator 3 are protocol constants; both peers
//! verify public values against them before exponentiating.

use num_bigint::BigUint;
use rand::RngCore;

use crate::crypto::hash::sha1;
use crate::error::{ProxyError, Result};

pub const TEMP_DH_PARAMS_MAGIC: u32 = 0xab45ccd3;
pub const DH_GENERATOR: u32 = 3;
pub const DH_PARAMS_HASH: u32 = 0x00620b93;

const DH_VALUE_LEN: usize = 256;
const MAX_KEYGEN_ATTEMPTS: usize = 1024;

pub static RPC_DH_PRIME: [u8; 256] = [
    0x89, 0x52, 0x13, 0x1b, 0x1e, 0x3a, 0x69, 0xba, 0x5f, 0x85, 0xcf, 0x8b, 0xd2, 0x66, 0xc1, 0x2b,
    0x13, 0x83, 0x16, 0x13, 0xbd, 0x2a, 0x4e, 0xf8, 0x35, 0xa4, 0xd5, 0x3f, 0x9d, 0xbb, 0x42, 0x48,
    0x2d, 0xbd, 0x46, 0x2b, 0x31, 0xd8, 0x6c, 0x81, 0x6c, 0x59, 0x77, 0x52, 0x0f, 0x11, 0x70, 0x73,
    0x9e, 0xd2, 0xdd, 0xd6, 0xd8, 0x1b, 0x9e, 0xb6, 0x5f, 0xaa, 0xac, 0x14, 0x87, 0x53, 0xc9, 0xe4,
    0xf0, 0x72, 0xdc, 0x11, 0xa4, 0x92, 0x73, 0x06, 0x83, 0xfa, 0x00, 0x67, 0x82, 0x6b, 0x18, 0xc5,
    0x1d, 0x7e, 0xcb, 0xa5, 0x2b, 0x82, 0x60, 0x75, 0xc0, 0xb9, 0x55, 0xe5, 0xac, 0xaf, 0xdd, 0x74,
    0xc3, 0x79, 0x5f, 0xd9, 0x52, 0x0b, 0x48, 0x0f, 0x3b, 0xe3, 0xba, 0x06, 0x65, 0x33, 0x8a, 0x49,
    0x8c, 0xa5, 0xda, 0xf1, 0x01, 0x76, 0x05, 0x09, 0xa3, 0x8c, 0x49, 0xe3, 0x00, 0x74, 0x64, 0x08,
    0x77, 0x4b, 0xb3, 0xed, 0x26, 0x18, 0x1a, 0x64, 0x55, 0x76, 0x6a, 0xe9, 0x49, 0x7b, 0xb9, 0xc3,
    0xa3, 0xad, 0x5c, 0xba, 0xf7, 0x6b, 0x73, 0x84, 0x5f, 0xbb, 0x96, 0xbb, 0x6d, 0x0f, 0x68, 0x4f,
    0x95, 0xd2, 0xd3, 0x9c, 0xcb, 0xb4, 0xa9, 0x04, 0xfa, 0xb1, 0xde, 0x43, 0x49, 0xce, 0x1c, 0x20,
    0x87, 0xb6, 0xc9, 0x51, 0xed, 0x99, 0xf9, 0x52, 0xe3, 0x4f, 0xd1, 0xa3, 0xfd, 0x14, 0x83, 0x35,
    0x75, 0x41, 0x47, 0x29, 0xa3, 0x8b, 0xe8, 0x68, 0xa4, 0xf9, 0xec, 0x62, 0x3a, 0x5d, 0x24, 0x62,
    0x1a, 0xba, 0x01, 0xb2, 0x55, 0xc7, 0xe8, 0x38, 0x5d, 0x16, 0xac, 0x93, 0xb0, 0x2d, 0x2a, 0x54,
    0x0a, 0x76, 0x42, 0x98, 0x2d, 0x22, 0xad, 0xa3, 0xcc, 0xde, 0x5c, 0x8d, 0x26, 0x6f, 0xaa, 0x25,
    0xdd, 0x2d, 0xe9, 0xf6, 0xd4, 0x91, 0x04, 0x16, 0x2f, 0x68, 0x5c, 0x45, 0xfe, 0x34, 0xdd, 0xab,
];

/// First-round output the initiator must hold on to for the third round.
#[derive(Clone)]
pub struct TempDhParams {
    pub magic: u32,
    pub params_hash: u32,
    pub a: [u8; 256],
}

pub struct Dh {
    prime: BigUint,
    generator: BigUint,
}

impl Default for Dh {
    fn default() -> Self {
        Self::new()
    }
}

impl Dh {
    pub fn new() -> Self {
        Dh {
            prime: BigUint::from_bytes_be(&RPC_DH_PRIME),
            generator: BigUint::from(DH_GENERATOR),
        }
    }

    pub fn generator(&self) -> u32 {
        DH_GENERATOR
    }

    /// Low 4 bytes of SHA1(u32_le(g) || u32_le(0x000100fe) || prime).
    pub fn params_select(&self) -> u32 {
        let mut buf = Vec::with_capacity(8 + RPC_DH_PRIME.len());
        buf.extend_from_slice(&DH_GENERATOR.to_le_bytes());
        buf.extend_from_slice(&0x000100feu32.to_le_bytes());
        buf.extend_from_slice(&RPC_DH_PRIME);
        let h = sha1(&buf);
        u32::from_le_bytes([h[0], h[1], h[2], h[3]])
    }

    /// A public value is acceptable iff its top 8 bytes are not all zero and
    /// it is strictly below the prime (big-endian compare of the top bytes).
    pub fn is_good_public_value(&self, data: &[u8]) -> bool {
        if data.len() != DH_VALUE_LEN {
            return false;
        }
        if data[..8].iter().all(|&b| b == 0) {
            return false;
        }
        for i in 0..8 {
            if data[i] > RPC_DH_PRIME[i] {
                return false;
            }
            if data[i] < RPC_DH_PRIME[i] {
                return true;
            }
        }
        false
    }

    pub fn public_from_private(&self, private: &[u8; 256]) -> Result<[u8; 256]> {
        let pow = BigUint::from_bytes_be(private);
        to_dh_block(&self.generator.modpow(&pow, &self.prime))
    }

    pub fn shared_secret(&self, peer: &[u8; 256], private: &[u8; 256]) -> Result<[u8; 256]> {
        if !self.is_good_public_value(peer) {
            return Err(ProxyError::Crypto("bad dh public value".into()));
        }
        let base = BigUint::from_bytes_be(peer);
        let pow = BigUint::from_bytes_be(private);
        to_dh_block(&base.modpow(&pow, &self.prime))
    }

    /// Generate a private scalar and g^a, retrying until the public value
    /// passes `is_good_public_value`.
    pub fn first_round(&self, rng: &mut dyn RngCore) -> Result<([u8; 256], TempDhParams)> {
        let mut params = TempDhParams {
            magic: TEMP_DH_PARAMS_MAGIC,
            params_hash: self.params_select(),
            a: [0u8; 256],
        };
        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            rng.fill_bytes(&mut params.a);
            let public = match self.public_from_private(&params.a) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if self.is_good_public_value(&public) {
                return Ok((public, params));
            }
        }
        Err(ProxyError::Crypto("unable to generate good dh public value".into()))
    }

    /// Responder: fresh private b, returns (peer^b, g^b).
    pub fn second_round(
        &self,
        peer: &[u8; 256],
        rng: &mut dyn RngCore,
    ) -> Result<([u8; 256], [u8; 256])> {
        if !self.is_good_public_value(peer) {
            return Err(ProxyError::Crypto("bad dh public value".into()));
        }

        let mut private = [0u8; 256];
        let mut public = None;
        for _ in 0..MAX_KEYGEN_ATTEMPTS {
            rng.fill_bytes(&mut private);
            let p = match self.public_from_private(&private) {
                Ok(p) => p,
                Err(_) => continue,
            };
            if self.is_good_public_value(&p) {
                public = Some(p);
                break;
            }
        }
        let public =
            public.ok_or_else(|| ProxyError::Crypto("unable to generate good dh public value".into()))?;

        let shared = self.shared_secret(peer, &private)?;
        private.fill(0);
        Ok((shared, public))
    }

    /// Initiator: peer^a using the private scalar from the first round.
    pub fn third_round(&self, peer: &[u8; 256], params: &TempDhParams) -> Result<[u8; 256]> {
        if !self.is_good_public_value(peer) {
            return Err(ProxyError::Crypto("bad dh public value".into()));
        }
        if params.magic != TEMP_DH_PARAMS_MAGIC {
            return Err(ProxyError::Crypto(format!(
                "invalid dh params magic: {:08x}",
                params.magic
            )));
        }
        self.shared_secret(peer, &params.a)
    }
}

fn to_dh_block(v: &BigUint) -> Result<[u8; 256]> {
    let bytes = v.to_bytes_be();
    if bytes.len() <= 240 || bytes.len() > 256 {
        return Err(ProxyError::Crypto(format!(
            "invalid dh value length: {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 256];
    out[256 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}
