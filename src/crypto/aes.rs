//! AES-256 CBC/CTR and the deterministic session key derivation.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use aes::Aes256;

use crate::crypto::hash::{md5, sha1};
use crate::error::{ProxyError, Result};

pub const MIN_SECRET_LEN: usize = 32;
pub const MAX_SECRET_LEN: usize = 256;

const AES_BLOCK: usize = 16;

// Upper bound of the derivation buffer: nonces, addresses, marker, the
// largest permitted secret, and the trailing nonce copies.
const MAX_CREATE_KEYS_BUFFER_LEN: usize =
    16 + 16 + 4 + 4 + 2 + 6 + 4 + 2 + MAX_SECRET_LEN + 16 + 16 + 4 + 16 * 2 + 256;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Stateful AES-256-CTR keystream, used for the obfuscated client transport.
pub type Aes256Ctr = ctr::Ctr128BE<Aes256>;

pub fn ctr_stream(key: &[u8; 32], iv: &[u8; 16]) -> Aes256Ctr {
    Aes256Ctr::new(key.into(), iv.into())
}

#[derive(Clone)]
pub struct AesKeyData {
    pub read_key: [u8; 32],
    pub read_iv: [u8; 16],
    pub write_key: [u8; 32],
    pub write_iv: [u8; 16],
}

pub fn validate_secret(secret: &[u8]) -> Result<()> {
    if secret.len() < MIN_SECRET_LEN || secret.len() > MAX_SECRET_LEN {
        return Err(ProxyError::Crypto(format!(
            "secret length out of range: {} (expected {}..{})",
            secret.len(),
            MIN_SECRET_LEN,
            MAX_SECRET_LEN
        )));
    }
    Ok(())
}

pub fn encrypt_cbc(key: &[u8; 32], iv: &[u8; 16], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() % AES_BLOCK != 0 {
        return Err(ProxyError::Crypto(format!(
            "cbc plaintext length must be multiple of {AES_BLOCK}"
        )));
    }
    let mut buf = plaintext.to_vec();
    let n = buf.len();
    Aes256CbcEnc::new(key.into(), iv.into())
        .encrypt_padded_mut::<NoPadding>(&mut buf, n)
        .map_err(|e| ProxyError::Crypto(format!("cbc encrypt: {e}")))?;
    Ok(buf)
}

pub fn decrypt_cbc(key: &[u8; 32], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() % AES_BLOCK != 0 {
        return Err(ProxyError::Crypto(format!(
            "cbc ciphertext length must be multiple of {AES_BLOCK}"
        )));
    }
    let mut buf = ciphertext.to_vec();
    Aes256CbcDec::new(key.into(), iv.into())
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| ProxyError::Crypto(format!("cbc decrypt: {e}")))?;
    Ok(buf)
}

/// One call covers encrypt and decrypt: CTR is an XOR keystream.
pub fn apply_ctr(key: &[u8; 32], iv: &[u8; 16], data: &[u8]) -> Vec<u8> {
    let mut out = data.to_vec();
    ctr_stream(key, iv).apply_keystream(&mut out);
    out
}

/// Derive the four session AES keys from the nonce exchange.
///
/// The hash buffer layout is fixed (all numeric fields little-endian):
///
/// ```text
/// nonce_server(16) nonce_client(16) ts(4) server_ip(4) client_port(2)
/// "CLIENT"/"SERVER"(6) client_ip(4) server_port(2) secret nonce_server(16)
/// [client_ipv6(16) server_ipv6(16) when server_ip == 0] nonce_client(16)
/// ```
///
/// write = MD5(buf[1..])[..12] || SHA1(buf), write IV = MD5(buf[2..]); the
/// marker bytes at 42..48 are toggled CLIENT<->SERVER and the same digests
/// yield the read side. A temp key, when present, is XORed over the prefix.
#[allow(clippy::too_many_arguments)]
pub fn create_aes_keys(
    am_client: bool,
    nonce_server: &[u8; 16],
    nonce_client: &[u8; 16],
    client_timestamp: i32,
    server_ip: u32,
    server_port: u16,
    server_ipv6: &[u8; 16],
    client_ip: u32,
    client_port: u16,
    client_ipv6: &[u8; 16],
    secret: &[u8],
    temp_key: &[u8],
) -> Result<AesKeyData> {
    validate_secret(secret)?;

    let mut buf = Vec::with_capacity(96 + secret.len() + temp_key.len());
    buf.extend_from_slice(nonce_server);
    buf.extend_from_slice(nonce_client);
    buf.extend_from_slice(&(client_timestamp as u32).to_le_bytes());
    buf.extend_from_slice(&server_ip.to_le_bytes());
    buf.extend_from_slice(&client_port.to_le_bytes());
    buf.extend_from_slice(if am_client { b"CLIENT" } else { b"SERVER" });
    buf.extend_from_slice(&client_ip.to_le_bytes());
    buf.extend_from_slice(&server_port.to_le_bytes());
    buf.extend_from_slice(secret);
    buf.extend_from_slice(nonce_server);
    if server_ip == 0 {
        buf.extend_from_slice(client_ipv6);
        buf.extend_from_slice(server_ipv6);
    }
    buf.extend_from_slice(nonce_client);

    let temp_key_len = temp_key.len().min(MAX_CREATE_KEYS_BUFFER_LEN);
    if temp_key_len > buf.len() {
        buf.resize(temp_key_len, 0);
    }
    for (b, k) in buf.iter_mut().zip(temp_key.iter().take(temp_key_len)) {
        *b ^= k;
    }

    let mut out = AesKeyData {
        read_key: [0; 32],
        read_iv: [0; 16],
        write_key: [0; 32],
        write_iv: [0; 16],
    };

    let wmd5 = md5(&buf[1..]);
    out.write_key[..12].copy_from_slice(&wmd5[..12]);
    out.write_key[12..].copy_from_slice(&sha1(&buf));
    out.write_iv = md5(&buf[2..]);

    toggle_client_server_marker(&mut buf);

    let rmd5 = md5(&buf[1..]);
    out.read_key[..12].copy_from_slice(&rmd5[..12]);
    out.read_key[12..].copy_from_slice(&sha1(&buf));
    out.read_iv = md5(&buf[2..]);

    buf.fill(0);
    Ok(out)
}

fn toggle_client_server_marker(buf: &mut [u8]) {
    if buf.len() < 48 {
        return;
    }
    buf[42] ^= b'C' ^ b'S';
    buf[43] ^= b'L' ^ b'E';
    buf[44] ^= b'I' ^ b'R';
    buf[45] ^= b'E' ^ b'V';
    buf[46] ^= b'N' ^ b'E';
    buf[47] ^= b'T' ^ b'R';
}
