//! Client-side MTProto transports.
//!
//! Plain clients announce a transport with a tag: `0xef` (compact),
//! `0xeeeeeeee` (medium), or `0xdddddddd` (padded). Anything else is treated
//! as a 64-byte obfuscated2 header carrying AES-CTR stream material, the
//! transport tag, and the target DC.

use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::hash::sha256;
use crate::crypto::{ctr_stream, Aes256Ctr};
use crate::error::{ProxyError, Result};

use cipher::StreamCipher;

pub const TAG_COMPACT: u32 = 0xefefefef;
pub const TAG_MEDIUM: u32 = 0xeeeeeeee;
pub const TAG_PADDED: u32 = 0xdddddddd;

const DEFAULT_MAX_FRAME_SIZE: usize = 4 << 20;
const OBFUSCATED_HEADER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Compact,
    Medium,
    Padded,
}

struct ObfuscatedState {
    read_stream: Aes256Ctr,
    write_stream: Aes256Ctr,
}

/// Per-connection transport state. `init` consumes the transport header;
/// afterwards `read_packet` / `write_packet` move whole payloads.
pub struct ClientTransport {
    mode: Option<TransportMode>,
    target_dc: i32,
    max_frame_size: usize,
    obfuscated: Option<ObfuscatedState>,
}

impl ClientTransport {
    pub fn new(max_frame_size: usize) -> Self {
        ClientTransport {
            mode: None,
            target_dc: 0,
            max_frame_size: if max_frame_size == 0 {
                DEFAULT_MAX_FRAME_SIZE
            } else {
                max_frame_size
            },
            obfuscated: None,
        }
    }

    pub fn mode(&self) -> Option<TransportMode> {
        self.mode
    }

    /// Target DC from the obfuscated header; 0 when the client did not say.
    pub fn target_dc(&self) -> i32 {
        self.target_dc
    }

    pub fn is_obfuscated(&self) -> bool {
        self.obfuscated.is_some()
    }

    pub async fn init<R>(&mut self, r: &mut R, secrets: &[[u8; 16]]) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut first = [0u8; 1];
        r.read_exact(&mut first).await?;
        if first[0] == 0xef {
            self.mode = Some(TransportMode::Compact);
            return Ok(());
        }

        let mut header4 = [0u8; 4];
        header4[0] = first[0];
        r.read_exact(&mut header4[1..]).await?;
        match u32::from_le_bytes(header4) {
            TAG_MEDIUM => {
                self.mode = Some(TransportMode::Medium);
                return Ok(());
            }
            TAG_PADDED => {
                self.mode = Some(TransportMode::Padded);
                return Ok(());
            }
            _ => {}
        }

        let mut header = [0u8; OBFUSCATED_HEADER_LEN];
        header[..4].copy_from_slice(&header4);
        r.read_exact(&mut header[4..]).await?;

        let (mode, target_dc, read_stream, write_stream) =
            parse_obfuscated_client_header(&header, secrets)
                .ok_or_else(|| ProxyError::bad_frame("unsupported transport header"))?;

        self.mode = Some(mode);
        self.target_dc = target_dc;
        self.obfuscated = Some(ObfuscatedState {
            read_stream,
            write_stream,
        });
        Ok(())
    }

    pub async fn read_packet<R>(&mut self, r: &mut R) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mode = self
            .mode
            .ok_or_else(|| ProxyError::bad_frame("transport is not initialized"))?;

        let packet_len = self.read_packet_len(r, mode).await?;
        if packet_len == 0 || packet_len > self.max_frame_size {
            return Err(ProxyError::bad_frame(format!("bad packet length: {packet_len}")));
        }

        let mut payload = self.read_decoded(r, packet_len).await?;
        if mode == TransportMode::Padded {
            payload.truncate(packet_len & !3);
        } else if packet_len % 4 != 0 {
            return Err(ProxyError::bad_frame(format!(
                "bad packet alignment: {packet_len}"
            )));
        }
        Ok(payload)
    }

    pub async fn write_packet<W>(&mut self, w: &mut W, payload: &[u8]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if self.mode.is_none() {
            return Err(ProxyError::bad_frame("transport is not initialized"));
        }
        if payload.is_empty() {
            return Ok(());
        }

        let mut frame = self.encode_frame(payload)?;
        if let Some(state) = self.obfuscated.as_mut() {
            state.write_stream.apply_keystream(&mut frame);
        }
        w.write_all(&frame).await?;
        Ok(())
    }

    async fn read_packet_len<R>(&mut self, r: &mut R, mode: TransportMode) -> Result<usize>
    where
        R: AsyncRead + Unpin,
    {
        match mode {
            TransportMode::Compact => {
                let b0 = self.read_decoded(r, 1).await?;
                if b0[0] & 0x7f == 0x7f {
                    let rest = self.read_decoded(r, 3).await?;
                    let enc = u32::from(b0[0])
                        | (u32::from(rest[0]) << 8)
                        | (u32::from(rest[1]) << 16)
                        | (u32::from(rest[2]) << 24);
                    Ok(((enc >> 8) as usize) << 2)
                } else {
                    Ok(usize::from(b0[0] & 0x7f) << 2)
                }
            }
            TransportMode::Medium | TransportMode::Padded => {
                let b4 = self.read_decoded(r, 4).await?;
                let enc = u32::from_le_bytes(b4[..].try_into().expect("4-byte slice"));
                Ok((enc & !0x8000_0000) as usize)
            }
        }
    }

    fn encode_frame(&self, payload: &[u8]) -> Result<Vec<u8>> {
        match self.mode.expect("mode checked by caller") {
            TransportMode::Compact => {
                if payload.len() % 4 != 0 {
                    return Err(ProxyError::bad_frame(format!(
                        "compact transport requires 4-byte aligned payload: {}",
                        payload.len()
                    )));
                }
                if payload.len() <= 0x7e * 4 {
                    let mut frame = Vec::with_capacity(1 + payload.len());
                    frame.push((payload.len() >> 2) as u8);
                    frame.extend_from_slice(payload);
                    Ok(frame)
                } else {
                    let mut frame = Vec::with_capacity(4 + payload.len());
                    frame.extend_from_slice(&(((payload.len() as u32) << 6) | 0x7f).to_le_bytes());
                    frame.extend_from_slice(payload);
                    Ok(frame)
                }
            }
            TransportMode::Medium => {
                if payload.len() % 4 != 0 {
                    return Err(ProxyError::bad_frame(format!(
                        "intermediate transport requires 4-byte aligned payload: {}",
                        payload.len()
                    )));
                }
                let mut frame = Vec::with_capacity(4 + payload.len());
                frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
                frame.extend_from_slice(payload);
                Ok(frame)
            }
            TransportMode::Padded => {
                let pad_len = usize::from(rand::thread_rng().gen::<u8>() & 3);
                let mut frame = Vec::with_capacity(4 + payload.len() + pad_len);
                frame.extend_from_slice(&((payload.len() + pad_len) as u32).to_le_bytes());
                frame.extend_from_slice(payload);
                if pad_len > 0 {
                    let mut pad = [0u8; 3];
                    rand::thread_rng().fill(&mut pad[..pad_len]);
                    frame.extend_from_slice(&pad[..pad_len]);
                }
                Ok(frame)
            }
        }
    }

    async fn read_decoded<R>(&mut self, r: &mut R, n: usize) -> Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; n];
        r.read_exact(&mut buf).await?;
        if let Some(state) = self.obfuscated.as_mut() {
            state.read_stream.apply_keystream(&mut buf);
        }
        Ok(buf)
    }
}

/// Try each configured secret against the 64-byte header. Returns the
/// transport mode, target DC, and the two CTR streams on the first secret
/// whose derived read stream decrypts a known tag at bytes 56..60.
pub fn parse_obfuscated_client_header(
    header: &[u8; 64],
    secrets: &[[u8; 16]],
) -> Option<(TransportMode, i32, Aes256Ctr, Aes256Ctr)> {
    let try_candidate = |secret: Option<&[u8; 16]>| {
        let (read_key, read_iv, write_key, write_iv) = derive_obfuscated_server_keys(header, secret);

        let mut read_stream = ctr_stream(&read_key, &read_iv);
        let mut decrypted = *header;
        read_stream.apply_keystream(&mut decrypted);

        let tag = u32::from_le_bytes(decrypted[56..60].try_into().expect("4-byte slice"));
        let mode = match tag {
            TAG_COMPACT => TransportMode::Compact,
            TAG_MEDIUM => TransportMode::Medium,
            TAG_PADDED => TransportMode::Padded,
            _ => return None,
        };

        let write_stream = ctr_stream(&write_key, &write_iv);
        let target_dc =
            i32::from(i16::from_le_bytes(decrypted[60..62].try_into().expect("2-byte slice")));
        Some((mode, target_dc, read_stream, write_stream))
    };

    if secrets.is_empty() {
        return try_candidate(None);
    }
    secrets.iter().find_map(|s| try_candidate(Some(s)))
}

/// Server-side key derivation from the obfuscated2 header.
///
/// read key  = SHA-256(header[8..40] || secret), read IV = header[40..56];
/// write key = SHA-256(reverse(header[24..56]) || secret),
/// write IV  = reverse(header[8..24]). Without a secret the keys are used
/// unhashed.
pub fn derive_obfuscated_server_keys(
    header: &[u8; 64],
    secret: Option<&[u8; 16]>,
) -> ([u8; 32], [u8; 16], [u8; 32], [u8; 16]) {
    let mut read_key = [0u8; 32];
    let mut read_iv = [0u8; 16];
    let mut write_key = [0u8; 32];
    let mut write_iv = [0u8; 16];

    read_key.copy_from_slice(&header[8..40]);
    if let Some(secret) = secret {
        let mut buf = [0u8; 48];
        buf[..32].copy_from_slice(&read_key);
        buf[32..].copy_from_slice(secret);
        read_key = sha256(&buf);
    }
    read_iv.copy_from_slice(&header[40..56]);

    for i in 0..32 {
        write_key[i] = header[55 - i];
    }
    for i in 0..16 {
        write_iv[i] = header[23 - i];
    }
    if let Some(secret) = secret {
        let mut buf = [0u8; 48];
        buf[..32].copy_from_slice(&write_key);
        buf[32..].copy_from_slice(secret);
        write_key = sha256(&buf);
    }

    (read_key, read_iv, write_key, write_iv)
}
