//! Outer-frame classifier.
//!
//! An inbound frame is either an encrypted envelope (non-zero auth-key id in
//! the first 8 bytes, at least 56 bytes) or a DH handshake envelope
//! (auth-key id 0, inner length at bytes 16..20, function code at 20..24).

use crate::error::{ProxyError, Result};
use crate::protocol::constants::{is_dh_handshake_function, ENCRYPTED_MESSAGE_MIN_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Encrypted,
    DhHandshake,
}

#[derive(Debug, Clone, Copy)]
pub struct PacketInfo {
    pub kind: PacketKind,
    pub auth_key_id: u64,
    pub inner_length: i32,
    pub function: u32,
    pub length: usize,
}

pub fn parse_mtproto_packet(frame: &[u8]) -> Result<PacketInfo> {
    if frame.len() < 28 || frame.len() % 4 != 0 {
        return Err(ProxyError::bad_frame(format!(
            "invalid frame length: {}",
            frame.len()
        )));
    }

    let auth_key_id = u64::from_le_bytes(frame[..8].try_into().expect("8-byte slice"));
    if auth_key_id != 0 {
        if frame.len() < ENCRYPTED_MESSAGE_MIN_SIZE {
            return Err(ProxyError::bad_frame(format!(
                "invalid encrypted frame length: {}",
                frame.len()
            )));
        }
        return Ok(PacketInfo {
            kind: PacketKind::Encrypted,
            auth_key_id,
            inner_length: 0,
            function: 0,
            length: frame.len(),
        });
    }

    let inner_len = i32::from_le_bytes(frame[16..20].try_into().expect("4-byte slice"));
    if inner_len as i64 + 20 > frame.len() as i64 {
        return Err(ProxyError::bad_frame(format!(
            "bad inner length: {} (max {})",
            inner_len,
            frame.len() - 20
        )));
    }
    if inner_len < 20 {
        return Err(ProxyError::bad_frame(format!("bad inner length: {inner_len}")));
    }

    let function = u32::from_le_bytes(frame[20..24].try_into().expect("4-byte slice"));
    if !is_dh_handshake_function(function) {
        return Err(ProxyError::bad_frame(format!(
            "unexpected handshake function: 0x{function:08x}"
        )));
    }

    Ok(PacketInfo {
        kind: PacketKind::DhHandshake,
        auth_key_id: 0,
        inner_length: inner_len,
        function,
        length: frame.len(),
    })
}
