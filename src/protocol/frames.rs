//! Upstream RPC control-frame codec.
//!
//! Frames between the proxy and the middle-end servers: proxied request,
//! proxied answer, simple ack, and remote close. All integers little-endian.

use crate::error::{ProxyError, Result};
use crate::protocol::constants::{RPC_CLOSE_EXT, RPC_PROXY_ANS, RPC_PROXY_REQ, RPC_SIMPLE_ACK};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    ProxyAns {
        flags: i32,
        out_conn_id: i64,
        payload: Vec<u8>,
    },
    SimpleAck {
        out_conn_id: i64,
        confirm: i32,
    },
    CloseExt {
        out_conn_id: i64,
    },
}

/// RPC_PROXY_REQ body. The extra section is present iff `flags & 12 != 0`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyRequestFrame {
    pub flags: i32,
    pub ext_conn_id: i64,
    pub remote_ip: [u8; 20],
    pub our_ip: [u8; 20],
    pub extra_bytes: Vec<u8>,
    pub payload: Vec<u8>,
}

pub fn parse_control_frame(frame: &[u8]) -> Result<ControlFrame> {
    if frame.len() < 4 {
        return Err(ProxyError::bad_frame(format!("frame too short: {}", frame.len())));
    }
    let op = u32::from_le_bytes(frame[..4].try_into().expect("4-byte slice"));
    match op {
        RPC_PROXY_ANS => {
            if frame.len() < 16 {
                return Err(ProxyError::bad_frame(format!(
                    "proxy answer frame too short: {}",
                    frame.len()
                )));
            }
            Ok(ControlFrame::ProxyAns {
                flags: i32::from_le_bytes(frame[4..8].try_into().expect("4-byte slice")),
                out_conn_id: i64::from_le_bytes(frame[8..16].try_into().expect("8-byte slice")),
                payload: frame[16..].to_vec(),
            })
        }
        RPC_SIMPLE_ACK => {
            if frame.len() != 16 {
                return Err(ProxyError::bad_frame(format!(
                    "simple ack frame length mismatch: {}",
                    frame.len()
                )));
            }
            Ok(ControlFrame::SimpleAck {
                out_conn_id: i64::from_le_bytes(frame[4..12].try_into().expect("8-byte slice")),
                confirm: i32::from_le_bytes(frame[12..16].try_into().expect("4-byte slice")),
            })
        }
        RPC_CLOSE_EXT => {
            if frame.len() != 12 {
                return Err(ProxyError::bad_frame(format!(
                    "close ext frame length mismatch: {}",
                    frame.len()
                )));
            }
            Ok(ControlFrame::CloseExt {
                out_conn_id: i64::from_le_bytes(frame[4..12].try_into().expect("8-byte slice")),
            })
        }
        other => Err(ProxyError::bad_frame(format!(
            "unexpected control op: 0x{other:08x}"
        ))),
    }
}

pub fn build_proxy_ans(flags: i32, out_conn_id: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + payload.len());
    buf.extend_from_slice(&RPC_PROXY_ANS.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf.extend_from_slice(&out_conn_id.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

pub fn build_simple_ack(out_conn_id: i64, confirm: i32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&RPC_SIMPLE_ACK.to_le_bytes());
    buf.extend_from_slice(&out_conn_id.to_le_bytes());
    buf.extend_from_slice(&confirm.to_le_bytes());
    buf
}

pub fn build_close_ext(out_conn_id: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&RPC_CLOSE_EXT.to_le_bytes());
    buf.extend_from_slice(&out_conn_id.to_le_bytes());
    buf
}

pub fn build_proxy_req(req: &ProxyRequestFrame) -> Vec<u8> {
    let has_extra = (req.flags & 12) != 0;
    let mut size = 4 + 4 + 8 + 20 + 20 + req.payload.len();
    if has_extra {
        size += 4 + req.extra_bytes.len();
    }

    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&RPC_PROXY_REQ.to_le_bytes());
    buf.extend_from_slice(&req.flags.to_le_bytes());
    buf.extend_from_slice(&req.ext_conn_id.to_le_bytes());
    buf.extend_from_slice(&req.remote_ip);
    buf.extend_from_slice(&req.our_ip);
    if has_extra {
        buf.extend_from_slice(&(req.extra_bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(&req.extra_bytes);
    }
    buf.extend_from_slice(&req.payload);
    buf
}

pub fn parse_proxy_req(frame: &[u8]) -> Result<ProxyRequestFrame> {
    if frame.len() < 56 {
        return Err(ProxyError::bad_frame(format!(
            "proxy req frame too short: {}",
            frame.len()
        )));
    }
    let op = u32::from_le_bytes(frame[..4].try_into().expect("4-byte slice"));
    if op != RPC_PROXY_REQ {
        return Err(ProxyError::bad_frame(format!(
            "unexpected proxy req op: 0x{op:08x}"
        )));
    }

    let mut req = ProxyRequestFrame {
        flags: i32::from_le_bytes(frame[4..8].try_into().expect("4-byte slice")),
        ext_conn_id: i64::from_le_bytes(frame[8..16].try_into().expect("8-byte slice")),
        ..Default::default()
    };
    req.remote_ip.copy_from_slice(&frame[16..36]);
    req.our_ip.copy_from_slice(&frame[36..56]);

    let mut pos = 56;
    if (req.flags & 12) != 0 {
        if frame.len() < pos + 4 {
            return Err(ProxyError::bad_frame("proxy req missing extra size".to_string()));
        }
        let extra_len =
            u32::from_le_bytes(frame[pos..pos + 4].try_into().expect("4-byte slice")) as usize;
        pos += 4;
        if frame.len() < pos + extra_len {
            return Err(ProxyError::bad_frame(format!(
                "proxy req bad extra size: {extra_len}"
            )));
        }
        req.extra_bytes = frame[pos..pos + extra_len].to_vec();
        pos += extra_len;
    }
    req.payload = frame[pos..].to_vec();
    Ok(req)
}
