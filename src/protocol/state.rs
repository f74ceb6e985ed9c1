//! Per-connection session state machine.

use crate::error::Result;
use crate::protocol::mtproto::{parse_mtproto_packet, PacketInfo, PacketKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Handshake,
    Encrypted,
}

#[derive(Debug)]
pub struct Session {
    state: SessionState,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Session {
            state: SessionState::Init,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn accept_packet(&mut self, frame: &[u8]) -> Result<PacketInfo> {
        let info = parse_mtproto_packet(frame)?;
        self.accept_info(&info);
        Ok(info)
    }

    /// Encrypted is absorbing: a later handshake packet never downgrades.
    pub fn accept_info(&mut self, info: &PacketInfo) {
        match info.kind {
            PacketKind::Encrypted => self.state = SessionState::Encrypted,
            PacketKind::DhHandshake => {
                if self.state != SessionState::Encrypted {
                    self.state = SessionState::Handshake;
                }
            }
        }
    }
}
