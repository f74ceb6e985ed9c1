//! MTProto framing: constants, packet classification, control frames,
//! per-connection session state.

pub mod constants;
pub mod frames;
pub mod mtproto;
pub mod state;

pub use constants::*;
pub use frames::{
    build_close_ext, build_proxy_ans, build_proxy_req, build_simple_ack, parse_control_frame,
    parse_proxy_req, ControlFrame, ProxyRequestFrame,
};
pub use mtproto::{parse_mtproto_packet, PacketInfo, PacketKind};
pub use state::{Session, SessionState};
