//! Tesla Wall Connector RS-485 wire protocol
//!
//! ```text
//!   bytes ──► FrameReceiver ──► Frame ──► Message::decode ──► bus dispatch
//!                                                              │
//!   bytes ◄── encode_frame ◄── Message::encode ◄── controller ◄┘
//! ```
//!
//! - [`frame`]: SLIP-style escaping, checksum and the byte-at-a-time receiver
//! - [`message`]: typed messages and the heartbeat data blocks
//! - [`id`]: 2-byte bus addresses

pub mod error;
pub mod frame;
pub mod id;
pub mod message;

pub use error::{ProtocolError, Result};
pub use frame::{checksum, decode_frame, encode_frame, Frame, FrameReceiver, Received};
pub use id::{random_sign, TwcId};
pub use message::{
    encode_raw, HeartbeatData, MasterCommand, Message, ProtocolVersion, SlaveHeartbeat,
    SlaveStatus, VinPart,
};

/// Render bytes as spaced upper-case hex, e.g. `FD E2 11 22`
pub fn hex_str(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_str() {
        assert_eq!(hex_str(&[0xFD, 0xE2, 0x01]), "FD E2 01");
        assert_eq!(hex_str(&[]), "");
    }
}
