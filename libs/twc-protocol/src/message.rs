//! Typed bus messages
//!
//! The first two payload bytes select the command. Everything after that is
//! fixed layout; trailing padding is always zero. Lengths below exclude the
//! checksum byte the frame codec appends.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::frame::{Frame, PROTOCOL2_LEN};
use crate::id::TwcId;

/// Command prefixes that can brick or crash a real TWC
pub const DANGEROUS_COMMANDS: [[u8; 2]; 3] = [[0xFC, 0x19], [0xFC, 0x1A], [0xFB, 0xE8]];

/// Heartbeat size family a slave speaks, detected from its linkready length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// 14-byte frames, 7-byte heartbeat data
    V1,
    /// 16-byte frames, 9-byte heartbeat data, VIN and voltage reporting
    V2,
}

impl ProtocolVersion {
    pub fn heartbeat_len(self) -> usize {
        match self {
            Self::V1 => 7,
            Self::V2 => 9,
        }
    }

    /// Lowest amps a slave of this generation accepts
    pub fn min_amps_supported(self) -> f64 {
        match self {
            Self::V1 => 5.0,
            Self::V2 => 6.0,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

/// Which third of the VIN a query or reply carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VinPart {
    First,
    Second,
    Third,
}

impl VinPart {
    fn code(self) -> u8 {
        match self {
            Self::First => 0xEE,
            Self::Second => 0xEF,
            Self::Third => 0xF1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0xEE => Some(Self::First),
            0xEF => Some(Self::Second),
            0xF1 => Some(Self::Third),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::First => 0,
            Self::Second => 1,
            Self::Third => 2,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::First => Some(Self::Second),
            Self::Second => Some(Self::Third),
            Self::Third => None,
        }
    }
}

/// Command byte of a master heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterCommand {
    Idle,
    Error,
    /// Set the charge limit before charging starts
    SetAmps,
    /// Set the charge limit while charging (protocol 2 only)
    SetAmpsCharging,
    BumpUp,
    BumpDown,
    Other(u8),
}

impl MasterCommand {
    pub fn code(self) -> u8 {
        match self {
            Self::Idle => 0x00,
            Self::Error => 0x02,
            Self::SetAmps => 0x05,
            Self::SetAmpsCharging => 0x09,
            Self::BumpUp => 0x06,
            Self::BumpDown => 0x07,
            Self::Other(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Idle,
            0x02 => Self::Error,
            0x05 => Self::SetAmps,
            0x09 => Self::SetAmpsCharging,
            0x06 => Self::BumpUp,
            0x07 => Self::BumpDown,
            c => Self::Other(c),
        }
    }
}

/// Data block of a master heartbeat, always held in its 9-byte form
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatData(pub [u8; 9]);

impl HeartbeatData {
    pub const IDLE: HeartbeatData = HeartbeatData([0; 9]);

    /// Offer `amps` to a slave of the given protocol
    pub fn set_amps(protocol: ProtocolVersion, amps: f64) -> Self {
        let command = match protocol {
            ProtocolVersion::V1 => MasterCommand::SetAmps,
            ProtocolVersion::V2 => MasterCommand::SetAmpsCharging,
        };
        let hundredths = (amps * 100.0).round().clamp(0.0, f64::from(u16::MAX)) as u16;
        let [hi, lo] = hundredths.to_be_bytes();
        Self([command.code(), hi, lo, 0, 0, 0, 0, 0, 0])
    }

    /// Take raw bytes, zero padded or truncated to 9
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = [0u8; 9];
        let n = bytes.len().min(9);
        data[..n].copy_from_slice(&bytes[..n]);
        Self(data)
    }

    pub fn command(&self) -> MasterCommand {
        MasterCommand::from_code(self.0[0])
    }

    pub fn amps(&self) -> f64 {
        f64::from(u16::from_be_bytes([self.0[1], self.0[2]])) / 100.0
    }

    pub fn is_idle(&self) -> bool {
        self.0 == [0; 9]
    }

    /// Bytes sent on the wire for the given protocol
    pub fn for_protocol(&self, protocol: ProtocolVersion) -> &[u8] {
        &self.0[..protocol.heartbeat_len()]
    }
}

/// Status reported by a slave heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlaveStatus {
    Ready,
    Charging,
    Error,
    PluggedNotCharging,
    PluggedReady,
    Busy,
    /// Protocol 2 acknowledgement states 06..0A
    Acknowledged(u8),
    Other(u8),
}

impl SlaveStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::Ready,
            0x01 => Self::Charging,
            0x02 => Self::Error,
            0x03 => Self::PluggedNotCharging,
            0x04 => Self::PluggedReady,
            0x05 => Self::Busy,
            0x06..=0x0A => Self::Acknowledged(code),
            c => Self::Other(c),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Ready => 0x00,
            Self::Charging => 0x01,
            Self::Error => 0x02,
            Self::PluggedNotCharging => 0x03,
            Self::PluggedReady => 0x04,
            Self::Busy => 0x05,
            Self::Acknowledged(c) | Self::Other(c) => c,
        }
    }
}

/// Decoded slave heartbeat data
#[derive(Debug, Clone, PartialEq)]
pub struct SlaveHeartbeat {
    pub state: SlaveStatus,
    pub amps_max: f64,
    pub amps_actual: f64,
    /// Raw data block as received (7 or 9 bytes)
    pub raw: Vec<u8>,
}

impl SlaveHeartbeat {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 5 {
            return Err(ProtocolError::Truncated {
                name: "slave heartbeat",
                len: data.len(),
            });
        }
        Ok(Self {
            state: SlaveStatus::from_code(data[0]),
            amps_max: hundredths(data[1], data[2]),
            amps_actual: hundredths(data[3], data[4]),
            raw: data.to_vec(),
        })
    }

    /// Build the 9-byte data block a slave would send
    pub fn encode(state: SlaveStatus, amps_max: f64, amps_actual: f64) -> [u8; 9] {
        let [mh, ml] = to_hundredths(amps_max).to_be_bytes();
        let [ah, al] = to_hundredths(amps_actual).to_be_bytes();
        [state.code(), mh, ml, ah, al, 0, 0, 0, 0]
    }
}

/// Every message the controller sends or understands
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    MasterLinkready1 {
        sender: TwcId,
        sign: u8,
    },
    MasterLinkready2 {
        sender: TwcId,
        sign: u8,
    },
    MasterHeartbeat {
        sender: TwcId,
        receiver: TwcId,
        data: Vec<u8>,
    },
    SlaveLinkready {
        sender: TwcId,
        sign: u8,
        max_amps: f64,
        protocol: ProtocolVersion,
    },
    SlaveHeartbeat {
        sender: TwcId,
        receiver: TwcId,
        heartbeat: SlaveHeartbeat,
    },
    VoltageRequest {
        sender: TwcId,
        receiver: TwcId,
    },
    VoltageResponse {
        sender: TwcId,
        lifetime_kwh: u32,
        volts: [u16; 3],
    },
    GetVin {
        sender: TwcId,
        receiver: TwcId,
        part: VinPart,
    },
    VinReply {
        sender: TwcId,
        part: VinPart,
        text: String,
    },
    StartCharging {
        sender: TwcId,
        receiver: TwcId,
    },
    StopCharging {
        sender: TwcId,
        receiver: TwcId,
    },
    AckStart {
        sender: TwcId,
    },
    AckStop {
        sender: TwcId,
    },
    IdleTwoHours,
}

impl Message {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::MasterLinkready1 { .. } => "master linkready1",
            Self::MasterLinkready2 { .. } => "master linkready2",
            Self::MasterHeartbeat { .. } => "master heartbeat",
            Self::SlaveLinkready { .. } => "slave linkready",
            Self::SlaveHeartbeat { .. } => "slave heartbeat",
            Self::VoltageRequest { .. } => "voltage request",
            Self::VoltageResponse { .. } => "voltage response",
            Self::GetVin { .. } => "VIN request",
            Self::VinReply { .. } => "VIN reply",
            Self::StartCharging { .. } => "start charging",
            Self::StopCharging { .. } => "stop charging",
            Self::AckStart { .. } => "start ack",
            Self::AckStop { .. } => "stop ack",
            Self::IdleTwoHours => "idle",
        }
    }

    /// Encode into a payload ready for framing
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(PROTOCOL2_LEN);
        match self {
            Self::MasterLinkready1 { sender, sign } => {
                out.extend([0xFC, 0xE1]);
                out.extend(sender.bytes());
                out.push(*sign);
                out.extend([0; 8]);
            },
            Self::MasterLinkready2 { sender, sign } => {
                out.extend([0xFB, 0xE2]);
                out.extend(sender.bytes());
                out.push(*sign);
                out.extend([0; 8]);
            },
            Self::MasterHeartbeat {
                sender,
                receiver,
                data,
            } => {
                out.extend([0xFB, 0xE0]);
                out.extend(sender.bytes());
                out.extend(receiver.bytes());
                out.extend(data);
            },
            Self::SlaveLinkready {
                sender,
                sign,
                max_amps,
                protocol,
            } => {
                out.extend([0xFD, 0xE2]);
                out.extend(sender.bytes());
                out.push(*sign);
                out.extend(to_hundredths(*max_amps).to_be_bytes());
                out.extend([0; 6]);
                if *protocol == ProtocolVersion::V2 {
                    out.extend([0; 2]);
                }
            },
            Self::SlaveHeartbeat {
                sender,
                receiver,
                heartbeat,
            } => {
                out.extend([0xFD, 0xE0]);
                out.extend(sender.bytes());
                out.extend(receiver.bytes());
                out.extend(&heartbeat.raw);
            },
            Self::VoltageRequest { sender, receiver } => {
                out.extend([0xFB, 0xEB]);
                out.extend(sender.bytes());
                out.extend(receiver.bytes());
                out.extend([0; 9]);
            },
            Self::VoltageResponse {
                sender,
                lifetime_kwh,
                volts,
            } => {
                out.extend([0xFD, 0xEB]);
                out.extend(sender.bytes());
                out.extend(lifetime_kwh.to_be_bytes());
                for v in volts {
                    out.extend(v.to_be_bytes());
                }
                out.extend([0; 5]);
            },
            Self::GetVin {
                sender,
                receiver,
                part,
            } => {
                out.extend([0xFB, part.code()]);
                out.extend(sender.bytes());
                out.extend(receiver.bytes());
                out.extend([0; 9]);
            },
            Self::VinReply { sender, part, text } => {
                out.extend([0xFD, part.code()]);
                out.extend(sender.bytes());
                let mut chars = [0u8; 11];
                for (slot, b) in chars.iter_mut().zip(text.bytes()) {
                    *slot = b;
                }
                out.extend(chars);
            },
            Self::StartCharging { sender, receiver } => {
                out.extend([0xFC, 0xB1]);
                out.extend(sender.bytes());
                out.extend(receiver.bytes());
                out.extend([0; 9]);
            },
            Self::StopCharging { sender, receiver } => {
                out.extend([0xFC, 0xB2]);
                out.extend(sender.bytes());
                out.extend(receiver.bytes());
                out.extend([0; 9]);
            },
            Self::AckStart { sender } => {
                out.extend([0xFD, 0xB1]);
                out.extend(sender.bytes());
                out.extend([0; 9]);
            },
            Self::AckStop { sender } => {
                out.extend([0xFD, 0xB2]);
                out.extend(sender.bytes());
                out.extend([0; 9]);
            },
            Self::IdleTwoHours => {
                out.extend([0xFC, 0x1D]);
                out.extend([0; 13]);
            },
        }
        check_not_dangerous(&out)?;
        Ok(out)
    }

    /// Decode a verified frame
    pub fn decode(frame: &Frame) -> Result<Self> {
        let p = frame.payload();
        let command = frame.command();
        let need = |name: &'static str, len: usize| -> Result<()> {
            if p.len() < len {
                Err(ProtocolError::Truncated { name, len: p.len() })
            } else {
                Ok(())
            }
        };

        let msg = match command {
            [0xFC, 0xE1] => {
                need("master linkready1", 5)?;
                Self::MasterLinkready1 {
                    sender: TwcId::from_slice(&p[2..4]),
                    sign: p[4],
                }
            },
            [0xFB, 0xE2] | [0xFC, 0xE2] => {
                need("master linkready2", 5)?;
                Self::MasterLinkready2 {
                    sender: TwcId::from_slice(&p[2..4]),
                    sign: p[4],
                }
            },
            [0xFB, 0xE0] => {
                need("master heartbeat", 13)?;
                Self::MasterHeartbeat {
                    sender: TwcId::from_slice(&p[2..4]),
                    receiver: TwcId::from_slice(&p[4..6]),
                    data: p[6..].to_vec(),
                }
            },
            [0xFD, 0xE2] => {
                need("slave linkready", 13)?;
                Self::SlaveLinkready {
                    sender: TwcId::from_slice(&p[2..4]),
                    sign: p[4],
                    max_amps: hundredths(p[5], p[6]),
                    protocol: if frame.len() == PROTOCOL2_LEN {
                        ProtocolVersion::V2
                    } else {
                        ProtocolVersion::V1
                    },
                }
            },
            [0xFD, 0xE0] => {
                need("slave heartbeat", 13)?;
                Self::SlaveHeartbeat {
                    sender: TwcId::from_slice(&p[2..4]),
                    receiver: TwcId::from_slice(&p[4..6]),
                    heartbeat: SlaveHeartbeat::parse(&p[6..])?,
                }
            },
            [0xFB, 0xEB] => {
                need("voltage request", 6)?;
                Self::VoltageRequest {
                    sender: TwcId::from_slice(&p[2..4]),
                    receiver: TwcId::from_slice(&p[4..6]),
                }
            },
            [0xFD, 0xEB] => {
                need("voltage response", 15)?;
                Self::VoltageResponse {
                    sender: TwcId::from_slice(&p[2..4]),
                    lifetime_kwh: u32::from_be_bytes([p[4], p[5], p[6], p[7]]),
                    volts: [
                        u16::from_be_bytes([p[8], p[9]]),
                        u16::from_be_bytes([p[10], p[11]]),
                        u16::from_be_bytes([p[12], p[13]]),
                    ],
                }
            },
            [0xFB, code @ (0xEE | 0xEF | 0xF1)] => {
                need("VIN request", 6)?;
                Self::GetVin {
                    sender: TwcId::from_slice(&p[2..4]),
                    receiver: TwcId::from_slice(&p[4..6]),
                    part: VinPart::from_code(code).ok_or(ProtocolError::UnknownCommand(command))?,
                }
            },
            [0xFD, code @ (0xEE | 0xEF | 0xF1)] => {
                need("VIN reply", 5)?;
                let data = &p[4..];
                let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
                Self::VinReply {
                    sender: TwcId::from_slice(&p[2..4]),
                    part: VinPart::from_code(code).ok_or(ProtocolError::UnknownCommand(command))?,
                    text: String::from_utf8_lossy(&data[..end]).into_owned(),
                }
            },
            [0xFC, 0xB1] => {
                need("start charging", 6)?;
                Self::StartCharging {
                    sender: TwcId::from_slice(&p[2..4]),
                    receiver: TwcId::from_slice(&p[4..6]),
                }
            },
            [0xFC, 0xB2] => {
                need("stop charging", 6)?;
                Self::StopCharging {
                    sender: TwcId::from_slice(&p[2..4]),
                    receiver: TwcId::from_slice(&p[4..6]),
                }
            },
            [0xFD, 0xB1] => {
                need("start ack", 4)?;
                Self::AckStart {
                    sender: TwcId::from_slice(&p[2..4]),
                }
            },
            [0xFD, 0xB2] => {
                need("stop ack", 4)?;
                Self::AckStop {
                    sender: TwcId::from_slice(&p[2..4]),
                }
            },
            [0xFC, 0x1D] => Self::IdleTwoHours,
            _ => return Err(ProtocolError::UnknownCommand(command)),
        };
        Ok(msg)
    }
}

/// Refuse payloads that start with a command known to damage a TWC
pub fn check_not_dangerous(payload: &[u8]) -> Result<()> {
    if payload.len() >= 2 {
        let command = [payload[0], payload[1]];
        if DANGEROUS_COMMANDS.contains(&command) {
            return Err(ProtocolError::DangerousCommand(command));
        }
    }
    Ok(())
}

/// Validate an arbitrary payload before it goes on the wire
pub fn encode_raw(payload: &[u8]) -> Result<Vec<u8>> {
    check_not_dangerous(payload)?;
    Ok(crate::frame::encode_frame(payload))
}

fn hundredths(hi: u8, lo: u8) -> f64 {
    f64::from(u16::from_be_bytes([hi, lo])) / 100.0
}

fn to_hundredths(amps: f64) -> u16 {
    (amps * 100.0).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::frame::checksum;

    fn frame_of(payload: &[u8]) -> Frame {
        let mut msg = payload.to_vec();
        msg.push(checksum(payload));
        Frame::from_unescaped(&msg).unwrap()
    }

    #[test]
    fn test_decode_proto1_linkready() {
        let frame = frame_of(&[0xFD, 0xE2, 0x11, 0x22, 0x77, 0x1F, 0x40, 0, 0, 0, 0, 0, 0]);
        match Message::decode(&frame).unwrap() {
            Message::SlaveLinkready {
                sender,
                sign,
                max_amps,
                protocol,
            } => {
                assert_eq!(sender, TwcId::new(0x11, 0x22));
                assert_eq!(sign, 0x77);
                assert!((max_amps - 80.0).abs() < f64::EPSILON);
                assert_eq!(protocol, ProtocolVersion::V1);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_proto2_linkready() {
        let frame = frame_of(&[0xFD, 0xE2, 0x33, 0x44, 0x01, 0x0C, 0x80, 0, 0, 0, 0, 0, 0, 0, 0]);
        let msg = Message::decode(&frame).unwrap();
        assert!(matches!(
            msg,
            Message::SlaveLinkready { protocol: ProtocolVersion::V2, max_amps, .. } if (max_amps - 32.0).abs() < 1e-9
        ));
    }

    #[test]
    fn test_decode_slave_heartbeat() {
        let data = SlaveHeartbeat::encode(SlaveStatus::Charging, 24.0, 21.5);
        let mut payload = vec![0xFD, 0xE0, 0x11, 0x22, 0x77, 0x77];
        payload.extend(data);
        let msg = Message::decode(&frame_of(&payload)).unwrap();
        let Message::SlaveHeartbeat {
            sender,
            receiver,
            heartbeat,
        } = msg
        else {
            panic!("not a heartbeat");
        };
        assert_eq!(sender, TwcId::new(0x11, 0x22));
        assert_eq!(receiver, TwcId::new(0x77, 0x77));
        assert_eq!(heartbeat.state, SlaveStatus::Charging);
        assert!((heartbeat.amps_max - 24.0).abs() < 1e-9);
        assert!((heartbeat.amps_actual - 21.5).abs() < 1e-9);
    }

    #[test]
    fn test_decode_voltage_response() {
        let msg = Message::VoltageResponse {
            sender: TwcId::new(0x11, 0x22),
            lifetime_kwh: 1234,
            volts: [240, 241, 0],
        };
        let payload = msg.encode().unwrap();
        assert_eq!(payload.len() + 1, crate::frame::VOLTAGE_RESPONSE_LEN);
        assert_eq!(Message::decode(&frame_of(&payload)).unwrap(), msg);
    }

    #[test]
    fn test_vin_reply_strips_padding() {
        let payload = [
            0xFD, 0xF1, 0x11, 0x22, b'1', b'2', b'3', 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        let msg = Message::decode(&frame_of(&payload)).unwrap();
        assert_eq!(
            msg,
            Message::VinReply {
                sender: TwcId::new(0x11, 0x22),
                part: VinPart::Third,
                text: "123".into(),
            }
        );
    }

    #[test]
    fn test_master_heartbeat_layout() {
        let data = HeartbeatData::set_amps(ProtocolVersion::V1, 24.0);
        let msg = Message::MasterHeartbeat {
            sender: TwcId::new(0x77, 0x77),
            receiver: TwcId::new(0x11, 0x22),
            data: data.for_protocol(ProtocolVersion::V1).to_vec(),
        };
        assert_eq!(
            msg.encode().unwrap(),
            vec![0xFB, 0xE0, 0x77, 0x77, 0x11, 0x22, 0x05, 0x09, 0x60, 0, 0, 0, 0]
        );
        let v2 = HeartbeatData::set_amps(ProtocolVersion::V2, 40.0);
        assert_eq!(v2.command(), MasterCommand::SetAmpsCharging);
        assert_eq!(&v2.0[..3], &[0x09, 0x0F, 0xA0]);
        assert!((v2.amps() - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_outbound_lengths() {
        let us = TwcId::new(0x77, 0x77);
        let them = TwcId::new(0x11, 0x22);
        let proto1 = [
            Message::MasterLinkready1 { sender: us, sign: 1 },
            Message::MasterLinkready2 { sender: us, sign: 1 },
        ];
        for msg in proto1 {
            assert_eq!(msg.encode().unwrap().len() + 1, 14, "{}", msg.name());
        }
        let proto2 = [
            Message::VoltageRequest { sender: us, receiver: them },
            Message::GetVin { sender: us, receiver: them, part: VinPart::Second },
            Message::StartCharging { sender: us, receiver: them },
            Message::StopCharging { sender: us, receiver: them },
            Message::IdleTwoHours,
        ];
        for msg in proto2 {
            let payload = msg.encode().unwrap();
            assert_eq!(payload.len() + 1, 16, "{}", msg.name());
            assert_eq!(Message::decode(&frame_of(&payload)).unwrap(), msg);
        }
    }

    #[test]
    fn test_dangerous_commands_refused() {
        for cmd in DANGEROUS_COMMANDS {
            let payload = [cmd[0], cmd[1], 0, 0, 0];
            assert_eq!(encode_raw(&payload), Err(ProtocolError::DangerousCommand(cmd)));
        }
        assert!(encode_raw(&[0xFB, 0xE0, 0, 0]).is_ok());
    }

    #[test]
    fn test_unknown_command() {
        let frame = frame_of(&[0xFD, 0x99, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            Message::decode(&frame),
            Err(ProtocolError::UnknownCommand([0xFD, 0x99]))
        );
    }
}
