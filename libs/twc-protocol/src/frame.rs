//! SLIP-style framing for the TWC bus
//!
//! Every frame on the wire looks like `C0 <escaped payload + checksum> C0`.
//! The checksum is the low byte of the sum of every payload byte except the
//! first one, and it is appended before escaping.
//!
//! [`FrameReceiver`] is the incremental receive side. It is fed one byte at a
//! time by the bus loop and yields complete, unescaped [`Frame`]s.

use std::time::{Duration, Instant};

use crate::error::{ProtocolError, Result};

pub const END: u8 = 0xC0; // frame delimiter
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

/// Partial frames older than this are dropped
pub const PARTIAL_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

/// Unescaped frame lengths (checksum included) used by real TWCs
pub const PROTOCOL1_LEN: usize = 14;
pub const PROTOCOL2_LEN: usize = 16;
pub const VOLTAGE_RESPONSE_LEN: usize = 20;

/// Checksum over `payload[1..]`
pub fn checksum(payload: &[u8]) -> u8 {
    payload
        .iter()
        .skip(1)
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Escape `payload`, append its checksum and wrap it in delimiters
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let sum = checksum(payload);
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(END);
    for &b in payload.iter().chain(std::iter::once(&sum)) {
        match b {
            END => {
                out.push(ESC);
                out.push(ESC_END);
            },
            ESC => {
                out.push(ESC);
                out.push(ESC_ESC);
            },
            _ => out.push(b),
        }
    }
    out.push(END);
    out
}

/// Reverse the escaping of a frame body
///
/// Delimiters are left in place; an escape byte followed by anything other
/// than `DC`/`DD` is an error.
pub fn unescape(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut iter = raw.iter();
    while let Some(&b) = iter.next() {
        if b != ESC {
            out.push(b);
            continue;
        }
        match iter.next() {
            Some(&ESC_END) => out.push(END),
            Some(&ESC_ESC) => out.push(ESC),
            Some(&other) => return Err(ProtocolError::InvalidEscape(other)),
            None => return Err(ProtocolError::InvalidEscape(END)),
        }
    }
    Ok(out)
}

/// Unwrap a delimited wire frame and verify its checksum
///
/// Returns the payload without the checksum byte.
pub fn decode_frame(raw: &[u8]) -> Result<Vec<u8>> {
    let body = raw
        .strip_prefix(&[END])
        .and_then(|r| r.strip_suffix(&[END]))
        .ok_or(ProtocolError::MissingDelimiter)?;
    let mut msg = unescape(body)?;
    let actual = msg.pop().ok_or(ProtocolError::InvalidLength(0))?;
    let expected = checksum(&msg);
    if actual != expected {
        return Err(ProtocolError::ChecksumMismatch { expected, actual });
    }
    Ok(msg)
}

/// A verified, unescaped frame
///
/// `len()` is the wire length the hardware uses to tell protocol versions
/// apart: 14, 16 or 20 bytes including the checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    payload: Vec<u8>,
}

impl Frame {
    /// Accept an unescaped message (checksum included, delimiters stripped)
    pub fn from_unescaped(msg: &[u8]) -> Result<Self> {
        let len = msg.len();
        if !matches!(len, PROTOCOL1_LEN | PROTOCOL2_LEN | VOLTAGE_RESPONSE_LEN) {
            return Err(ProtocolError::InvalidLength(len));
        }
        let (payload, sum) = msg.split_at(len - 1);
        let expected = checksum(payload);
        if sum[0] != expected {
            return Err(ProtocolError::ChecksumMismatch {
                expected,
                actual: sum[0],
            });
        }
        Ok(Self {
            payload: payload.to_vec(),
        })
    }

    /// Build a frame around a payload we are about to send
    pub fn from_payload(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Length on the wire after unescaping, checksum included
    pub fn len(&self) -> usize {
        self.payload.len() + 1
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn command(&self) -> [u8; 2] {
        [
            self.payload.first().copied().unwrap_or(0),
            self.payload.get(1).copied().unwrap_or(0),
        ]
    }

    pub fn to_wire(&self) -> Vec<u8> {
        encode_frame(&self.payload)
    }
}

/// Outcome of feeding one byte to the receiver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Byte consumed, nothing complete yet
    Pending,
    /// Byte arrived outside of a frame and was dropped
    Ignored,
    /// A complete, verified frame
    Frame(Frame),
    /// A complete frame that failed verification
    Rejected(ProtocolError),
}

/// Incremental receive state machine
///
/// A frame is accepted only once at least 16 raw bytes have been collected
/// and a closing `C0` arrives. A `C0` seen while 1..=14 bytes are buffered
/// restarts the frame, since the previous one was truncated.
#[derive(Debug, Default)]
pub struct FrameReceiver {
    buf: Vec<u8>,
    last_byte_at: Option<Instant>,
}

impl FrameReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of the frame currently being collected
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, byte: u8, now: Instant) -> Received {
        self.last_byte_at = Some(now);

        if self.buf.is_empty() {
            if byte != END {
                return Received::Ignored;
            }
        } else if self.buf.len() < 15 && byte == END {
            tracing::trace!(
                "Dropping truncated frame of {} bytes: {}",
                self.buf.len(),
                crate::hex_str(&self.buf)
            );
            self.buf.clear();
        }

        self.buf.push(byte);
        if self.buf.len() >= 16 && byte == END {
            let raw = std::mem::take(&mut self.buf);
            return match decode_raw(&raw) {
                Ok(frame) => Received::Frame(frame),
                Err(e) => Received::Rejected(e),
            };
        }
        Received::Pending
    }

    /// Drop a partial frame once the line has been idle long enough
    ///
    /// Returns true if a partial frame was discarded.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.last_byte_at {
            Some(at) if !self.buf.is_empty() && now.duration_since(at) >= PARTIAL_FRAME_TIMEOUT => {
                tracing::debug!("Discarding partial frame of {} bytes after idle timeout", self.buf.len());
                self.buf.clear();
                true
            },
            _ => false,
        }
    }
}

fn decode_raw(raw: &[u8]) -> Result<Frame> {
    let body = raw
        .strip_prefix(&[END])
        .and_then(|r| r.strip_suffix(&[END]))
        .ok_or(ProtocolError::MissingDelimiter)?;
    Frame::from_unescaped(&unescape(body)?)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn feed(rx: &mut FrameReceiver, bytes: &[u8], now: Instant) -> Vec<Received> {
        bytes
            .iter()
            .map(|b| rx.push(*b, now))
            .filter(|r| !matches!(r, Received::Pending | Received::Ignored))
            .collect()
    }

    #[test]
    fn test_checksum_skips_first_byte() {
        let payload = [0xFD, 0xE2, 0x11, 0x22, 0x77, 0x1F, 0x40];
        let expected = (0xE2u32 + 0x11 + 0x22 + 0x77 + 0x1F + 0x40) as u8;
        assert_eq!(checksum(&payload), expected);
    }

    #[test]
    fn test_escaping() {
        let wire = encode_frame(&[0xFB, 0xC0, 0xDB]);
        // checksum C0 + DB = 0x9B
        assert_eq!(
            wire,
            vec![END, 0xFB, ESC, ESC_END, ESC, ESC_ESC, 0x9B, END]
        );
        assert_eq!(decode_frame(&wire).unwrap(), vec![0xFB, 0xC0, 0xDB]);
    }

    #[test]
    fn test_invalid_escape_rejected() {
        assert_eq!(unescape(&[0x01, ESC, 0x02]), Err(ProtocolError::InvalidEscape(0x02)));
    }

    #[test]
    fn test_receiver_accepts_proto1_frame() {
        let payload = [0xFD, 0xE2, 0x11, 0x22, 0x77, 0x1F, 0x40, 0, 0, 0, 0, 0, 0];
        let mut rx = FrameReceiver::new();
        let out = feed(&mut rx, &encode_frame(&payload), Instant::now());
        assert_eq!(out.len(), 1);
        match &out[0] {
            Received::Frame(f) => {
                assert_eq!(f.payload(), &payload);
                assert_eq!(f.len(), PROTOCOL1_LEN);
                assert_eq!(f.command(), [0xFD, 0xE2]);
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_receiver_ignores_noise_between_frames() {
        let payload = [0xFD, 0xE0, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut bytes = vec![0x55, 0xAA, 0x00];
        bytes.extend(encode_frame(&payload));
        bytes.extend([0x12, 0x34]);
        bytes.extend(encode_frame(&payload));
        let mut rx = FrameReceiver::new();
        let out = feed(&mut rx, &bytes, Instant::now());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|r| matches!(r, Received::Frame(_))));
    }

    #[test]
    fn test_receiver_restarts_on_early_delimiter() {
        let payload = [0xFD, 0xE0, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut bytes = vec![END, 0xFD, 0xE0, 0x01];
        bytes.extend(encode_frame(&payload));
        let mut rx = FrameReceiver::new();
        let out = feed(&mut rx, &bytes, Instant::now());
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Received::Frame(f) if f.payload() == payload));
    }

    #[test]
    fn test_receiver_rejects_bad_checksum() {
        let payload = [0xFD, 0xE0, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut wire = encode_frame(&payload);
        let n = wire.len();
        wire[n - 2] ^= 0x01;
        let mut rx = FrameReceiver::new();
        let out = feed(&mut rx, &wire, Instant::now());
        assert!(matches!(out[0], Received::Rejected(ProtocolError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_receiver_rejects_odd_length() {
        let payload = [0xFD, 0xE0, 1, 2, 3, 4, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let mut rx = FrameReceiver::new();
        let out = feed(&mut rx, &encode_frame(&payload), Instant::now());
        assert_eq!(out, vec![Received::Rejected(ProtocolError::InvalidLength(17))]);
    }

    #[test]
    #[traced_test]
    fn test_partial_frame_expires() {
        let start = Instant::now();
        let mut rx = FrameReceiver::new();
        feed(&mut rx, &[END, 0xFD, 0xE0, 0x11], start);
        assert_eq!(rx.pending(), 4);
        assert!(!rx.expire(start + Duration::from_millis(1999)));
        assert!(rx.expire(start + PARTIAL_FRAME_TIMEOUT));
        assert_eq!(rx.pending(), 0);
        assert!(logs_contain("Discarding partial frame of 4 bytes"));
    }
}
