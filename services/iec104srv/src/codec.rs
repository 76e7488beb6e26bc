//! APCI framing
//!
//! Every APDU is `0x68 <len> <c1> <c2> <c3> <c4> [asdu]` where `len` counts
//! the control field and the ASDU. The decoder keeps partial input in the
//! `Framed` buffer and only yields complete frames. Bytes before a start
//! octet are skipped; once a start octet is found any inconsistency in the
//! declared length or control field is fatal for the connection.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::asdu::MAX_ASDU_LENGTH;
use crate::error::{IecError, IecResult};

pub const START_BYTE: u8 = 0x68;
/// Control field only
pub const MIN_APDU_LENGTH: usize = 4;
pub const MAX_APDU_LENGTH: usize = 253;
/// Sequence numbers wrap at 2^15
pub const SEQ_MODULUS: u16 = 32768;

/// Unnumbered control functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UFunction {
    StartDtAct,
    StartDtCon,
    StopDtAct,
    StopDtCon,
    TestFrAct,
    TestFrCon,
}

impl UFunction {
    /// First control octet, including the `0b11` format bits
    pub fn control_byte(self) -> u8 {
        match self {
            Self::StartDtAct => 0x07,
            Self::StartDtCon => 0x0B,
            Self::StopDtAct => 0x13,
            Self::StopDtCon => 0x23,
            Self::TestFrAct => 0x43,
            Self::TestFrCon => 0x83,
        }
    }

    /// Exactly one function bit must be set
    pub fn from_control_byte(byte: u8) -> Option<Self> {
        match byte {
            0x07 => Some(Self::StartDtAct),
            0x0B => Some(Self::StartDtCon),
            0x13 => Some(Self::StopDtAct),
            0x23 => Some(Self::StopDtCon),
            0x43 => Some(Self::TestFrAct),
            0x83 => Some(Self::TestFrCon),
            _ => None,
        }
    }
}

impl fmt::Display for UFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StartDtAct => "STARTDT ACT",
            Self::StartDtCon => "STARTDT CON",
            Self::StopDtAct => "STOPDT ACT",
            Self::StopDtCon => "STOPDT CON",
            Self::TestFrAct => "TESTFR ACT",
            Self::TestFrCon => "TESTFR CON",
        };
        f.write_str(name)
    }
}

/// One APDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Information transfer, carrying an encoded ASDU
    I {
        send_seq: u16,
        recv_seq: u16,
        asdu: Bytes,
    },
    /// Supervisory acknowledgment
    S { recv_seq: u16 },
    /// Unnumbered control
    U(UFunction),
}

impl Frame {
    pub fn i_frame(send_seq: u16, recv_seq: u16, asdu: Bytes) -> Self {
        Self::I {
            send_seq,
            recv_seq,
            asdu,
        }
    }

    /// N(R) carried by I and S frames
    pub fn recv_seq(&self) -> Option<u16> {
        match self {
            Self::I { recv_seq, .. } | Self::S { recv_seq } => Some(*recv_seq),
            Self::U(_) => None,
        }
    }

    /// Bytes on the wire
    pub fn encoded_len(&self) -> usize {
        match self {
            Self::I { asdu, .. } => 2 + MIN_APDU_LENGTH + asdu.len(),
            _ => 2 + MIN_APDU_LENGTH,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I {
                send_seq,
                recv_seq,
                asdu,
            } => write!(
                f,
                "I(N(S)={}, N(R)={}, {} octets)",
                send_seq,
                recv_seq,
                asdu.len()
            ),
            Self::S { recv_seq } => write!(f, "S(N(R)={})", recv_seq),
            Self::U(function) => write!(f, "U({})", function),
        }
    }
}

fn put_seq(dst: &mut BytesMut, seq: u16) {
    let seq = seq % SEQ_MODULUS;
    dst.put_u8(((seq & 0x7F) << 1) as u8);
    dst.put_u8((seq >> 7) as u8);
}

fn read_seq(lo: u8, hi: u8) -> u16 {
    ((u16::from(hi) << 7) | (u16::from(lo) >> 1)) % SEQ_MODULUS
}

/// Parse the control field and payload of one complete APDU body
fn parse_apdu(body: Bytes) -> IecResult<Frame> {
    let (c1, c2, c3, c4) = (body[0], body[1], body[2], body[3]);

    if c1 & 0x01 == 0 {
        if body.len() == MIN_APDU_LENGTH {
            return Err(IecError::MalformedFrame("I-frame without ASDU".into()));
        }
        return Ok(Frame::I {
            send_seq: read_seq(c1, c2),
            recv_seq: read_seq(c3, c4),
            asdu: body.slice(MIN_APDU_LENGTH..),
        });
    }

    if body.len() != MIN_APDU_LENGTH {
        return Err(IecError::MalformedFrame(format!(
            "control frame with length {}",
            body.len()
        )));
    }

    if c1 & 0x03 == 0x01 {
        return Ok(Frame::S {
            recv_seq: read_seq(c3, c4),
        });
    }

    UFunction::from_control_byte(c1)
        .map(Frame::U)
        .ok_or_else(|| IecError::MalformedFrame(format!("invalid U-frame control 0x{:02X}", c1)))
}

/// Streaming decoder / encoder for [`Frame`]
#[derive(Debug, Clone, Default)]
pub struct ApciCodec {
    skipped: u64,
}

impl ApciCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Octets discarded while searching for a start byte
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped
    }
}

impl Decoder for ApciCodec {
    type Item = Frame;
    type Error = IecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, IecError> {
        if src.is_empty() {
            return Ok(None);
        }

        if src[0] != START_BYTE {
            let skip = src
                .iter()
                .position(|&b| b == START_BYTE)
                .unwrap_or(src.len());
            debug!("Skipping {} octets before start byte", skip);
            self.skipped += skip as u64;
            src.advance(skip);
            if src.is_empty() {
                return Ok(None);
            }
        }

        if src.len() < 2 {
            return Ok(None);
        }

        let length = usize::from(src[1]);
        if !(MIN_APDU_LENGTH..=MAX_APDU_LENGTH).contains(&length) {
            return Err(IecError::MalformedFrame(format!(
                "declared APDU length {} outside {}..={}",
                length, MIN_APDU_LENGTH, MAX_APDU_LENGTH
            )));
        }

        if src.len() < 2 + length {
            src.reserve(2 + length - src.len());
            return Ok(None);
        }

        src.advance(2);
        let body = src.split_to(length).freeze();
        parse_apdu(body).map(Some)
    }
}

impl Encoder<Frame> for ApciCodec {
    type Error = IecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), IecError> {
        dst.reserve(frame.encoded_len());
        match frame {
            Frame::I {
                send_seq,
                recv_seq,
                asdu,
            } => {
                if asdu.is_empty() || asdu.len() > MAX_ASDU_LENGTH {
                    return Err(IecError::MalformedFrame(format!(
                        "I-frame payload of {} octets (allowed 1..={})",
                        asdu.len(),
                        MAX_ASDU_LENGTH
                    )));
                }
                dst.put_u8(START_BYTE);
                dst.put_u8((MIN_APDU_LENGTH + asdu.len()) as u8);
                put_seq(dst, send_seq);
                put_seq(dst, recv_seq);
                dst.extend_from_slice(&asdu);
            },
            Frame::S { recv_seq } => {
                dst.put_slice(&[START_BYTE, MIN_APDU_LENGTH as u8, 0x01, 0x00]);
                put_seq(dst, recv_seq);
            },
            Frame::U(function) => {
                dst.put_slice(&[
                    START_BYTE,
                    MIN_APDU_LENGTH as u8,
                    function.control_byte(),
                    0x00,
                    0x00,
                    0x00,
                ]);
            },
        }
        Ok(())
    }
}
