//! The wire frame codec.
//!
//! Every transport frame is one virtual-L2 payload carried under ethertype
//! [`ETHERTYPE`]. A fixed 12-byte header names the opcode and the 24-bit
//! source and destination ports; the remainder is an opcode-specific body.
//! All integers are network byte order.
//!
//! ```text
//! +----+-------+------------+------+----------+------+----------+
//! | op | flags | version=1  | zero | dst_port | zero | src_port |
//! | 1  |   1   |   2 (BE)   |  1   |  3 (BE)  |  1   |  3 (BE)  |
//! +----+-------+------------+------+----------+------+----------+
//! ```

use crate::addr::{Port, PORT_MAX};
use crate::message::Message;
use thiserror::Error as ThisError;

/// The ethertype reserved for transport frames on the virtual network.
pub const ETHERTYPE: u16 = 0x0901;

/// The only wire version this engine speaks.
pub const VERSION: u16 = 0x0001;

/// The number of bytes in the fixed frame header.
pub const HEADER_OCTETS: usize = 12;

/// The number of bytes of header on a data frame (fixed header plus the
/// fragmentation subheader). Fragment payload capacity is the network MTU
/// minus this.
pub const DATA_HEADER_OCTETS: usize = HEADER_OCTETS + 8;

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// The final (or only) fragment of a message.
    Data = 0x00,
    /// A fragment with more fragments to follow.
    DataMf = 0x01,
    ConnReq = 0x10,
    ConnAck = 0x12,
    DiscReq = 0x20,
    PingReq = 0x30,
    PingAck = 0x32,
    Error = 0x40,
}

impl Opcode {
    pub fn from_wire(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Opcode::Data,
            0x01 => Opcode::DataMf,
            0x10 => Opcode::ConnReq,
            0x12 => Opcode::ConnAck,
            0x20 => Opcode::DiscReq,
            0x30 => Opcode::PingReq,
            0x32 => Opcode::PingAck,
            0x40 => Opcode::Error,
            _ => return None,
        })
    }
}

/// Single-byte error codes carried by [`Opcode::Error`] frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    Refused = 1,
    NotConn = 2,
    WrongSp = 3,
    Proto = 4,
    MsgSize = 5,
    Unknown = 6,
}

impl ErrorCode {
    /// Decodes a wire byte, folding unrecognized codes into `Unknown`.
    pub fn from_wire(value: u8) -> Self {
        match value {
            1 => ErrorCode::Refused,
            2 => ErrorCode::NotConn,
            3 => ErrorCode::WrongSp,
            4 => ErrorCode::Proto,
            5 => ErrorCode::MsgSize,
            _ => ErrorCode::Unknown,
        }
    }
}

/// The fixed header with the opcode still raw, so that a frame with an
/// unknown opcode can still be answered (the reply needs the ports).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub op: u8,
    pub dst_port: Port,
    pub src_port: Port,
}

/// The fragmentation subheader on data frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Message identifier, never zero on a valid frame.
    pub msg_id: u16,
    /// The fragment payload size used for every fragment but the last.
    pub frag_size: u16,
    /// This fragment's index in `[0, nfrags)`.
    pub frag_no: u16,
    /// Total fragment count for the message.
    pub nfrags: u16,
}

/// A decoded opcode-specific body. Data payloads borrow from the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body<'a> {
    Data {
        head: DataHeader,
        payload: &'a [u8],
        /// Whether more fragments follow (the `DATA_MF` opcode).
        more: bool,
    },
    ConnReq {
        sp_proto: u16,
    },
    ConnAck {
        sp_proto: u16,
    },
    DiscReq,
    PingReq,
    PingAck,
    Error {
        code: ErrorCode,
        reason: String,
    },
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected ethertype {0:#06x}")]
    WrongEthertype(u16),
    #[error("frame shorter than the fixed header")]
    HeaderTooShort,
    #[error("nonzero flags {0:#04x}")]
    FlagsSet(u8),
    #[error("unsupported version {0:#06x}")]
    BadVersion(u16),
    #[error("reserved header bytes not zero")]
    ReservedNonzero,
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("body too short for opcode {0:#04x}")]
    BodyTooShort(u8),
    #[error("body length does not match opcode {0:#04x}")]
    BodyLength(u8),
    #[error("inconsistent fragmentation fields")]
    BadFragment,
}

fn read_port(bytes: &[u8]) -> Port {
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

/// Validates the fixed header and splits it from the body.
///
/// Frames failing these checks are dropped by the caller without a reply;
/// nothing past the header can be trusted.
pub fn parse_header(ethertype: u16, frame: &[u8]) -> Result<(Header, &[u8]), ParseError> {
    if ethertype != ETHERTYPE {
        return Err(ParseError::WrongEthertype(ethertype));
    }
    if frame.len() < HEADER_OCTETS {
        return Err(ParseError::HeaderTooShort);
    }
    if frame[1] != 0 {
        return Err(ParseError::FlagsSet(frame[1]));
    }
    let version = u16::from_be_bytes([frame[2], frame[3]]);
    if version != VERSION {
        return Err(ParseError::BadVersion(version));
    }
    if frame[4] != 0 || frame[8] != 0 {
        return Err(ParseError::ReservedNonzero);
    }
    let header = Header {
        op: frame[0],
        dst_port: read_port(&frame[5..8]),
        src_port: read_port(&frame[9..12]),
    };
    Ok((header, &frame[HEADER_OCTETS..]))
}

/// Decodes an opcode-specific body.
///
/// A failure here means the sender spoke the framing but violated an
/// opcode's rules, so the caller can (and should) answer with a protocol
/// error.
pub fn parse_body<'a>(op: u8, body: &'a [u8]) -> Result<Body<'a>, ParseError> {
    let opcode = Opcode::from_wire(op).ok_or(ParseError::UnknownOpcode(op))?;
    match opcode {
        Opcode::Data | Opcode::DataMf => {
            if body.len() < 8 {
                return Err(ParseError::BodyTooShort(op));
            }
            let head = DataHeader {
                msg_id: u16::from_be_bytes([body[0], body[1]]),
                frag_size: u16::from_be_bytes([body[2], body[3]]),
                frag_no: u16::from_be_bytes([body[4], body[5]]),
                nfrags: u16::from_be_bytes([body[6], body[7]]),
            };
            let payload = &body[8..];
            let more = opcode == Opcode::DataMf;
            if head.msg_id == 0 || head.nfrags == 0 || head.frag_size == 0 {
                return Err(ParseError::BadFragment);
            }
            let index = u32::from(head.frag_no) + 1;
            if more {
                // Non-final fragments carry a full fragment and cannot be
                // the last index.
                if index >= u32::from(head.nfrags) || payload.len() != usize::from(head.frag_size) {
                    return Err(ParseError::BadFragment);
                }
            } else if index != u32::from(head.nfrags) || payload.len() > usize::from(head.frag_size)
            {
                return Err(ParseError::BadFragment);
            }
            Ok(Body::Data {
                head,
                payload,
                more,
            })
        }
        Opcode::ConnReq | Opcode::ConnAck => {
            if body.len() != 2 {
                return Err(ParseError::BodyLength(op));
            }
            let sp_proto = u16::from_be_bytes([body[0], body[1]]);
            Ok(match opcode {
                Opcode::ConnReq => Body::ConnReq { sp_proto },
                _ => Body::ConnAck { sp_proto },
            })
        }
        // Trailing bytes on the bodiless opcodes are tolerated.
        Opcode::DiscReq => Ok(Body::DiscReq),
        Opcode::PingReq => Ok(Body::PingReq),
        Opcode::PingAck => Ok(Body::PingAck),
        Opcode::Error => {
            if body.is_empty() {
                return Err(ParseError::BodyTooShort(op));
            }
            Ok(Body::Error {
                code: ErrorCode::from_wire(body[0]),
                reason: String::from_utf8_lossy(&body[1..]).into_owned(),
            })
        }
    }
}

fn push_header(out: &mut Vec<u8>, op: Opcode, dst: Port, src: Port) {
    debug_assert!(dst <= PORT_MAX && src <= PORT_MAX);
    out.push(op as u8);
    out.push(0);
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.push(0);
    out.extend_from_slice(&dst.to_be_bytes()[1..]);
    out.push(0);
    out.extend_from_slice(&src.to_be_bytes()[1..]);
}

/// Builds a data frame around one fragment of a message.
pub fn data_frame(dst: Port, src: Port, head: DataHeader, more: bool, payload: &Message) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATA_HEADER_OCTETS + payload.len());
    let op = if more { Opcode::DataMf } else { Opcode::Data };
    push_header(&mut out, op, dst, src);
    out.extend_from_slice(&head.msg_id.to_be_bytes());
    out.extend_from_slice(&head.frag_size.to_be_bytes());
    out.extend_from_slice(&head.frag_no.to_be_bytes());
    out.extend_from_slice(&head.nfrags.to_be_bytes());
    out.extend(payload.iter());
    out
}

/// Builds a connection request or acknowledgment frame.
pub fn conn_frame(op: Opcode, dst: Port, src: Port, sp_proto: u16) -> Vec<u8> {
    debug_assert!(matches!(op, Opcode::ConnReq | Opcode::ConnAck));
    let mut out = Vec::with_capacity(HEADER_OCTETS + 2);
    push_header(&mut out, op, dst, src);
    out.extend_from_slice(&sp_proto.to_be_bytes());
    out
}

/// Builds a bodiless frame (`DISC_REQ`, `PING_REQ`, `PING_ACK`).
pub fn bare_frame(op: Opcode, dst: Port, src: Port) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_OCTETS);
    push_header(&mut out, op, dst, src);
    out
}

/// Builds an error frame with a short human-readable reason.
pub fn error_frame(dst: Port, src: Port, code: ErrorCode, reason: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_OCTETS + 1 + reason.len());
    push_header(&mut out, Opcode::Error, dst, src);
    out.push(code as u8);
    out.extend_from_slice(reason.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(frame: &[u8]) -> Result<(Header, Body<'_>), ParseError> {
        let (header, rest) = parse_header(ETHERTYPE, frame)?;
        let body = parse_body(header.op, rest)?;
        Ok((header, body))
    }

    #[test]
    fn conn_req_round_trip() {
        let frame = conn_frame(Opcode::ConnReq, 9001, 0x812345, 16);
        let (header, body) = parse(&frame).unwrap();
        assert_eq!(header.dst_port, 9001);
        assert_eq!(header.src_port, 0x812345);
        assert_eq!(body, Body::ConnReq { sp_proto: 16 });
    }

    #[test]
    fn data_frame_round_trip() {
        let head = DataHeader {
            msg_id: 7,
            frag_size: 4,
            frag_no: 1,
            nfrags: 3,
        };
        let frame = data_frame(2, 3, head, true, &Message::new(b"abcd".as_slice()));
        let (header, body) = parse(&frame).unwrap();
        assert_eq!(header.op, Opcode::DataMf as u8);
        match body {
            Body::Data {
                head: parsed,
                payload,
                more,
            } => {
                assert_eq!(parsed, head);
                assert_eq!(payload, b"abcd");
                assert!(more);
            }
            other => panic!("unexpected body {other:?}"),
        }
    }

    #[test]
    fn final_fragment_may_be_short() {
        let head = DataHeader {
            msg_id: 7,
            frag_size: 100,
            frag_no: 2,
            nfrags: 3,
        };
        let frame = data_frame(2, 3, head, false, &Message::new(b"tail".as_slice()));
        assert!(parse(&frame).is_ok());
    }

    #[test]
    fn rejects_wrong_ethertype() {
        let frame = bare_frame(Opcode::PingReq, 1, 2);
        assert_eq!(
            parse_header(0x0800, &frame),
            Err(ParseError::WrongEthertype(0x0800))
        );
    }

    #[test]
    fn rejects_short_header() {
        assert_eq!(
            parse_header(ETHERTYPE, &[0u8; 11]),
            Err(ParseError::HeaderTooShort)
        );
    }

    #[test]
    fn rejects_flags_version_and_reserved() {
        let good = bare_frame(Opcode::PingReq, 1, 2);

        let mut flags = good.clone();
        flags[1] = 0x80;
        assert_eq!(parse_header(ETHERTYPE, &flags), Err(ParseError::FlagsSet(0x80)));

        let mut version = good.clone();
        version[3] = 2;
        assert_eq!(
            parse_header(ETHERTYPE, &version),
            Err(ParseError::BadVersion(2))
        );

        for index in [4usize, 8] {
            let mut reserved = good.clone();
            reserved[index] = 1;
            assert_eq!(
                parse_header(ETHERTYPE, &reserved),
                Err(ParseError::ReservedNonzero)
            );
        }
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut frame = bare_frame(Opcode::PingReq, 1, 2);
        frame[0] = 0x77;
        let (header, rest) = parse_header(ETHERTYPE, &frame).unwrap();
        assert_eq!(parse_body(header.op, rest), Err(ParseError::UnknownOpcode(0x77)));
    }

    #[test]
    fn rejects_conn_req_length_mismatch() {
        let mut frame = conn_frame(Opcode::ConnReq, 1, 2, 16);
        frame.push(0);
        let (header, rest) = parse_header(ETHERTYPE, &frame).unwrap();
        assert_eq!(
            parse_body(header.op, rest),
            Err(ParseError::BodyLength(Opcode::ConnReq as u8))
        );
    }

    #[test]
    fn rejects_mf_on_last_index() {
        let head = DataHeader {
            msg_id: 1,
            frag_size: 4,
            frag_no: 2,
            nfrags: 3,
        };
        let frame = data_frame(1, 2, head, true, &Message::new(b"abcd".as_slice()));
        let (header, rest) = parse_header(ETHERTYPE, &frame).unwrap();
        assert_eq!(parse_body(header.op, rest), Err(ParseError::BadFragment));
    }

    #[test]
    fn rejects_short_nonfinal_fragment() {
        let head = DataHeader {
            msg_id: 1,
            frag_size: 8,
            frag_no: 0,
            nfrags: 3,
        };
        let frame = data_frame(1, 2, head, true, &Message::new(b"abcd".as_slice()));
        let (header, rest) = parse_header(ETHERTYPE, &frame).unwrap();
        assert_eq!(parse_body(header.op, rest), Err(ParseError::BadFragment));
    }

    #[test]
    fn rejects_zero_msg_id() {
        let head = DataHeader {
            msg_id: 0,
            frag_size: 4,
            frag_no: 0,
            nfrags: 1,
        };
        let frame = data_frame(1, 2, head, false, &Message::new(b"ab".as_slice()));
        let (header, rest) = parse_header(ETHERTYPE, &frame).unwrap();
        assert_eq!(parse_body(header.op, rest), Err(ParseError::BadFragment));
    }

    #[test]
    fn error_frame_round_trip() {
        let frame = error_frame(1, 2, ErrorCode::MsgSize, "too big");
        let (_, body) = parse(&frame).unwrap();
        assert_eq!(
            body,
            Body::Error {
                code: ErrorCode::MsgSize,
                reason: "too big".into()
            }
        );
    }

    #[test]
    fn unknown_error_code_folds() {
        assert_eq!(ErrorCode::from_wire(0xEE), ErrorCode::Unknown);
    }

    #[test]
    fn ping_tolerates_trailing_bytes() {
        let mut frame = bare_frame(Opcode::PingReq, 1, 2);
        frame.extend_from_slice(b"junk");
        assert!(parse(&frame).is_ok());
    }
}
