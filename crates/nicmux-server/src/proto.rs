//! Framed request/reply protocol between the server and the VM-side client.
//!
//! Every message is a fixed little-endian header followed by an optional
//! payload. Requests flow client to server; the server answers each with a
//! `Reply` and may emit unsolicited `Interrupt` events at any time.
//!
//! Layout (24 bytes):
//!
//! | field       | type | meaning                                      |
//! |-------------|------|----------------------------------------------|
//! | kind        | u16  | [`MessageKind`]                              |
//! | payload_len | u16  | bytes following the header                   |
//! | index       | u32  | region index / interrupt kind / vector       |
//! | offset      | u64  | byte offset, or IOVA for DMA messages        |
//! | len         | u32  | requested access length / DMA length (low)   |
//! | status      | i32  | reply status: 0 ok, negative errno otherwise |

use std::io::{self, Read, Write};

pub const HEADER_LEN: usize = 24;
/// Upper bound on any payload; larger frames are a protocol violation.
pub const MAX_PAYLOAD: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageKind {
    /// Layout/identity negotiation; the reply payload is the device layout.
    Hello = 1,
    ConfigRead = 2,
    ConfigWrite = 3,
    RegionRead = 4,
    RegionWrite = 5,
    /// Guest memory mapped for DMA visibility; `offset` is the IOVA.
    DmaMap = 6,
    DmaUnmap = 7,
    /// Device reset requested by the VM (typically at boot).
    Reset = 8,
    /// Interrupt mask/unmask state change: `index` is the kind, `offset` the
    /// first vector, `len` the vector count, `status` nonzero when masking.
    IrqState = 9,
    /// Orderly disconnect.
    Bye = 10,
    Reply = 0x80,
    /// Unsolicited interrupt delivery; `index` is the vector.
    Interrupt = 0x81,
}

impl MessageKind {
    pub fn from_u16(raw: u16) -> Option<Self> {
        Some(match raw {
            1 => Self::Hello,
            2 => Self::ConfigRead,
            3 => Self::ConfigWrite,
            4 => Self::RegionRead,
            5 => Self::RegionWrite,
            6 => Self::DmaMap,
            7 => Self::DmaUnmap,
            8 => Self::Reset,
            9 => Self::IrqState,
            10 => Self::Bye,
            0x80 => Self::Reply,
            0x81 => Self::Interrupt,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub kind: u16,
    pub index: u32,
    pub offset: u64,
    pub len: u32,
    pub status: i32,
}

impl Frame {
    pub fn request(kind: MessageKind) -> Self {
        Self {
            kind: kind as u16,
            index: 0,
            offset: 0,
            len: 0,
            status: 0,
        }
    }

    pub fn reply(status: i32) -> Self {
        Self {
            kind: MessageKind::Reply as u16,
            index: 0,
            offset: 0,
            len: 0,
            status,
        }
    }

    pub fn interrupt(vector: u32) -> Self {
        Self {
            kind: MessageKind::Interrupt as u16,
            index: vector,
            offset: 0,
            len: 0,
            status: 0,
        }
    }

    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::from_u16(self.kind)
    }

    fn encode(&self, payload_len: u16) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..2].copy_from_slice(&self.kind.to_le_bytes());
        out[2..4].copy_from_slice(&payload_len.to_le_bytes());
        out[4..8].copy_from_slice(&self.index.to_le_bytes());
        out[8..16].copy_from_slice(&self.offset.to_le_bytes());
        out[16..20].copy_from_slice(&self.len.to_le_bytes());
        out[20..24].copy_from_slice(&self.status.to_le_bytes());
        out
    }

    fn decode(raw: &[u8; HEADER_LEN]) -> (Self, usize) {
        let frame = Self {
            kind: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            index: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            offset: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            len: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
            status: i32::from_le_bytes(raw[20..24].try_into().unwrap()),
        };
        let payload_len = u16::from_le_bytes(raw[2..4].try_into().unwrap());
        (frame, usize::from(payload_len))
    }
}

/// Writes one frame with its payload.
pub fn write_frame(w: &mut impl Write, frame: &Frame, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "payload exceeds protocol maximum",
        ));
    }
    w.write_all(&frame.encode(payload.len() as u16))?;
    w.write_all(payload)?;
    Ok(())
}

/// Reads one frame with its payload. Returns `Ok(None)` on a clean EOF at a
/// frame boundary; a truncated frame or oversized payload is an error.
pub fn read_frame(r: &mut impl Read) -> io::Result<Option<(Frame, Vec<u8>)>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = r.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated frame header",
            ));
        }
        filled += n;
    }
    let (frame, payload_len) = Frame::decode(&header);
    if payload_len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "payload exceeds protocol maximum",
        ));
    }
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)?;
    Ok(Some((frame, payload)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_through_a_byte_stream() {
        let mut buf = Vec::new();
        let frame = Frame {
            kind: MessageKind::RegionWrite as u16,
            index: 3,
            offset: 0x1000,
            len: 4,
            status: 0,
        };
        write_frame(&mut buf, &frame, &[1, 2, 3, 4]).unwrap();

        let (decoded, payload) = read_frame(&mut buf.as_slice()).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(payload, vec![1, 2, 3, 4]);
        assert_eq!(decoded.message_kind(), Some(MessageKind::RegionWrite));
    }

    #[test]
    fn eof_at_a_frame_boundary_is_none() {
        let empty: &[u8] = &[];
        assert!(read_frame(&mut &*empty).unwrap().is_none());
    }

    #[test]
    fn truncated_header_is_an_error() {
        let short = [0u8; 7];
        let err = read_frame(&mut &short[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn oversized_payload_is_rejected_on_both_sides() {
        let big = vec![0u8; MAX_PAYLOAD + 1];
        let mut sink = Vec::new();
        assert!(write_frame(&mut sink, &Frame::reply(0), &big).is_err());

        let mut header = [0u8; HEADER_LEN];
        header[0..2].copy_from_slice(&(MessageKind::Reply as u16).to_le_bytes());
        header[2..4].copy_from_slice(&u16::MAX.to_le_bytes());
        let err = read_frame(&mut &header[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn unknown_kind_decodes_to_none() {
        let frame = Frame {
            kind: 0x7777,
            index: 0,
            offset: 0,
            len: 0,
            status: 0,
        };
        assert_eq!(frame.message_kind(), None);
    }
}
