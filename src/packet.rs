use crate::error::{UtpError, UtpResult};
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq_nr::SeqNr;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Fin = 1,
    State = 2,
    Reset = 3,
    Syn = 4,
}

/// A header extension. On the wire, extensions form a chain where each record announces the
///  type of its successor; here they are just a list in wire order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Extension {
    kind: u8,
    data: Bytes,
}

impl Extension {
    pub const SELECTIVE_ACK: u8 = 1;
    /// the length field is a single byte
    pub const MAX_LEN: usize = u8::MAX as usize;
    /// longest selective ack that is still a multiple of 4 bytes
    pub const MAX_SELECTIVE_ACK_LEN: usize = Self::MAX_LEN / 4 * 4;

    pub fn new(kind: u8, data: Bytes) -> UtpResult<Extension> {
        if data.len() > Self::MAX_LEN {
            return Err(UtpError::InvalidHeader(format!("extension of {} bytes exceeds the maximum of {}", data.len(), Self::MAX_LEN)));
        }
        Ok(Extension { kind, data })
    }

    pub fn kind(&self) -> u8 {
        self.kind
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Selective ack bitmasks are padded to a multiple of 4 bytes on the wire. Bits beyond
    ///  `MAX_SELECTIVE_ACK_LEN` bytes are dropped.
    pub fn selective_ack(bitmask: &[u8]) -> Extension {
        let bitmask = &bitmask[..bitmask.len().min(Self::MAX_SELECTIVE_ACK_LEN)];
        let padded_len = bitmask.len().div_ceil(4) * 4;
        let mut data = Vec::with_capacity(padded_len);
        data.extend_from_slice(bitmask);
        data.resize(padded_len, 0);
        Extension {
            kind: Self::SELECTIVE_ACK,
            data: data.into(),
        }
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub connection_id: u16,
    pub timestamp: u32,
    pub timestamp_diff: u32,
    pub window: u32,
    pub seq_nr: SeqNr,
    pub ack_nr: SeqNr,
    pub extensions: Vec<Extension>,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{{:?}#{} seq:{} ack:{} wnd:{}", self.packet_type, self.connection_id, self.seq_nr, self.ack_nr, self.window)?;
        for ext in &self.extensions {
            write!(f, " ext{}:{:?}", ext.kind, ext.data.as_ref())?;
        }
        write!(f, "}}")
    }
}

impl PacketHeader {
    pub const VERSION: u8 = 1;
    pub const FIXED_LEN: usize = 20;

    pub fn serialized_len(&self) -> usize {
        Self::FIXED_LEN + self.extensions.iter()
            .map(|ext| 2 + ext.data.len())
            .sum::<usize>()
    }

    pub fn selective_ack(&self) -> Option<&[u8]> {
        self.extensions.iter()
            .find(|ext| ext.kind == Extension::SELECTIVE_ACK)
            .map(|ext| ext.data.as_ref())
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        let packet_type: u8 = self.packet_type.into();
        buf.put_u8((packet_type << 4) | Self::VERSION);
        buf.put_u8(self.extensions.first().map(|ext| ext.kind).unwrap_or(0));
        buf.put_u16(self.connection_id);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.timestamp_diff);
        buf.put_u32(self.window);
        buf.put_u16(self.seq_nr.to_raw());
        buf.put_u16(self.ack_nr.to_raw());

        for (idx, ext) in self.extensions.iter().enumerate() {
            let next_kind = self.extensions.get(idx + 1)
                .map(|next| next.kind)
                .unwrap_or(0);
            buf.put_u8(next_kind);
            buf.put_u8(ext.data.len().prechecked_cast());
            buf.put_slice(&ext.data);
        }
    }

    /// Parses the header, leaving `buf` positioned at the start of the payload
    pub fn deser(buf: &mut impl Buf) -> UtpResult<PacketHeader> {
        if buf.remaining() < Self::FIXED_LEN {
            return Err(UtpError::InvalidHeader(format!("packet of {} bytes is shorter than the fixed header", buf.remaining())));
        }

        let type_and_version = buf.get_u8();
        if type_and_version & 0x0f != Self::VERSION {
            return Err(UtpError::InvalidHeader(format!("unsupported version {}", type_and_version & 0x0f)));
        }
        let packet_type = PacketType::try_from(type_and_version >> 4)
            .map_err(|e| UtpError::InvalidHeader(format!("unknown packet type {}", e.number)))?;

        let mut next_kind = buf.get_u8();
        let connection_id = buf.get_u16();
        let timestamp = buf.get_u32();
        let timestamp_diff = buf.get_u32();
        let window = buf.get_u32();
        let seq_nr = SeqNr::from_raw(buf.get_u16());
        let ack_nr = SeqNr::from_raw(buf.get_u16());

        let mut extensions = Vec::new();
        while next_kind != 0 {
            if buf.remaining() < 2 {
                return Err(UtpError::InvalidHeader("truncated extension header".to_string()));
            }
            let kind = next_kind;
            next_kind = buf.get_u8();
            let len: usize = buf.get_u8().safe_cast();
            if buf.remaining() < len {
                return Err(UtpError::InvalidHeader(format!("extension of {} bytes exceeds the remaining {} bytes", len, buf.remaining())));
            }
            extensions.push(Extension {
                kind,
                data: buf.copy_to_bytes(len),
            });
        }

        Ok(PacketHeader {
            packet_type,
            connection_id,
            timestamp,
            timestamp_diff,
            window,
            seq_nr,
            ack_nr,
            extensions,
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Bytes,
}

impl Packet {
    pub fn ser(&self, buf: &mut impl BufMut) {
        self.header.ser(buf);
        buf.put_slice(&self.payload);
    }

    pub fn deser(mut buf: Bytes) -> UtpResult<Packet> {
        let header = PacketHeader::deser(&mut buf)?;
        Ok(Packet {
            header,
            payload: buf,
        })
    }
}
