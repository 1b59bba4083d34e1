//! On-disk packet and section framing.
//!
//! All multi-byte integers are little-endian. A compressed vector binary
//! section looks like:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Section header (32 bytes)                                   │
//! │  - section id: u8 = 1                                        │
//! │  - reserved: 7 bytes                                         │
//! │  - section logical length: u64                               │
//! │  - data logical offset: u64                                  │
//! │  - index logical offset: u64                                 │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Data packets (repeated)                                     │
//! │  - packet type: u8 = 1                                       │
//! │  - packet flags: u8                                          │
//! │  - packet logical length minus 1: u16                        │
//! │  - bytestream count: u16                                     │
//! │  - bytestream lengths: u16 × count                           │
//! │  - bytestreams, concatenated; packet padded to 4 bytes       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Index packets (repeated)                                    │
//! │  - packet type: u8 = 0                                       │
//! │  - packet flags: u8                                          │
//! │  - packet logical length minus 1: u16                        │
//! │  - entry count: u16                                          │
//! │  - index level: u8                                           │
//! │  - reserved: 9 bytes                                         │
//! │  - entries: (record: u64, packet logical offset: u64) × count│
//! └──────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{Error, ErrorKind, Result};

/// Packet type tag of an index packet.
pub const INDEX_PACKET_TYPE: u8 = 0;

/// Packet type tag of a data packet.
pub const DATA_PACKET_TYPE: u8 = 1;

/// Largest serialized packet, in bytes.
pub const MAX_PACKET_LENGTH: usize = 0x1_0000;

/// Packets are padded to this alignment.
pub const PACKET_ALIGNMENT: usize = 4;

/// Serialized size of the fixed data packet header prefix.
pub const DATA_PACKET_HEADER_SIZE: usize = 6;

/// Serialized size of the index packet header.
pub const INDEX_PACKET_HEADER_SIZE: usize = 16;

/// Serialized size of one index entry.
pub const INDEX_ENTRY_SIZE: usize = 16;

/// Serialized size of the section header.
pub const SECTION_HEADER_SIZE: usize = 32;

/// Section id tag of a compressed vector binary section.
pub const COMPRESSED_VECTOR_SECTION_ID: u8 = 1;

/// Largest number of entries one index packet can carry.
pub const MAX_INDEX_ENTRIES: usize =
    (MAX_PACKET_LENGTH - INDEX_PACKET_HEADER_SIZE) / INDEX_ENTRY_SIZE;

/// Header of a compressed vector binary section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionHeader {
    /// Logical length of the whole section, header included.
    pub section_logical_length: u64,
    /// Logical offset of the first data packet.
    pub data_logical_offset: u64,
    /// Logical offset of the first index packet.
    pub index_logical_offset: u64,
}

impl SectionHeader {
    /// Serializes the header to its fixed 32-byte layout.
    pub fn to_bytes(&self) -> [u8; SECTION_HEADER_SIZE] {
        let mut out = [0u8; SECTION_HEADER_SIZE];
        out[0] = COMPRESSED_VECTOR_SECTION_ID;
        out[8..16].copy_from_slice(&self.section_logical_length.to_le_bytes());
        out[16..24].copy_from_slice(&self.data_logical_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.index_logical_offset.to_le_bytes());
        out
    }

    /// Parses and validates a serialized section header.
    pub fn from_bytes(bytes: &[u8; SECTION_HEADER_SIZE]) -> Result<Self> {
        if bytes[0] != COMPRESSED_VECTOR_SECTION_ID {
            return Err(Error::new(
                ErrorKind::BadCVHeader,
                format!("unknown section id {}", bytes[0]),
            ));
        }
        let header = Self {
            section_logical_length: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            data_logical_offset: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            index_logical_offset: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
        };
        if header.data_logical_offset > header.index_logical_offset {
            return Err(Error::new(
                ErrorKind::BadCVHeader,
                "data region begins after the index region",
            ));
        }
        Ok(header)
    }
}

/// The 4-byte prefix shared by every packet type: tag, flags, and the
/// serialized length minus one.
#[derive(Debug, Clone, Copy)]
pub struct PacketPrefix {
    /// Packet type tag.
    pub packet_type: u8,
    /// Packet flags; currently always zero.
    pub flags: u8,
    /// Full serialized packet length in bytes.
    pub length: usize,
}

impl PacketPrefix {
    /// Parses the common packet prefix.
    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        Self {
            packet_type: bytes[0],
            flags: bytes[1],
            length: u16::from_le_bytes([bytes[2], bytes[3]]) as usize + 1,
        }
    }
}

/// One data packet: a run of whole records, one bytestream per prototype
/// field in prototype order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    /// Packet flags; currently always zero.
    pub flags: u8,
    /// One bytestream per prototype field.
    pub streams: Vec<Vec<u8>>,
}

impl DataPacket {
    /// Serialized size for the given stream lengths, padding included.
    pub fn serialized_size(stream_lengths: impl Iterator<Item = usize>) -> usize {
        let mut size = DATA_PACKET_HEADER_SIZE;
        for len in stream_lengths {
            size += 2 + len;
        }
        size.next_multiple_of(PACKET_ALIGNMENT)
    }

    /// Serializes the packet, padded to [`PACKET_ALIGNMENT`].
    ///
    /// # Errors
    ///
    /// `BadAPIArgument` if a bytestream exceeds 65535 bytes or the whole
    /// packet exceeds [`MAX_PACKET_LENGTH`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let total = Self::serialized_size(self.streams.iter().map(Vec::len));
        if total > MAX_PACKET_LENGTH {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!("packet of {total} bytes exceeds {MAX_PACKET_LENGTH}"),
            ));
        }
        let mut out = Vec::with_capacity(total);
        out.push(DATA_PACKET_TYPE);
        out.push(self.flags);
        out.extend_from_slice(&((total - 1) as u16).to_le_bytes());
        out.extend_from_slice(&(self.streams.len() as u16).to_le_bytes());
        for stream in &self.streams {
            if stream.len() > u16::MAX as usize {
                return Err(Error::new(
                    ErrorKind::BadAPIArgument,
                    format!("bytestream of {} bytes exceeds {}", stream.len(), u16::MAX),
                ));
            }
            out.extend_from_slice(&(stream.len() as u16).to_le_bytes());
        }
        for stream in &self.streams {
            out.extend_from_slice(stream);
        }
        out.resize(total, 0);
        Ok(out)
    }

    /// Parses a serialized data packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DATA_PACKET_HEADER_SIZE {
            return Err(Error::new(ErrorKind::BadCVPacket, "truncated data packet"));
        }
        let prefix = PacketPrefix::from_bytes(&bytes[0..4].try_into().unwrap());
        if prefix.packet_type != DATA_PACKET_TYPE {
            return Err(Error::new(
                ErrorKind::BadCVPacket,
                format!("expected data packet, got type {}", prefix.packet_type),
            ));
        }
        if prefix.length > bytes.len() {
            return Err(Error::new(
                ErrorKind::BadCVPacket,
                format!(
                    "packet claims {} bytes but only {} are present",
                    prefix.length,
                    bytes.len()
                ),
            ));
        }
        let count = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let lengths_end = DATA_PACKET_HEADER_SIZE + 2 * count;
        if lengths_end > prefix.length {
            return Err(Error::new(
                ErrorKind::BadCVPacket,
                "bytestream length table overruns the packet",
            ));
        }
        let mut streams = Vec::with_capacity(count);
        let mut cursor = lengths_end;
        for i in 0..count {
            let at = DATA_PACKET_HEADER_SIZE + 2 * i;
            let len = u16::from_le_bytes([bytes[at], bytes[at + 1]]) as usize;
            if cursor + len > prefix.length {
                return Err(Error::new(
                    ErrorKind::BadCVPacket,
                    format!("bytestream {i} overruns the packet"),
                ));
            }
            streams.push(bytes[cursor..cursor + len].to_vec());
            cursor += len;
        }
        Ok(Self {
            flags: prefix.flags,
            streams,
        })
    }
}

/// One record-number-to-packet-offset index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Number of the first record stored in the referenced packet.
    pub record: u64,
    /// Logical offset of the referenced data packet.
    pub packet_offset: u64,
}

/// An index packet mapping record numbers to data packet offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPacket {
    /// Index level; 0 for leaf entries addressing data packets directly.
    pub level: u8,
    /// Entries in ascending record order.
    pub entries: Vec<IndexEntry>,
}

impl IndexPacket {
    /// Serialized size for the given entry count, padding included.
    pub fn serialized_size(entry_count: usize) -> usize {
        (INDEX_PACKET_HEADER_SIZE + entry_count * INDEX_ENTRY_SIZE)
            .next_multiple_of(PACKET_ALIGNMENT)
    }

    /// Serializes the packet.
    ///
    /// # Errors
    ///
    /// `BadAPIArgument` if more than [`MAX_INDEX_ENTRIES`] entries are
    /// present.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.entries.len() > MAX_INDEX_ENTRIES {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!("{} entries exceed {MAX_INDEX_ENTRIES}", self.entries.len()),
            ));
        }
        let total = Self::serialized_size(self.entries.len());
        let mut out = Vec::with_capacity(total);
        out.push(INDEX_PACKET_TYPE);
        out.push(0);
        out.extend_from_slice(&((total - 1) as u16).to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        out.push(self.level);
        out.extend_from_slice(&[0u8; 9]);
        for entry in &self.entries {
            out.extend_from_slice(&entry.record.to_le_bytes());
            out.extend_from_slice(&entry.packet_offset.to_le_bytes());
        }
        out.resize(total, 0);
        Ok(out)
    }

    /// Parses a serialized index packet.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < INDEX_PACKET_HEADER_SIZE {
            return Err(Error::new(ErrorKind::BadCVPacket, "truncated index packet"));
        }
        let prefix = PacketPrefix::from_bytes(&bytes[0..4].try_into().unwrap());
        if prefix.packet_type != INDEX_PACKET_TYPE {
            return Err(Error::new(
                ErrorKind::BadCVPacket,
                format!("expected index packet, got type {}", prefix.packet_type),
            ));
        }
        let count = u16::from_le_bytes([bytes[4], bytes[5]]) as usize;
        let level = bytes[6];
        let needed = INDEX_PACKET_HEADER_SIZE + count * INDEX_ENTRY_SIZE;
        if needed > prefix.length || prefix.length > bytes.len() {
            return Err(Error::new(
                ErrorKind::BadCVPacket,
                "index entry table overruns the packet",
            ));
        }
        let mut entries = Vec::with_capacity(count);
        for i in 0..count {
            let at = INDEX_PACKET_HEADER_SIZE + i * INDEX_ENTRY_SIZE;
            entries.push(IndexEntry {
                record: u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap()),
                packet_offset: u64::from_le_bytes(bytes[at + 8..at + 16].try_into().unwrap()),
            });
        }
        Ok(Self { level, entries })
    }
}
