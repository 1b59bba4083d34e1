//! Columnar packet codec for compressed vector record streams.
//!
//! A compressed vector's binary section is a page-aligned run of *data
//! packets* followed by *index packets*, preceded by a 32-byte section
//! header. Each data packet interleaves one bytestream per prototype
//! field; integers are bit-packed against their declared bounds, floats
//! are stored as raw little-endian IEEE-754, and strings are
//! varint-length-prefixed UTF-8.

pub mod bitstream;
pub mod field;
pub mod packet;

pub use bitstream::{BitPacker, BitUnpacker};
pub use field::FieldCodec;
pub use packet::{DataPacket, IndexEntry, IndexPacket, SectionHeader};
