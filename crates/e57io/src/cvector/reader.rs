//! Block-iterator read engine for compressed vector streams.

use super::{bind_buffers, rebind_buffers, BoundField, CompressedVectorNode};
use crate::codec::packet::{
    DataPacket, IndexEntry, IndexPacket, PacketPrefix, SectionHeader, INDEX_PACKET_HEADER_SIZE,
    SECTION_HEADER_SIZE,
};
use crate::codec::BitUnpacker;
use crate::error::{Error, ErrorKind, Result};
use crate::imagefile::ImageFileBody;
use crate::sourcedest::SourceDestBuffer;
use std::rc::Rc;
use tracing::{debug, warn};

/// Decode position inside one data packet.
#[derive(Debug)]
struct PacketCursor {
    /// One persistent bit cursor per prototype field.
    streams: Vec<BitUnpacker>,
    /// Records of this packet not yet delivered.
    records_left: u64,
}

/// A block iterator transferring records from a compressed vector's binary
/// section into bound destination buffers.
///
/// Each `read` call delivers up to the buffers' capacity, returning fewer
/// only at the end of the stream and zero forever after. Decoder state
/// (the per-field bit cursors of the current packet) persists across
/// calls, so reads may stop mid-packet.
#[derive(Debug)]
pub struct CompressedVectorReader {
    file: Rc<ImageFileBody>,
    node: CompressedVectorNode,
    fields: Vec<BoundField>,
    index: Vec<IndexEntry>,
    record_count: u64,
    next_record: u64,
    cursor: Option<PacketCursor>,
    open: bool,
    sick: Option<Error>,
}

impl CompressedVectorReader {
    pub(crate) fn open(
        node: CompressedVectorNode,
        buffers: &[SourceDestBuffer],
    ) -> Result<Self> {
        let file = node.node().body.usable_file()?;
        if file.writer_count.get() > 0 {
            return Err(Error::new(
                ErrorKind::TooManyReaders,
                "a writer is open on this image file",
            ));
        }
        if !node.is_attached() {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                "compressed vector must be attached before reading",
            ));
        }
        let fields = bind_buffers(&node.state().prototype, buffers)?;
        let record_count = node.state().record_count.get();

        let index = match node.state().section_offset.get() {
            Some(section_offset) => {
                Self::load_index(&file, section_offset).map_err(|e| file.sicken(e))?
            }
            None if record_count == 0 => Vec::new(),
            None => {
                return Err(Error::new(
                    ErrorKind::BadCVHeader,
                    "compressed vector declares records but has no binary section",
                ))
            }
        };

        file.reader_count.set(file.reader_count.get() + 1);
        debug!(
            record_count,
            packets = index.len(),
            "compressed vector reader opened"
        );
        Ok(Self {
            file,
            node,
            fields,
            index,
            record_count,
            next_record: 0,
            cursor: None,
            open: true,
            sick: None,
        })
    }

    /// Reads the section header and collects every index entry.
    fn load_index(file: &Rc<ImageFileBody>, section_offset: u64) -> Result<Vec<IndexEntry>> {
        let mut header_bytes = [0u8; SECTION_HEADER_SIZE];
        file.paged
            .borrow_mut()
            .read_logical(section_offset, &mut header_bytes)?;
        let header = SectionHeader::from_bytes(&header_bytes)?;

        let section_end = section_offset + header.section_logical_length;
        let mut entries = Vec::new();
        let mut offset = header.index_logical_offset;
        while offset < section_end {
            let mut prefix_bytes = [0u8; INDEX_PACKET_HEADER_SIZE];
            file.paged
                .borrow_mut()
                .read_logical(offset, &mut prefix_bytes)?;
            let prefix = PacketPrefix::from_bytes(&prefix_bytes[0..4].try_into().unwrap());
            let mut packet_bytes = vec![0u8; prefix.length];
            file.paged
                .borrow_mut()
                .read_logical(offset, &mut packet_bytes)?;
            let packet = IndexPacket::from_bytes(&packet_bytes)?;
            entries.extend(packet.entries);
            offset += prefix.length as u64;
        }

        for pair in entries.windows(2) {
            if pair[1].record <= pair[0].record {
                return Err(Error::new(
                    ErrorKind::BadCVPacket,
                    "index entries are not strictly increasing",
                ));
            }
        }
        Ok(entries)
    }

    /// True while the reader accepts transfers.
    pub fn is_open(&self) -> bool {
        self.open && self.file.open.get() && !self.file.sick.get()
    }

    /// The compressed vector being read. Valid on a closed reader.
    pub fn compressed_vector_node(&self) -> CompressedVectorNode {
        self.node.clone()
    }

    fn check_state(&self) -> Result<()> {
        self.file.require_usable()?;
        if !self.open {
            return Err(Error::new(ErrorKind::ReaderNotOpen, "reader has been closed"));
        }
        if let Some(err) = &self.sick {
            return Err(err.clone().in_operation("read after earlier failure"));
        }
        Ok(())
    }

    /// Routes a failure into the sickness model: conversion and bounds
    /// errors sicken the reader; I/O, packet, and checksum errors sicken
    /// the container as well.
    fn fail(&mut self, err: Error) -> Error {
        if err.sickens_handle() {
            self.sick = Some(err.clone());
        }
        self.file.sicken(err)
    }

    /// Transfers up to the buffers' capacity records, filling positions
    /// `[0, n)`. Returns the number of records delivered; zero at and
    /// after the end of the stream.
    pub fn read(&mut self) -> Result<usize> {
        self.check_state()?;
        let capacity = self.fields[0].buffer.capacity();
        let mut delivered = 0usize;
        while delivered < capacity && self.next_record < self.record_count {
            self.deliver_one(delivered).map_err(|e| self.fail(e))?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Rebinds the destination buffers, then reads. Only the array
    /// handles and their common capacity may change.
    pub fn read_with(&mut self, buffers: &[SourceDestBuffer]) -> Result<usize> {
        self.check_state()?;
        rebind_buffers(&mut self.fields, buffers)?;
        self.read()
    }

    /// Decodes the next record into buffer position `slot`.
    fn deliver_one(&mut self, slot: usize) -> Result<()> {
        if self.cursor.as_ref().map_or(true, |c| c.records_left == 0) {
            self.load_packet_containing(self.next_record)?;
        }
        let cursor = match self.cursor.as_mut() {
            Some(cursor) => cursor,
            None => {
                return Err(Error::new(
                    ErrorKind::InternalError,
                    "packet cursor missing after load",
                ))
            }
        };
        for (field, stream) in self.fields.iter().zip(cursor.streams.iter_mut()) {
            let value = field.codec.decode(
                stream,
                field.buffer.kind(),
                field.buffer.do_conversion(),
                field.buffer.do_scaling(),
            )?;
            field.buffer.store().set(slot, value)?;
        }
        cursor.records_left -= 1;
        self.next_record += 1;
        Ok(())
    }

    /// Loads the data packet containing `record` and positions every
    /// field cursor on it.
    fn load_packet_containing(&mut self, record: u64) -> Result<()> {
        let slot = self.index.partition_point(|e| e.record <= record);
        if slot == 0 {
            return Err(Error::new(
                ErrorKind::BadCVPacket,
                format!("no data packet covers record {record}"),
            ));
        }
        let entry = self.index[slot - 1];
        let records_in_packet = match self.index.get(slot) {
            Some(next) => next.record - entry.record,
            None => self.record_count - entry.record,
        };

        let mut prefix_bytes = [0u8; 4];
        self.file
            .paged
            .borrow_mut()
            .read_logical(entry.packet_offset, &mut prefix_bytes)?;
        let prefix = PacketPrefix::from_bytes(&prefix_bytes);
        let mut packet_bytes = vec![0u8; prefix.length];
        self.file
            .paged
            .borrow_mut()
            .read_logical(entry.packet_offset, &mut packet_bytes)?;
        let packet = DataPacket::from_bytes(&packet_bytes)?;
        if packet.streams.len() != self.fields.len() {
            return Err(Error::new(
                ErrorKind::BadCVPacket,
                format!(
                    "packet carries {} bytestreams, prototype has {} fields",
                    packet.streams.len(),
                    self.fields.len()
                ),
            ));
        }

        let mut streams: Vec<BitUnpacker> = packet
            .streams
            .into_iter()
            .map(BitUnpacker::from_bytes)
            .collect();

        // Skip the records preceding the requested one inside this packet.
        let skip = record - entry.record;
        for (stream, field) in streams.iter_mut().zip(&self.fields) {
            for _ in 0..skip {
                field.codec.skip(stream)?;
            }
        }

        self.cursor = Some(PacketCursor {
            streams,
            records_left: records_in_packet - skip,
        });
        Ok(())
    }

    /// Positions the next read at `record_number`. Seeking to the record
    /// count (one past the last record) is permitted; the next read
    /// returns zero. Resets all per-field decoder state.
    pub fn seek(&mut self, record_number: u64) -> Result<()> {
        self.check_state()?;
        if record_number > self.record_count {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!(
                    "seek to record {record_number} beyond record count {}",
                    self.record_count
                ),
            ));
        }
        self.next_record = record_number;
        self.cursor = None;
        Ok(())
    }

    /// Ends the transfer and releases the reader count. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.cursor = None;
        self.file.reader_count.set(self.file.reader_count.get() - 1);
        debug!(delivered = self.next_record, "compressed vector reader closed");
        Ok(())
    }

    /// Checks the reader invariants: the node is attached, at least this
    /// reader is counted, and no writer coexists.
    pub fn check_invariant(&self) -> Result<()> {
        if !self.open || !self.file.open.get() {
            return Ok(());
        }
        if !self.node.is_attached() {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "reader's compressed vector is not attached",
            ));
        }
        if self.file.reader_count.get() < 1 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "reader count is zero while a reader is open",
            ));
        }
        if self.file.writer_count.get() != 0 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "a writer coexists with an open reader",
            ));
        }
        Ok(())
    }
}

impl Drop for CompressedVectorReader {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            self.file.reader_count.set(self.file.reader_count.get() - 1);
            warn!("compressed vector reader dropped without close");
        }
    }
}
