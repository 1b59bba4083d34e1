//! Block-iterator write engine for compressed vector streams.

use super::{bind_buffers, rebind_buffers, BoundField, CompressedVectorNode};
use crate::codec::packet::{
    DataPacket, IndexEntry, IndexPacket, SectionHeader, MAX_INDEX_ENTRIES, MAX_PACKET_LENGTH,
    SECTION_HEADER_SIZE,
};
use crate::codec::BitPacker;
use crate::error::{Error, ErrorKind, Result};
use crate::imagefile::ImageFileBody;
use crate::sourcedest::SourceDestBuffer;
use std::rc::Rc;
use tracing::{debug, warn};

/// A block iterator transferring records from bound source buffers into a
/// compressed vector's binary section.
///
/// Records are batched into an internal packet buffer; a data packet is
/// flushed whenever the next record would exceed the packet size limit,
/// and on close. Closing also emits the index packets, writes the section
/// header, and patches the node's record count. Close is idempotent;
/// `write` after close fails with `WriterNotOpen`.
#[derive(Debug)]
pub struct CompressedVectorWriter {
    file: Rc<ImageFileBody>,
    node: CompressedVectorNode,
    fields: Vec<BoundField>,
    /// Per-field bit accumulators for the packet being assembled.
    pending: Vec<BitPacker>,
    pending_records: u64,
    records_flushed: u64,
    index: Vec<IndexEntry>,
    section_offset: u64,
    next_packet_offset: u64,
    open: bool,
    sick: Option<Error>,
}

impl CompressedVectorWriter {
    pub(crate) fn open(
        node: CompressedVectorNode,
        buffers: &[SourceDestBuffer],
    ) -> Result<Self> {
        let file = node.node().body.usable_file()?;
        if !file.writable {
            return Err(Error::new(ErrorKind::FileReadOnly, "compressed vector writer"));
        }
        if !node.is_attached() {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                "compressed vector must be attached before writing",
            ));
        }
        if file.writer_count.get() > 0 || file.reader_count.get() > 0 {
            return Err(Error::new(
                ErrorKind::TooManyWriters,
                format!(
                    "{} writers and {} readers already open",
                    file.writer_count.get(),
                    file.reader_count.get()
                ),
            ));
        }
        let fields = bind_buffers(&node.state().prototype, buffers)?;

        let section_offset = file.begin_section();
        let next_packet_offset = section_offset + SECTION_HEADER_SIZE as u64;
        let pending = fields.iter().map(|_| BitPacker::new()).collect();

        node.state().write_started.set(true);
        file.writer_count.set(file.writer_count.get() + 1);
        debug!(
            section_offset,
            field_count = fields.len(),
            "compressed vector writer opened"
        );
        Ok(Self {
            file,
            node,
            fields,
            pending,
            pending_records: 0,
            records_flushed: 0,
            index: Vec::new(),
            section_offset,
            next_packet_offset,
            open: true,
            sick: None,
        })
    }

    /// True while the writer accepts transfers.
    pub fn is_open(&self) -> bool {
        self.open && self.file.open.get() && !self.file.sick.get()
    }

    /// The compressed vector being written. Valid on a closed writer.
    pub fn compressed_vector_node(&self) -> CompressedVectorNode {
        self.node.clone()
    }

    fn check_state(&self) -> Result<()> {
        self.file.require_usable()?;
        if !self.open {
            return Err(Error::new(ErrorKind::WriterNotOpen, "writer has been closed"));
        }
        if let Some(err) = &self.sick {
            return Err(err.clone().in_operation("write after earlier failure"));
        }
        Ok(())
    }

    /// Transfers the first `record_count` records out of each bound
    /// buffer.
    ///
    /// A record that fails bounds validation (`ValueOutOfBounds`) leaves
    /// the writer usable and the packet buffer untouched; records before
    /// it in the same call have already been accepted.
    pub fn write(&mut self, record_count: usize) -> Result<()> {
        self.check_state()?;
        let capacity = self.fields[0].buffer.capacity();
        if record_count > capacity {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!("{record_count} records requested from buffers of capacity {capacity}"),
            ));
        }
        for record in 0..record_count {
            self.append_record(record).map_err(|e| self.fail(e))?;
        }
        Ok(())
    }

    /// Rebinds the source buffers, then transfers `record_count` records.
    /// Only the array handles and their common capacity may change.
    pub fn write_with(
        &mut self,
        buffers: &[SourceDestBuffer],
        record_count: usize,
    ) -> Result<()> {
        self.check_state()?;
        rebind_buffers(&mut self.fields, buffers)?;
        self.write(record_count)
    }

    /// Encodes one record into fresh per-field fragments, then commits
    /// them to the pending packet, flushing first if the packet would
    /// overflow.
    fn append_record(&mut self, record: usize) -> Result<()> {
        let mut fragments = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let mut fragment = BitPacker::new();
            let value = field.buffer.store().get(record);
            field
                .codec
                .encode(
                    &value,
                    field.buffer.do_conversion(),
                    field.buffer.do_scaling(),
                    &mut fragment,
                )
                .map_err(|e| e.in_operation("CompressedVectorWriter::write"))?;
            fragments.push(fragment);
        }

        if self.packet_size_with(&fragments) > MAX_PACKET_LENGTH {
            self.flush_packet()?;
            if self.packet_size_with(&fragments) > MAX_PACKET_LENGTH {
                return Err(Error::new(
                    ErrorKind::BadAPIArgument,
                    "a single record exceeds the maximum packet size",
                ));
            }
        }
        for (pending, fragment) in self.pending.iter_mut().zip(&fragments) {
            pending.append(fragment);
        }
        self.pending_records += 1;
        Ok(())
    }

    /// Serialized packet size if `fragments` were appended to the pending
    /// streams.
    fn packet_size_with(&self, fragments: &[BitPacker]) -> usize {
        DataPacket::serialized_size(
            self.pending
                .iter()
                .zip(fragments)
                .map(|(pending, fragment)| {
                    (pending.len_bits() + fragment.len_bits()).div_ceil(8)
                }),
        )
    }

    /// Writes the pending records as one data packet.
    fn flush_packet(&mut self) -> Result<()> {
        if self.pending_records == 0 {
            return Ok(());
        }
        let packet = DataPacket {
            flags: 0,
            streams: self
                .pending
                .iter_mut()
                .map(BitPacker::take_padded_bytes)
                .collect(),
        };
        let bytes = packet.to_bytes()?;
        self.file
            .paged
            .borrow_mut()
            .write_logical(self.next_packet_offset, &bytes)?;
        self.index.push(IndexEntry {
            record: self.records_flushed,
            packet_offset: self.next_packet_offset,
        });
        debug!(
            offset = self.next_packet_offset,
            bytes = bytes.len(),
            records = self.pending_records,
            "flushed data packet"
        );
        self.records_flushed += self.pending_records;
        self.next_packet_offset += bytes.len() as u64;
        self.pending_records = 0;
        Ok(())
    }

    /// Routes a failure into the sickness model: value errors leave the
    /// writer usable, conversion errors sicken the writer, I/O errors
    /// sicken the container as well.
    fn fail(&mut self, err: Error) -> Error {
        if err.sickens_handle() {
            self.sick = Some(err.clone());
        }
        self.file.sicken(err)
    }

    /// Flushes pending data, writes the index packets and section header,
    /// patches the node, and releases the writer count. Idempotent after
    /// the first successful call.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.file.writer_count.set(self.file.writer_count.get() - 1);

        if !self.file.open.get() || self.file.sick.get() || self.sick.is_some() {
            warn!(
                pending = self.pending_records,
                "writer closed in a failed state; section not finalized"
            );
            return Ok(());
        }

        let result = self.finish_section();
        match result {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn finish_section(&mut self) -> Result<()> {
        self.flush_packet()?;

        let index_offset = self.next_packet_offset;
        let mut cursor = index_offset;
        let mut written = 0usize;
        loop {
            let remaining = &self.index[written..];
            let take = remaining.len().min(MAX_INDEX_ENTRIES);
            let packet = IndexPacket {
                level: 0,
                entries: remaining[..take].to_vec(),
            };
            let bytes = packet.to_bytes()?;
            self.file.paged.borrow_mut().write_logical(cursor, &bytes)?;
            cursor += bytes.len() as u64;
            written += take;
            if written >= self.index.len() {
                break;
            }
        }

        let header = SectionHeader {
            section_logical_length: cursor - self.section_offset,
            data_logical_offset: self.section_offset + SECTION_HEADER_SIZE as u64,
            index_logical_offset: index_offset,
        };
        self.file
            .paged
            .borrow_mut()
            .write_logical(self.section_offset, &header.to_bytes())?;

        self.file.end_section(cursor);
        let state = self.node.state();
        state.record_count.set(self.records_flushed);
        state.section_offset.set(Some(self.section_offset));
        debug!(
            records = self.records_flushed,
            packets = self.index.len(),
            section_length = header.section_logical_length,
            "compressed vector writer closed"
        );
        Ok(())
    }

    /// Checks the writer invariants: the node is attached and this is the
    /// container's only open transfer.
    pub fn check_invariant(&self) -> Result<()> {
        if !self.open || !self.file.open.get() {
            return Ok(());
        }
        if !self.node.is_attached() {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "writer's compressed vector is not attached",
            ));
        }
        if self.file.writer_count.get() != 1 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                format!("writer count is {}, expected 1", self.file.writer_count.get()),
            ));
        }
        if self.file.reader_count.get() != 0 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "readers coexist with an open writer",
            ));
        }
        Ok(())
    }
}

impl Drop for CompressedVectorWriter {
    fn drop(&mut self) {
        if self.open {
            self.open = false;
            self.file.writer_count.set(self.file.writer_count.get() - 1);
            warn!(
                pending = self.pending_records,
                "compressed vector writer dropped without close; section not finalized"
            );
        }
    }
}
