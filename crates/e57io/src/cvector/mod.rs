//! Compressed vector nodes and their block-transfer engines.
//!
//! A [`CompressedVectorNode`] describes a homogeneous record stream: a
//! *prototype* (a structure of terminal typed nodes naming one record's
//! fields) plus a *codecs* vector, and, once written, the location of its
//! binary section. Records are moved in blocks by a
//! [`CompressedVectorWriter`] or [`CompressedVectorReader`] holding
//! caller-bound [`SourceDestBuffer`]s.

mod reader;
mod writer;

pub use reader::CompressedVectorReader;
pub use writer::CompressedVectorWriter;

use crate::codec::FieldCodec;
use crate::error::{Error, ErrorKind, Result};
use crate::imagefile::ImageFile;
use crate::node::{
    adopt, collect_terminal_fields, impl_node_common, CvState, Node, NodeBody, NodeType, Variant,
    VectorNode,
};
use crate::sourcedest::SourceDestBuffer;
use std::cell::Cell;
use std::rc::Rc;

/// One prototype field with its codec and its bound transfer buffer, in
/// prototype order.
#[derive(Debug)]
pub(crate) struct BoundField {
    pub(crate) path: String,
    pub(crate) codec: FieldCodec,
    pub(crate) buffer: SourceDestBuffer,
}

/// Validates the binding contract and pairs each prototype field with its
/// buffer, in prototype declaration order.
pub(crate) fn bind_buffers(
    prototype: &Rc<NodeBody>,
    buffers: &[SourceDestBuffer],
) -> Result<Vec<BoundField>> {
    let fields = collect_terminal_fields(prototype)?;

    for (i, buffer) in buffers.iter().enumerate() {
        if buffers[..i]
            .iter()
            .any(|other| other.path_name() == buffer.path_name())
        {
            return Err(Error::new(
                ErrorKind::BufferDuplicatePathName,
                format!("path {:?} bound more than once", buffer.path_name()),
            ));
        }
    }

    let mut bound = Vec::with_capacity(fields.len());
    for (path, node) in &fields {
        let buffer = buffers
            .iter()
            .find(|b| {
                let p = b.path_name().strip_prefix('/').unwrap_or(b.path_name());
                p == path
            })
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::PathUndefined,
                    format!("prototype field {path:?} has no bound buffer"),
                )
            })?;
        let codec = FieldCodec::from_prototype(node)?;
        codec.check_buffer_kind(buffer.kind(), path)?;
        bound.push(BoundField {
            path: path.clone(),
            codec,
            buffer: buffer.clone(),
        });
    }

    // Every buffer resolved to a field and there are no duplicates, so a
    // surplus cannot remain unless a path missed the prototype entirely.
    if buffers.len() > fields.len() {
        return Err(Error::new(
            ErrorKind::BufferSizeMismatch,
            format!(
                "{} buffers bound to a prototype of {} fields",
                buffers.len(),
                fields.len()
            ),
        ));
    }
    for buffer in buffers {
        let p = buffer.path_name().strip_prefix('/').unwrap_or(buffer.path_name());
        if !fields.iter().any(|(path, _)| path == p) {
            return Err(Error::new(
                ErrorKind::PathUndefined,
                format!("buffer path {:?} does not name a prototype field", buffer.path_name()),
            ));
        }
    }

    let capacity = bound[0].buffer.capacity();
    for field in &bound {
        if field.buffer.capacity() != capacity {
            return Err(Error::new(
                ErrorKind::BufferSizeMismatch,
                format!(
                    "buffer {:?} holds {} records, expected {capacity}",
                    field.path,
                    field.buffer.capacity()
                ),
            ));
        }
    }
    Ok(bound)
}

/// Replaces the buffers of an existing binding. Only the array handle and
/// capacity may change.
pub(crate) fn rebind_buffers(
    fields: &mut [BoundField],
    buffers: &[SourceDestBuffer],
) -> Result<()> {
    if buffers.len() != fields.len() {
        return Err(Error::new(
            ErrorKind::BufferSizeMismatch,
            format!("{} buffers supplied, {} bound", buffers.len(), fields.len()),
        ));
    }
    let mut replacements = Vec::with_capacity(fields.len());
    for field in fields.iter() {
        let replacement = buffers
            .iter()
            .find(|b| {
                let p = b.path_name().strip_prefix('/').unwrap_or(b.path_name());
                p == field.path
            })
            .ok_or_else(|| {
                Error::new(
                    ErrorKind::PathUndefined,
                    format!("rebinding is missing field {:?}", field.path),
                )
            })?;
        if !field.buffer.rebinding_matches(replacement) {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!(
                    "rebinding of {:?} may change only the array and capacity",
                    field.path
                ),
            ));
        }
        replacements.push(replacement.clone());
    }
    let capacity = buffers[0].capacity();
    if buffers.iter().any(|b| b.capacity() != capacity) {
        return Err(Error::new(
            ErrorKind::BufferSizeMismatch,
            "rebinding buffers have differing capacities",
        ));
    }
    for (field, replacement) in fields.iter_mut().zip(replacements) {
        field.buffer = replacement;
    }
    Ok(())
}

/// A node describing a compressed, homogeneous record stream.
#[derive(Debug, Clone)]
pub struct CompressedVectorNode {
    node: Node,
}

impl CompressedVectorNode {
    /// Creates a compressed vector with the given prototype and codecs
    /// vector. The prototype must be a structure of terminal typed nodes
    /// with at least one field; both subtrees become children of the new
    /// node.
    pub fn new(
        dest: &ImageFile,
        prototype: impl Into<Node>,
        codecs: VectorNode,
    ) -> Result<Self> {
        let file = dest.creation_body()?;
        if !file.writable {
            return Err(Error::new(ErrorKind::FileReadOnly, "compressed vector creation"));
        }
        Self::assemble(dest, prototype, codecs, 0, None)
    }

    /// Rebinds a compressed vector to an already-written binary section.
    /// Used by the schema layer when reconstructing a tree from the XML
    /// section of a file opened for reading.
    pub fn open_existing(
        dest: &ImageFile,
        prototype: impl Into<Node>,
        codecs: VectorNode,
        record_count: u64,
        data_packet_offset: u64,
    ) -> Result<Self> {
        let cv = Self::assemble(dest, prototype, codecs, record_count, Some(data_packet_offset))?;
        cv.state().write_started.set(true);
        Ok(cv)
    }

    fn assemble(
        dest: &ImageFile,
        prototype: impl Into<Node>,
        codecs: VectorNode,
        record_count: u64,
        section_offset: Option<u64>,
    ) -> Result<Self> {
        let file = dest.creation_body()?;
        let prototype: Node = prototype.into();
        let fields = collect_terminal_fields(&prototype.body)?;
        if fields.is_empty() {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                "prototype declares no record fields",
            ));
        }
        let codecs: Node = codecs.into();

        let body = NodeBody::new(
            &file,
            Variant::CompressedVector(CvState {
                prototype: Rc::clone(&prototype.body),
                codecs: Rc::clone(&codecs.body),
                record_count: Cell::new(record_count),
                section_offset: Cell::new(section_offset),
                write_started: Cell::new(false),
            }),
        );
        adopt(&body, &prototype.body, "prototype".to_string())?;
        adopt(&body, &codecs.body, "codecs".to_string())?;
        Ok(Self {
            node: Node::from_body(body),
        })
    }

    pub(crate) fn state(&self) -> &CvState {
        match &self.node.body.variant {
            Variant::CompressedVector(state) => state,
            _ => unreachable!("downcast guarantees the CompressedVector variant"),
        }
    }

    /// Number of records stored in the stream.
    pub fn record_count(&self) -> Result<u64> {
        self.node.body.usable_file()?;
        Ok(self.state().record_count.get())
    }

    /// The record template this stream was declared with.
    pub fn prototype(&self) -> Result<Node> {
        self.node.body.usable_file()?;
        Ok(Node::from_body(Rc::clone(&self.state().prototype)))
    }

    /// The codecs description vector.
    pub fn codecs(&self) -> Result<Node> {
        self.node.body.usable_file()?;
        Ok(Node::from_body(Rc::clone(&self.state().codecs)))
    }

    /// Logical offset of the binary section, once data has been written.
    /// Serialized into the XML section by the schema layer.
    pub fn data_packet_offset(&self) -> Result<Option<u64>> {
        self.node.body.usable_file()?;
        Ok(self.state().section_offset.get())
    }

    /// Opens a writer transferring records from `buffers` into this
    /// stream.
    ///
    /// # Errors
    ///
    /// `TooManyWriters` while any writer or reader is open on the
    /// container; `FileReadOnly` on a read-only container;
    /// `BadAPIArgument` if this node is not attached; binding errors per
    /// the buffer contract.
    pub fn writer(&self, buffers: &[SourceDestBuffer]) -> Result<CompressedVectorWriter> {
        CompressedVectorWriter::open(self.clone(), buffers)
    }

    /// Opens a reader transferring records from this stream into
    /// `buffers`.
    ///
    /// # Errors
    ///
    /// `TooManyReaders` while a writer is open on the container;
    /// `BadAPIArgument` if this node is not attached; binding errors per
    /// the buffer contract.
    pub fn reader(&self, buffers: &[SourceDestBuffer]) -> Result<CompressedVectorReader> {
        CompressedVectorReader::open(self.clone(), buffers)
    }
}

impl_node_common!(CompressedVectorNode, CompressedVector);
