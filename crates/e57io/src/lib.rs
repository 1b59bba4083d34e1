//! e57io - core engine for ASTM E57 CompressedVector record streams.
//!
//! This crate implements the heart of an E57 point-cloud container: the
//! typed node tree, the paged and checksummed file image, and the
//! columnar packet codec that compresses heterogeneous records into and
//! out of binary sections.
//!
//! # Components
//!
//! - [`ImageFile`]: container lifecycle, header, root node, transfer counts
//! - [`Node`] and the typed handles ([`IntegerNode`], [`ScaledIntegerNode`],
//!   [`FloatNode`], [`StringNode`], [`BlobNode`], [`VectorNode`],
//!   [`StructureNode`]): the hierarchical element tree
//! - [`CompressedVectorNode`] with [`CompressedVectorWriter`] /
//!   [`CompressedVectorReader`]: block-iterator record transfer
//! - [`SourceDestBuffer`]: caller-owned typed arrays bound to prototype fields
//!
//! # Example
//!
//! ```rust,ignore
//! use e57io::{CompressedVectorNode, ImageFile, IntegerNode, SourceDestBuffer,
//!             StructureNode, VectorNode};
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! let imf = ImageFile::create("points.e57")?;
//!
//! // Describe one record: a single bounded integer field.
//! let proto = StructureNode::new(&imf)?;
//! proto.set("id", IntegerNode::new(&imf, 0, 0, 1023)?)?;
//! let cv = CompressedVectorNode::new(&imf, proto, VectorNode::new(&imf, true)?)?;
//! imf.root()?.set("points", cv.clone())?;
//!
//! // Stream records from a caller-owned array.
//! let ids = Rc::new(RefCell::new((0..1000).collect::<Vec<i64>>()));
//! let mut writer = cv.writer(&[SourceDestBuffer::i64("id", ids)])?;
//! writer.write(1000)?;
//! writer.close()?;
//! imf.close()?;
//! ```
//!
//! A container and every handle derived from it belong to one thread;
//! distinct containers may be used from distinct threads freely.

#![deny(missing_docs)]

pub mod codec;
pub mod cvector;
pub mod error;
pub mod imagefile;
pub mod node;
pub mod paging;
pub mod sourcedest;

pub use cvector::{CompressedVectorNode, CompressedVectorReader, CompressedVectorWriter};
pub use error::{Error, ErrorKind, Result};
pub use imagefile::ImageFile;
pub use node::{
    BlobNode, FloatNode, FloatPrecision, IntegerNode, Node, NodeType, ScaledIntegerNode,
    StringNode, StructureNode, VectorNode,
};
pub use sourcedest::{BufferKind, SourceDestBuffer};
