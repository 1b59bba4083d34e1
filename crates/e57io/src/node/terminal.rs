//! Terminal typed nodes: integers, scaled integers, floats, strings, blobs.
//!
//! Terminal nodes hold a single value and, once created, are immutable.
//! Construction validates bounds eagerly: an out-of-range value is rejected
//! with `ValueOutOfBounds` before the node exists. This holds even for
//! nodes destined for a compressed vector prototype, where the value itself
//! is ignored.

use super::{impl_node_common, Node, NodeBody, NodeType, Variant};
use crate::error::{Error, ErrorKind, Result};
use crate::imagefile::ImageFile;

/// Precision of a [`FloatNode`], selecting the stored representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatPrecision {
    /// IEEE-754 binary32.
    Single,
    /// IEEE-754 binary64.
    Double,
}

/// A terminal node holding a signed 64-bit integer with declared bounds.
///
/// The minimum may be any value in [-2^63, 2^63); the maximum any value in
/// [minimum, 2^63); the value any number in [minimum, maximum].
#[derive(Debug, Clone)]
pub struct IntegerNode {
    node: Node,
}

impl IntegerNode {
    /// Creates an integer node declared against `dest`.
    ///
    /// # Errors
    ///
    /// `BadAPIArgument` if `minimum > maximum`; `ValueOutOfBounds` if
    /// `value` lies outside the bounds; `ImageFileNotOpen` /
    /// `FileReadOnly` for an unusable destination.
    pub fn new(dest: &ImageFile, value: i64, minimum: i64, maximum: i64) -> Result<Self> {
        let file = dest.creation_body()?;
        if minimum > maximum {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!("minimum {minimum} exceeds maximum {maximum}"),
            ));
        }
        if value < minimum || value > maximum {
            return Err(Error::new(
                ErrorKind::ValueOutOfBounds,
                format!("value {value} outside [{minimum}, {maximum}]"),
            ));
        }
        Ok(Self {
            node: Node::from_body(NodeBody::new(
                &file,
                Variant::Integer {
                    value,
                    min: minimum,
                    max: maximum,
                },
            )),
        })
    }

    /// The stored integer value.
    pub fn value(&self) -> Result<i64> {
        self.node.body.usable_file()?;
        match self.node.body.variant {
            Variant::Integer { value, .. } => Ok(value),
            _ => unreachable!("downcast guarantees the Integer variant"),
        }
    }

    /// The declared minimum.
    pub fn minimum(&self) -> Result<i64> {
        self.node.body.usable_file()?;
        match self.node.body.variant {
            Variant::Integer { min, .. } => Ok(min),
            _ => unreachable!("downcast guarantees the Integer variant"),
        }
    }

    /// The declared maximum.
    pub fn maximum(&self) -> Result<i64> {
        self.node.body.usable_file()?;
        match self.node.body.variant {
            Variant::Integer { max, .. } => Ok(max),
            _ => unreachable!("downcast guarantees the Integer variant"),
        }
    }
}

impl_node_common!(IntegerNode, Integer);

/// A terminal node holding a bounded raw integer together with a scale and
/// offset mapping it to a physical quantity: `scaled = raw * scale + offset`.
#[derive(Debug, Clone)]
pub struct ScaledIntegerNode {
    node: Node,
}

impl ScaledIntegerNode {
    /// Creates a scaled integer node declared against `dest`.
    ///
    /// # Errors
    ///
    /// `BadAPIArgument` if `minimum > maximum` or `scale == 0`;
    /// `ValueOutOfBounds` if `raw_value` lies outside the bounds.
    pub fn new(
        dest: &ImageFile,
        raw_value: i64,
        minimum: i64,
        maximum: i64,
        scale: f64,
        offset: f64,
    ) -> Result<Self> {
        let file = dest.creation_body()?;
        if minimum > maximum {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!("minimum {minimum} exceeds maximum {maximum}"),
            ));
        }
        if scale == 0.0 || !scale.is_finite() || !offset.is_finite() {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!("scale {scale} / offset {offset} must be finite and scale nonzero"),
            ));
        }
        if raw_value < minimum || raw_value > maximum {
            return Err(Error::new(
                ErrorKind::ValueOutOfBounds,
                format!("raw value {raw_value} outside [{minimum}, {maximum}]"),
            ));
        }
        Ok(Self {
            node: Node::from_body(NodeBody::new(
                &file,
                Variant::ScaledInteger {
                    raw: raw_value,
                    min: minimum,
                    max: maximum,
                    scale,
                    offset,
                },
            )),
        })
    }

    fn fields(&self) -> Result<(i64, i64, i64, f64, f64)> {
        self.node.body.usable_file()?;
        match self.node.body.variant {
            Variant::ScaledInteger { raw, min, max, scale, offset } => {
                Ok((raw, min, max, scale, offset))
            }
            _ => unreachable!("downcast guarantees the ScaledInteger variant"),
        }
    }

    /// The stored raw integer value.
    pub fn raw_value(&self) -> Result<i64> {
        Ok(self.fields()?.0)
    }

    /// The raw value mapped through scale and offset.
    pub fn scaled_value(&self) -> Result<f64> {
        let (raw, _, _, scale, offset) = self.fields()?;
        Ok(raw as f64 * scale + offset)
    }

    /// The declared raw minimum.
    pub fn minimum(&self) -> Result<i64> {
        Ok(self.fields()?.1)
    }

    /// The declared raw maximum.
    pub fn maximum(&self) -> Result<i64> {
        Ok(self.fields()?.2)
    }

    /// The declared scale factor.
    pub fn scale(&self) -> Result<f64> {
        Ok(self.fields()?.3)
    }

    /// The declared offset.
    pub fn offset(&self) -> Result<f64> {
        Ok(self.fields()?.4)
    }
}

impl_node_common!(ScaledIntegerNode, ScaledInteger);

/// A terminal node holding an IEEE-754 floating point value with declared
/// bounds and precision.
#[derive(Debug, Clone)]
pub struct FloatNode {
    node: Node,
}

impl FloatNode {
    /// Creates a float node declared against `dest`.
    ///
    /// # Errors
    ///
    /// `BadAPIArgument` if `minimum > maximum`, any bound is NaN, or a
    /// single-precision bound exceeds the f32 domain; `ValueOutOfBounds`
    /// if `value` lies outside the bounds.
    pub fn new(
        dest: &ImageFile,
        value: f64,
        precision: FloatPrecision,
        minimum: f64,
        maximum: f64,
    ) -> Result<Self> {
        let file = dest.creation_body()?;
        if minimum.is_nan() || maximum.is_nan() || minimum > maximum {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!("invalid bounds [{minimum}, {maximum}]"),
            ));
        }
        if precision == FloatPrecision::Single
            && (minimum < f32::MIN as f64 || maximum > f32::MAX as f64)
        {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!("bounds [{minimum}, {maximum}] exceed the single precision domain"),
            ));
        }
        if value.is_nan() || value < minimum || value > maximum {
            return Err(Error::new(
                ErrorKind::ValueOutOfBounds,
                format!("value {value} outside [{minimum}, {maximum}]"),
            ));
        }
        Ok(Self {
            node: Node::from_body(NodeBody::new(
                &file,
                Variant::Float {
                    value,
                    precision,
                    min: minimum,
                    max: maximum,
                },
            )),
        })
    }

    fn fields(&self) -> Result<(f64, FloatPrecision, f64, f64)> {
        self.node.body.usable_file()?;
        match self.node.body.variant {
            Variant::Float { value, precision, min, max } => Ok((value, precision, min, max)),
            _ => unreachable!("downcast guarantees the Float variant"),
        }
    }

    /// The stored value.
    pub fn value(&self) -> Result<f64> {
        Ok(self.fields()?.0)
    }

    /// The declared precision.
    pub fn precision(&self) -> Result<FloatPrecision> {
        Ok(self.fields()?.1)
    }

    /// The declared minimum.
    pub fn minimum(&self) -> Result<f64> {
        Ok(self.fields()?.2)
    }

    /// The declared maximum.
    pub fn maximum(&self) -> Result<f64> {
        Ok(self.fields()?.3)
    }
}

impl_node_common!(FloatNode, Float);

/// Longest string accepted by a [`StringNode`], in bytes.
pub const MAX_STRING_LENGTH: u64 = (1u64 << 31) - 1;

/// A terminal node holding a UTF-8 string.
#[derive(Debug, Clone)]
pub struct StringNode {
    node: Node,
}

impl StringNode {
    /// Creates a string node declared against `dest`.
    pub fn new(dest: &ImageFile, value: impl Into<String>) -> Result<Self> {
        let file = dest.creation_body()?;
        let value = value.into();
        if value.len() as u64 > MAX_STRING_LENGTH {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!("string length {} exceeds {MAX_STRING_LENGTH}", value.len()),
            ));
        }
        Ok(Self {
            node: Node::from_body(NodeBody::new(&file, Variant::Ustring { value })),
        })
    }

    /// The stored string value.
    pub fn value(&self) -> Result<String> {
        self.node.body.usable_file()?;
        match &self.node.body.variant {
            Variant::Ustring { value } => Ok(value.clone()),
            _ => unreachable!("downcast guarantees the Ustring variant"),
        }
    }
}

impl_node_common!(StringNode, Ustring);

/// A terminal node naming an opaque byte run resident in the file.
///
/// The byte range is reserved when the node is created; its contents are
/// transferred piecewise with [`BlobNode::read`] and [`BlobNode::write`]
/// through the checksummed page layer.
#[derive(Debug, Clone)]
pub struct BlobNode {
    node: Node,
}

impl BlobNode {
    /// Creates a blob of `byte_count` bytes, reserving its file range.
    pub fn new(dest: &ImageFile, byte_count: u64) -> Result<Self> {
        let file = dest.creation_body()?;
        if !file.writable {
            return Err(Error::new(ErrorKind::FileReadOnly, "blob creation"));
        }
        let logical_offset = file.allocate(byte_count);
        Ok(Self {
            node: Node::from_body(NodeBody::new(
                &file,
                Variant::Blob {
                    logical_offset,
                    length: byte_count,
                },
            )),
        })
    }

    /// Rebinds a blob node to an already-written byte range. Used by the
    /// schema layer when reconstructing a tree from the XML section.
    pub fn open_existing(dest: &ImageFile, logical_offset: u64, byte_count: u64) -> Result<Self> {
        dest.body.require_usable()?;
        Ok(Self {
            node: Node::from_body(NodeBody::new(
                &dest.body,
                Variant::Blob {
                    logical_offset,
                    length: byte_count,
                },
            )),
        })
    }

    /// The declared length of the blob in bytes.
    pub fn byte_count(&self) -> Result<u64> {
        self.node.body.usable_file()?;
        match self.node.body.variant {
            Variant::Blob { length, .. } => Ok(length),
            _ => unreachable!("downcast guarantees the Blob variant"),
        }
    }

    fn range(&self) -> (u64, u64) {
        match self.node.body.variant {
            Variant::Blob { logical_offset, length } => (logical_offset, length),
            _ => unreachable!("downcast guarantees the Blob variant"),
        }
    }

    /// Reads `buf.len()` bytes starting at `offset` within the blob.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let file = self.node.body.usable_file()?;
        let (start, length) = self.range();
        let in_range = offset
            .checked_add(buf.len() as u64)
            .is_some_and(|end| end <= length);
        if !in_range {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!(
                    "read of {} bytes at offset {offset} exceeds blob length {length}",
                    buf.len()
                ),
            ));
        }
        let result = file.paged.borrow_mut().read_logical(start + offset, buf);
        result.map_err(|e| file.sicken(e))
    }

    /// Writes `data` starting at `offset` within the blob.
    pub fn write(&self, data: &[u8], offset: u64) -> Result<()> {
        let file = self.node.body.usable_file()?;
        if !file.writable {
            return Err(Error::new(ErrorKind::FileReadOnly, "blob write"));
        }
        let (start, length) = self.range();
        let in_range = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= length);
        if !in_range {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!(
                    "write of {} bytes at offset {offset} exceeds blob length {length}",
                    data.len()
                ),
            ));
        }
        let result = file.paged.borrow_mut().write_logical(start + offset, data);
        result.map_err(|e| file.sicken(e))
    }
}

impl_node_common!(BlobNode, Blob);
