//! Per-field encoders/decoders and type coercion.
//!
//! Every terminal prototype field gets a [`FieldCodec`] describing its
//! stored representation:
//!
//! - Integer and scaled integer fields store `value - minimum` bit-packed
//!   at `ceil(log2(maximum - minimum + 1))` bits per record (zero bits
//!   when the bounds coincide).
//! - Float fields store raw little-endian IEEE-754 words.
//! - String fields store a LEB128 length prefix followed by UTF-8 bytes.
//!
//! Coercion between the stored representation and the bound buffer kind
//! follows the transfer rules: exactness is enforced unless the buffer
//! opts into conversion, and scaled integers map through `raw * scale +
//! offset` only when the buffer opts into scaling.

use super::bitstream::{decode_varint, encode_varint, BitPacker, BitUnpacker};
use crate::error::{Error, ErrorKind, Result};
use crate::node::{NodeBody, Variant};
use crate::sourcedest::{BufferKind, BufferValue};
use std::rc::Rc;

/// 2^63 as an `f64`; floats at or beyond this magnitude do not fit `i64`.
const I64_LIMIT: f64 = 9_223_372_036_854_775_808.0;

/// Stored representation of one prototype field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// Bit-packed bounded integer.
    Integer {
        /// Declared minimum.
        min: i64,
        /// Declared maximum.
        max: i64,
    },
    /// Bit-packed bounded raw integer with a scale/offset mapping.
    ScaledInteger {
        /// Declared raw minimum.
        min: i64,
        /// Declared raw maximum.
        max: i64,
        /// Scale factor.
        scale: f64,
        /// Offset.
        offset: f64,
    },
    /// Raw IEEE-754 binary32.
    Single {
        /// Declared minimum.
        min: f64,
        /// Declared maximum.
        max: f64,
    },
    /// Raw IEEE-754 binary64.
    Double {
        /// Declared minimum.
        min: f64,
        /// Declared maximum.
        max: f64,
    },
    /// Varint-length-prefixed UTF-8.
    Ustring,
}

/// Encoder/decoder for one prototype field.
#[derive(Debug, Clone, Copy)]
pub struct FieldCodec {
    kind: FieldKind,
    /// Bits per record for bit-packed kinds; 32/64 for floats; unused for
    /// strings.
    bits: u32,
}

impl FieldCodec {
    /// Builds a codec from the stored representation description.
    pub fn from_kind(kind: FieldKind) -> Self {
        let bits = match kind {
            FieldKind::Integer { min, max } | FieldKind::ScaledInteger { min, max, .. } => {
                let range = (max as i128 - min as i128) as u64;
                if range == 0 {
                    0
                } else {
                    64 - range.leading_zeros()
                }
            }
            FieldKind::Single { .. } => 32,
            FieldKind::Double { .. } => 64,
            FieldKind::Ustring => 0,
        };
        Self { kind, bits }
    }

    /// Builds a codec from a terminal prototype node.
    pub(crate) fn from_prototype(node: &Rc<NodeBody>) -> Result<Self> {
        let kind = match &node.variant {
            Variant::Integer { min, max, .. } => FieldKind::Integer {
                min: *min,
                max: *max,
            },
            Variant::ScaledInteger { min, max, scale, offset, .. } => FieldKind::ScaledInteger {
                min: *min,
                max: *max,
                scale: *scale,
                offset: *offset,
            },
            Variant::Float { precision, min, max, .. } => match precision {
                crate::node::FloatPrecision::Single => FieldKind::Single {
                    min: *min,
                    max: *max,
                },
                crate::node::FloatPrecision::Double => FieldKind::Double {
                    min: *min,
                    max: *max,
                },
            },
            Variant::Ustring { .. } => FieldKind::Ustring,
            _ => {
                return Err(Error::new(
                    ErrorKind::BadAPIArgument,
                    format!("{} node is not a terminal record field", node.node_type()),
                ))
            }
        };
        Ok(Self::from_kind(kind))
    }

    /// The stored representation description.
    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    /// Bits per record for fixed-width kinds, `None` for strings.
    pub fn bits_per_record(&self) -> Option<u32> {
        match self.kind {
            FieldKind::Ustring => None,
            _ => Some(self.bits),
        }
    }

    /// True for string fields.
    pub fn is_string(&self) -> bool {
        self.kind == FieldKind::Ustring
    }

    /// Checks at bind time that a buffer of `kind` can legally transfer
    /// this field.
    pub(crate) fn check_buffer_kind(&self, kind: BufferKind, path: &str) -> Result<()> {
        match (self.is_string(), kind.is_numeric()) {
            (true, true) => Err(Error::new(
                ErrorKind::ExpectingUString,
                format!("field {path:?} holds strings but the buffer is {kind}"),
            )),
            (false, false) => Err(Error::new(
                ErrorKind::ExpectingNumeric,
                format!("field {path:?} is numeric but the buffer is {kind}"),
            )),
            _ => Ok(()),
        }
    }

    /// Encodes one buffer value onto `out`, validating bounds first.
    /// Nothing is written when an error is returned.
    pub(crate) fn encode(
        &self,
        value: &BufferValue,
        do_conversion: bool,
        do_scaling: bool,
        out: &mut BitPacker,
    ) -> Result<()> {
        match self.kind {
            FieldKind::Integer { min, max } => {
                let raw = self.incoming_raw(value, min, max, do_conversion)?;
                out.push_bits((raw as i128 - min as i128) as u64, self.bits);
            }
            FieldKind::ScaledInteger { min, max, scale, offset } => {
                let raw = if do_scaling {
                    match value {
                        BufferValue::F32(v) => descale(*v as f64, scale, offset, min, max)?,
                        BufferValue::F64(v) => descale(*v, scale, offset, min, max)?,
                        _ => self.incoming_raw(value, min, max, do_conversion)?,
                    }
                } else {
                    self.incoming_raw(value, min, max, do_conversion)?
                };
                out.push_bits((raw as i128 - min as i128) as u64, self.bits);
            }
            FieldKind::Single { min, max } => {
                let v = incoming_single(value, do_conversion)?;
                check_float_bounds(v as f64, min, max)?;
                out.push_bytes(&v.to_le_bytes());
            }
            FieldKind::Double { min, max } => {
                let v = incoming_double(value)?;
                check_float_bounds(v, min, max)?;
                out.push_bytes(&v.to_le_bytes());
            }
            FieldKind::Ustring => match value {
                BufferValue::Str(s) => {
                    encode_varint(out, s.len() as u64);
                    out.push_bytes(s.as_bytes());
                }
                _ => {
                    return Err(Error::new(
                        ErrorKind::InternalError,
                        "numeric value reached a string field",
                    ))
                }
            },
        }
        Ok(())
    }

    /// Coerces a buffer value to the bounded raw integer representation.
    fn incoming_raw(
        &self,
        value: &BufferValue,
        min: i64,
        max: i64,
        do_conversion: bool,
    ) -> Result<i64> {
        let raw = match value {
            BufferValue::I8(v) => *v as i64,
            BufferValue::I16(v) => *v as i64,
            BufferValue::I32(v) => *v as i64,
            BufferValue::I64(v) => *v,
            BufferValue::F32(v) => float_to_i64(*v as f64, do_conversion)?,
            BufferValue::F64(v) => float_to_i64(*v, do_conversion)?,
            BufferValue::Str(_) => {
                return Err(Error::new(
                    ErrorKind::InternalError,
                    "string value reached an integer field",
                ))
            }
        };
        if raw < min || raw > max {
            return Err(Error::new(
                ErrorKind::ValueOutOfBounds,
                format!("value {raw} outside [{min}, {max}]"),
            ));
        }
        Ok(raw)
    }

    /// Decodes one record from `input` into a value of the buffer's kind.
    pub(crate) fn decode(
        &self,
        input: &mut BitUnpacker,
        target: BufferKind,
        do_conversion: bool,
        do_scaling: bool,
    ) -> Result<BufferValue> {
        match self.kind {
            FieldKind::Integer { min, .. } => {
                let raw = (min as i128 + input.take_bits(self.bits)? as i128) as i64;
                deliver_integer(raw, target)
            }
            FieldKind::ScaledInteger { min, scale, offset, .. } => {
                let raw = (min as i128 + input.take_bits(self.bits)? as i128) as i64;
                if do_scaling && matches!(target, BufferKind::F32 | BufferKind::F64) {
                    let scaled = raw as f64 * scale + offset;
                    Ok(match target {
                        BufferKind::F32 => BufferValue::F32(scaled as f32),
                        _ => BufferValue::F64(scaled),
                    })
                } else {
                    deliver_integer(raw, target)
                }
            }
            FieldKind::Single { .. } => {
                let bits = input.take_bits(32)? as u32;
                deliver_double(f32::from_bits(bits) as f64, true, target, do_conversion)
            }
            FieldKind::Double { .. } => {
                let bits = input.take_bits(64)?;
                deliver_double(f64::from_bits(bits), false, target, do_conversion)
            }
            FieldKind::Ustring => {
                let len = decode_varint(input)? as usize;
                let bytes = input.take_bytes(len)?;
                let text = String::from_utf8(bytes).map_err(|e| {
                    Error::new(ErrorKind::BadCVPacket, format!("invalid UTF-8: {e}"))
                })?;
                match target {
                    BufferKind::UString => Ok(BufferValue::Str(text)),
                    _ => Err(Error::new(
                        ErrorKind::InternalError,
                        "string field bound to a numeric buffer",
                    )),
                }
            }
        }
    }

    /// Advances `input` past one record without delivering it.
    pub(crate) fn skip(&self, input: &mut BitUnpacker) -> Result<()> {
        match self.kind {
            FieldKind::Ustring => {
                let len = decode_varint(input)?;
                input.skip_bits(len * 8)
            }
            _ => input.skip_bits(self.bits as u64),
        }
    }
}

/// Rounds a floating point value toward zero and checks the i64 domain.
fn float_to_i64(v: f64, do_conversion: bool) -> Result<i64> {
    if !do_conversion {
        return Err(Error::new(
            ErrorKind::ConversionRequired,
            format!("float {v} needs do_conversion to reach an integer field"),
        ));
    }
    let truncated = v.trunc();
    if !truncated.is_finite() || truncated >= I64_LIMIT || truncated < -I64_LIMIT {
        return Err(Error::new(
            ErrorKind::Real64TooLarge,
            format!("float {v} outside the i64 domain"),
        ));
    }
    Ok(truncated as i64)
}

/// Maps a scaled physical value back to its raw integer, rounding half up.
fn descale(v: f64, scale: f64, offset: f64, min: i64, max: i64) -> Result<i64> {
    let raw = ((v - offset) / scale + 0.5).floor();
    if !raw.is_finite() || raw >= I64_LIMIT || raw < -I64_LIMIT {
        return Err(Error::new(
            ErrorKind::Real64TooLarge,
            format!("scaled value {v} outside the raw i64 domain"),
        ));
    }
    let raw = raw as i64;
    if raw < min || raw > max {
        return Err(Error::new(
            ErrorKind::ValueOutOfBounds,
            format!("scaled value {v} maps to raw {raw} outside [{min}, {max}]"),
        ));
    }
    Ok(raw)
}

/// Coerces a buffer value to binary64 for a double precision field.
fn incoming_double(value: &BufferValue) -> Result<f64> {
    match value {
        BufferValue::I8(v) => Ok(*v as f64),
        BufferValue::I16(v) => Ok(*v as f64),
        BufferValue::I32(v) => Ok(*v as f64),
        BufferValue::I64(v) => exact_i64_to_f64(*v),
        BufferValue::F32(v) => Ok(*v as f64),
        BufferValue::F64(v) => Ok(*v),
        BufferValue::Str(_) => Err(Error::new(
            ErrorKind::InternalError,
            "string value reached a float field",
        )),
    }
}

/// Coerces a buffer value to binary32 for a single precision field.
fn incoming_single(value: &BufferValue, do_conversion: bool) -> Result<f32> {
    match value {
        BufferValue::I8(v) => Ok(*v as f32),
        BufferValue::I16(v) => Ok(*v as f32),
        BufferValue::I32(v) => exact_i64_to_f32(*v as i64),
        BufferValue::I64(v) => exact_i64_to_f32(*v),
        BufferValue::F32(v) => Ok(*v),
        BufferValue::F64(v) => {
            if !do_conversion {
                return Err(Error::new(
                    ErrorKind::ConversionRequired,
                    "f64 value needs do_conversion to reach a single precision field",
                ));
            }
            if v.is_finite() && v.abs() > f32::MAX as f64 {
                return Err(Error::new(
                    ErrorKind::Real64TooLarge,
                    format!("value {v} outside the single precision domain"),
                ));
            }
            Ok(*v as f32)
        }
        BufferValue::Str(_) => Err(Error::new(
            ErrorKind::InternalError,
            "string value reached a float field",
        )),
    }
}

fn check_float_bounds(v: f64, min: f64, max: f64) -> Result<()> {
    if v.is_nan() || v < min || v > max {
        return Err(Error::new(
            ErrorKind::ValueOutOfBounds,
            format!("value {v} outside [{min}, {max}]"),
        ));
    }
    Ok(())
}

fn exact_i64_to_f64(v: i64) -> Result<f64> {
    let f = v as f64;
    if f as i128 == v as i128 {
        Ok(f)
    } else {
        Err(Error::new(
            ErrorKind::ScaledValueNotRepresentable,
            format!("integer {v} is not exactly representable as f64"),
        ))
    }
}

fn exact_i64_to_f32(v: i64) -> Result<f32> {
    let f = v as f32;
    if f as i128 == v as i128 {
        Ok(f)
    } else {
        Err(Error::new(
            ErrorKind::ScaledValueNotRepresentable,
            format!("integer {v} is not exactly representable as f32"),
        ))
    }
}

/// Delivers a stored integer into a buffer of the given kind. Narrowing
/// is range-checked; float targets must represent the value exactly.
fn deliver_integer(raw: i64, target: BufferKind) -> Result<BufferValue> {
    let not_representable = |bits: &str| {
        Err(Error::new(
            ErrorKind::ValueNotRepresentable,
            format!("stored value {raw} does not fit an {bits} buffer"),
        ))
    };
    match target {
        BufferKind::I8 => match i8::try_from(raw) {
            Ok(v) => Ok(BufferValue::I8(v)),
            Err(_) => not_representable("i8"),
        },
        BufferKind::I16 => match i16::try_from(raw) {
            Ok(v) => Ok(BufferValue::I16(v)),
            Err(_) => not_representable("i16"),
        },
        BufferKind::I32 => match i32::try_from(raw) {
            Ok(v) => Ok(BufferValue::I32(v)),
            Err(_) => not_representable("i32"),
        },
        BufferKind::I64 => Ok(BufferValue::I64(raw)),
        BufferKind::F32 => Ok(BufferValue::F32(exact_i64_to_f32(raw)?)),
        BufferKind::F64 => Ok(BufferValue::F64(exact_i64_to_f64(raw)?)),
        BufferKind::UString => Err(Error::new(
            ErrorKind::InternalError,
            "integer field bound to a string buffer",
        )),
    }
}

/// Delivers a stored float into a buffer of the given kind. Rounds toward
/// zero for integer targets.
fn deliver_double(
    v: f64,
    from_single: bool,
    target: BufferKind,
    do_conversion: bool,
) -> Result<BufferValue> {
    let to_integer = |limit_min: i64, limit_max: i64| -> Result<i64> {
        if !do_conversion {
            return Err(Error::new(
                ErrorKind::ConversionRequired,
                format!("float {v} needs do_conversion to reach an integer buffer"),
            ));
        }
        let truncated = v.trunc();
        if !truncated.is_finite()
            || truncated < limit_min as f64
            || truncated >= (limit_max as f64) + 1.0
        {
            return Err(Error::new(
                ErrorKind::Real64TooLarge,
                format!("float {v} outside the integer buffer domain"),
            ));
        }
        Ok(truncated as i64)
    };
    match target {
        BufferKind::I8 => Ok(BufferValue::I8(to_integer(i8::MIN as i64, i8::MAX as i64)? as i8)),
        BufferKind::I16 => Ok(BufferValue::I16(
            to_integer(i16::MIN as i64, i16::MAX as i64)? as i16,
        )),
        BufferKind::I32 => Ok(BufferValue::I32(
            to_integer(i32::MIN as i64, i32::MAX as i64)? as i32,
        )),
        BufferKind::I64 => {
            if !do_conversion {
                return Err(Error::new(
                    ErrorKind::ConversionRequired,
                    format!("float {v} needs do_conversion to reach an integer buffer"),
                ));
            }
            let truncated = v.trunc();
            if !truncated.is_finite() || truncated >= I64_LIMIT || truncated < -I64_LIMIT {
                return Err(Error::new(
                    ErrorKind::Real64TooLarge,
                    format!("float {v} outside the i64 domain"),
                ));
            }
            Ok(BufferValue::I64(truncated as i64))
        }
        BufferKind::F32 => {
            if from_single {
                return Ok(BufferValue::F32(v as f32));
            }
            if !do_conversion {
                return Err(Error::new(
                    ErrorKind::ConversionRequired,
                    "f64 field needs do_conversion to reach an f32 buffer",
                ));
            }
            if v.is_finite() && v.abs() > f32::MAX as f64 {
                return Err(Error::new(
                    ErrorKind::Real64TooLarge,
                    format!("value {v} outside the single precision domain"),
                ));
            }
            Ok(BufferValue::F32(v as f32))
        }
        BufferKind::F64 => Ok(BufferValue::F64(v)),
        BufferKind::UString => Err(Error::new(
            ErrorKind::InternalError,
            "float field bound to a string buffer",
        )),
    }
}
