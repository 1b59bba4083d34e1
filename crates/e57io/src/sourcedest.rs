//! Caller-owned transfer buffers bound to prototype fields.
//!
//! A [`SourceDestBuffer`] binds one terminal field of a compressed vector
//! prototype to a typed array shared with the caller. The engine neither
//! copies nor resizes the array: a writer pulls record values out of it, a
//! reader stores decoded values into it. The same array handle can be
//! read or refilled by the caller between transfers, and rebinding between
//! reads may swap in a different array of the same element kind.

use crate::error::{Error, ErrorKind, Result};
use std::cell::RefCell;
use std::rc::Rc;

/// Element kind of a transfer buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// `i8` elements.
    I8,
    /// `i16` elements.
    I16,
    /// `i32` elements.
    I32,
    /// `i64` elements.
    I64,
    /// `f32` elements.
    F32,
    /// `f64` elements.
    F64,
    /// UTF-8 string elements.
    UString,
}

impl BufferKind {
    /// True for every kind except `UString`.
    pub fn is_numeric(self) -> bool {
        self != BufferKind::UString
    }
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BufferKind::I8 => "i8",
            BufferKind::I16 => "i16",
            BufferKind::I32 => "i32",
            BufferKind::I64 => "i64",
            BufferKind::F32 => "f32",
            BufferKind::F64 => "f64",
            BufferKind::UString => "ustring",
        };
        f.write_str(name)
    }
}

/// One element in transit between a buffer and a field codec.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BufferValue {
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
}

/// Shared handle to a caller-owned typed array.
#[derive(Debug, Clone)]
pub(crate) enum BufferStore {
    I8(Rc<RefCell<Vec<i8>>>),
    I16(Rc<RefCell<Vec<i16>>>),
    I32(Rc<RefCell<Vec<i32>>>),
    I64(Rc<RefCell<Vec<i64>>>),
    F32(Rc<RefCell<Vec<f32>>>),
    F64(Rc<RefCell<Vec<f64>>>),
    UString(Rc<RefCell<Vec<String>>>),
}

impl BufferStore {
    pub(crate) fn kind(&self) -> BufferKind {
        match self {
            BufferStore::I8(_) => BufferKind::I8,
            BufferStore::I16(_) => BufferKind::I16,
            BufferStore::I32(_) => BufferKind::I32,
            BufferStore::I64(_) => BufferKind::I64,
            BufferStore::F32(_) => BufferKind::F32,
            BufferStore::F64(_) => BufferKind::F64,
            BufferStore::UString(_) => BufferKind::UString,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            BufferStore::I8(v) => v.borrow().len(),
            BufferStore::I16(v) => v.borrow().len(),
            BufferStore::I32(v) => v.borrow().len(),
            BufferStore::I64(v) => v.borrow().len(),
            BufferStore::F32(v) => v.borrow().len(),
            BufferStore::F64(v) => v.borrow().len(),
            BufferStore::UString(v) => v.borrow().len(),
        }
    }

    pub(crate) fn get(&self, index: usize) -> BufferValue {
        match self {
            BufferStore::I8(v) => BufferValue::I8(v.borrow()[index]),
            BufferStore::I16(v) => BufferValue::I16(v.borrow()[index]),
            BufferStore::I32(v) => BufferValue::I32(v.borrow()[index]),
            BufferStore::I64(v) => BufferValue::I64(v.borrow()[index]),
            BufferStore::F32(v) => BufferValue::F32(v.borrow()[index]),
            BufferStore::F64(v) => BufferValue::F64(v.borrow()[index]),
            BufferStore::UString(v) => BufferValue::Str(v.borrow()[index].clone()),
        }
    }

    pub(crate) fn set(&self, index: usize, value: BufferValue) -> Result<()> {
        match (self, value) {
            (BufferStore::I8(v), BufferValue::I8(x)) => v.borrow_mut()[index] = x,
            (BufferStore::I16(v), BufferValue::I16(x)) => v.borrow_mut()[index] = x,
            (BufferStore::I32(v), BufferValue::I32(x)) => v.borrow_mut()[index] = x,
            (BufferStore::I64(v), BufferValue::I64(x)) => v.borrow_mut()[index] = x,
            (BufferStore::F32(v), BufferValue::F32(x)) => v.borrow_mut()[index] = x,
            (BufferStore::F64(v), BufferValue::F64(x)) => v.borrow_mut()[index] = x,
            (BufferStore::UString(v), BufferValue::Str(x)) => v.borrow_mut()[index] = x,
            _ => {
                return Err(Error::new(
                    ErrorKind::InternalError,
                    "decoded value kind does not match the buffer kind",
                ))
            }
        }
        Ok(())
    }
}

/// A binding between one prototype field path and a caller-owned typed
/// array.
#[derive(Debug, Clone)]
pub struct SourceDestBuffer {
    path: String,
    store: BufferStore,
    do_conversion: bool,
    do_scaling: bool,
}

impl SourceDestBuffer {
    fn new(path: impl Into<String>, store: BufferStore) -> Self {
        Self {
            path: path.into(),
            store,
            do_conversion: false,
            do_scaling: false,
        }
    }

    /// Binds `path` to a shared `i8` array.
    pub fn i8(path: impl Into<String>, array: Rc<RefCell<Vec<i8>>>) -> Self {
        Self::new(path, BufferStore::I8(array))
    }

    /// Binds `path` to a shared `i16` array.
    pub fn i16(path: impl Into<String>, array: Rc<RefCell<Vec<i16>>>) -> Self {
        Self::new(path, BufferStore::I16(array))
    }

    /// Binds `path` to a shared `i32` array.
    pub fn i32(path: impl Into<String>, array: Rc<RefCell<Vec<i32>>>) -> Self {
        Self::new(path, BufferStore::I32(array))
    }

    /// Binds `path` to a shared `i64` array.
    pub fn i64(path: impl Into<String>, array: Rc<RefCell<Vec<i64>>>) -> Self {
        Self::new(path, BufferStore::I64(array))
    }

    /// Binds `path` to a shared `f32` array.
    pub fn f32(path: impl Into<String>, array: Rc<RefCell<Vec<f32>>>) -> Self {
        Self::new(path, BufferStore::F32(array))
    }

    /// Binds `path` to a shared `f64` array.
    pub fn f64(path: impl Into<String>, array: Rc<RefCell<Vec<f64>>>) -> Self {
        Self::new(path, BufferStore::F64(array))
    }

    /// Binds `path` to a shared array of strings.
    pub fn ustring(path: impl Into<String>, array: Rc<RefCell<Vec<String>>>) -> Self {
        Self::new(path, BufferStore::UString(array))
    }

    /// Permits narrowing and widening coercions during transfer.
    pub fn with_conversion(mut self) -> Self {
        self.do_conversion = true;
        self
    }

    /// Applies scale and offset when a scaled integer field is delivered
    /// to or taken from a floating point buffer.
    pub fn with_scaling(mut self) -> Self {
        self.do_scaling = true;
        self
    }

    /// The prototype path this buffer is bound to.
    pub fn path_name(&self) -> &str {
        &self.path
    }

    /// The element kind of the bound array.
    pub fn kind(&self) -> BufferKind {
        self.store.kind()
    }

    /// The number of records the bound array can hold.
    pub fn capacity(&self) -> usize {
        self.store.len()
    }

    /// True if coercions are permitted.
    pub fn do_conversion(&self) -> bool {
        self.do_conversion
    }

    /// True if scale/offset mapping is applied.
    pub fn do_scaling(&self) -> bool {
        self.do_scaling
    }

    pub(crate) fn store(&self) -> &BufferStore {
        &self.store
    }

    /// True if `other` is a legal rebinding of this buffer: only the
    /// array handle (and with it the capacity) may differ.
    pub(crate) fn rebinding_matches(&self, other: &SourceDestBuffer) -> bool {
        self.path == other.path
            && self.kind() == other.kind()
            && self.do_conversion == other.do_conversion
            && self.do_scaling == other.do_scaling
    }
}
