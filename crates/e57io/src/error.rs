//! Error and Result types for E57 container operations.

use thiserror::Error;

/// A convenience `Result` type for E57 operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of failure, mirroring the E57 error taxonomy.
///
/// Kinds fall into four propagation classes:
///
/// - **Argument/state** (`BadAPIArgument`, `*NotOpen`, `PathUndefined`,
///   `BufferSizeMismatch`, `SetTwice`, `AlreadyHasParent`, `TooMany*`):
///   reported without changing any object state.
/// - **Value errors during encode** (`ValueOutOfBounds`): reported, the
///   writer's packet buffer is left untouched.
/// - **Conversion/bounds errors during decode** (`ConversionRequired`,
///   `ValueNotRepresentable`, `ScaledValueNotRepresentable`,
///   `Real64TooLarge`, `ExpectingNumeric`, `ExpectingUString`): the
///   reader or writer that hit them becomes sick.
/// - **I/O and structural errors** (`SeekFailed`, `ReadFailed`,
///   `WriteFailed`, `BadCVPacket`, `BadChecksum`, `BadCVHeader`): the
///   whole container becomes sick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A function argument was invalid for the current object state.
    #[error("bad API argument")]
    BadAPIArgument,
    /// A compressed vector binary section header was malformed.
    #[error("bad compressed vector header")]
    BadCVHeader,
    /// A compressed vector packet was malformed.
    #[error("bad compressed vector packet")]
    BadCVPacket,
    /// A page checksum did not match its payload.
    #[error("page checksum mismatch")]
    BadChecksum,
    /// A generic node handle was downcast to the wrong variant.
    #[error("bad node downcast")]
    BadNodeDowncast,
    /// An element name or path string was not well formed, or collided.
    #[error("bad path name")]
    BadPathName,
    /// Buffer capacities disagreed, or the buffer set did not match the
    /// prototype field set.
    #[error("buffer size mismatch")]
    BufferSizeMismatch,
    /// Two buffers were bound to the same prototype path.
    #[error("duplicate buffer path name")]
    BufferDuplicatePathName,
    /// A lossy conversion was needed but `do_conversion` was not set.
    #[error("conversion required")]
    ConversionRequired,
    /// A string buffer was bound to a numeric prototype field.
    #[error("expecting numeric buffer")]
    ExpectingNumeric,
    /// A numeric buffer was bound to a string prototype field.
    #[error("expecting ustring buffer")]
    ExpectingUString,
    /// The container was opened read-only.
    #[error("image file is read only")]
    FileReadOnly,
    /// The container is closed or in an unusable state.
    #[error("image file not open")]
    ImageFileNotOpen,
    /// An unreachable state was reached; objects are in undocumented state.
    #[error("internal error")]
    InternalError,
    /// An explicit invariant check failed.
    #[error("invariance violation")]
    InvarianceViolation,
    /// A path did not resolve to a node.
    #[error("path undefined")]
    PathUndefined,
    /// The reader has been closed.
    #[error("reader not open")]
    ReaderNotOpen,
    /// A floating point value was too large for the integer target.
    #[error("real64 too large")]
    Real64TooLarge,
    /// An integer value is not exactly representable in the float target.
    #[error("scaled value not representable")]
    ScaledValueNotRepresentable,
    /// A file seek failed.
    #[error("seek failed")]
    SeekFailed,
    /// A file read failed.
    #[error("read failed")]
    ReadFailed,
    /// A file write failed.
    #[error("write failed")]
    WriteFailed,
    /// A structural element was set after the structure was sealed.
    #[error("element set twice")]
    SetTwice,
    /// A reader could not be opened because a writer exists.
    #[error("too many readers")]
    TooManyReaders,
    /// A writer could not be opened because a writer or readers exist.
    #[error("too many writers")]
    TooManyWriters,
    /// A stored value exceeds the range of the target integer type.
    #[error("value not representable")]
    ValueNotRepresentable,
    /// A value lies outside the declared `[minimum, maximum]` bounds.
    #[error("value out of bounds")]
    ValueOutOfBounds,
    /// The writer has been closed.
    #[error("writer not open")]
    WriterNotOpen,
    /// The node already has a parent and cannot be attached again.
    #[error("node already has a parent")]
    AlreadyHasParent,
}

/// The error type for E57 operations: a kind, a textual context, and an
/// optional trail of operation names recorded while propagating.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: String,
    trail: Vec<&'static str>,
}

impl Error {
    /// Creates an error of the given kind with a textual context.
    pub fn new(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: context.into(),
            trail: Vec::new(),
        }
    }

    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The textual context recorded at the failure site.
    pub fn context(&self) -> &str {
        &self.context
    }

    /// Operation names recorded while the error propagated, innermost first.
    pub fn trail(&self) -> &[&'static str] {
        &self.trail
    }

    /// Records an operation name on the propagation trail.
    pub fn in_operation(mut self, operation: &'static str) -> Self {
        self.trail.push(operation);
        self
    }

    /// True if this kind sickens the reader/writer that hit it.
    pub(crate) fn sickens_handle(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::ConversionRequired
                | ErrorKind::ValueNotRepresentable
                | ErrorKind::ScaledValueNotRepresentable
                | ErrorKind::Real64TooLarge
                | ErrorKind::ExpectingNumeric
                | ErrorKind::ExpectingUString
        ) || self.sickens_container()
    }

    /// True if this kind sickens the whole container.
    pub(crate) fn sickens_container(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::SeekFailed
                | ErrorKind::ReadFailed
                | ErrorKind::WriteFailed
                | ErrorKind::BadCVPacket
                | ErrorKind::BadChecksum
                | ErrorKind::BadCVHeader
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.context)?;
        if !self.trail.is_empty() {
            write!(f, " (in {})", self.trail.join(" <- "))?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}
