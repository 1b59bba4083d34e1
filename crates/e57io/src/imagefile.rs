//! Container lifecycle: open/close, header, root node, transfer counts.
//!
//! An [`ImageFile`] owns the paged file image, the predefined root
//! structure, and the reader/writer bookkeeping every transfer engine
//! consults. The first 48 bytes of page 0 hold the file header:
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    8       magic "ASTM-E57"
//! 0x08    4       version major (u32 LE) = 1
//! 0x0C    4       version minor (u32 LE) = 0
//! 0x10    8       file physical length (u64 LE)
//! 0x18    8       XML logical offset (u64 LE)
//! 0x20    8       XML logical length (u64 LE)
//! 0x28    8       page size (u64 LE)
//! ```
//!
//! The header is written as a placeholder at creation and patched with the
//! final lengths at close. The XML section itself is produced and consumed
//! by an external schema layer; this module only stores and returns its
//! raw bytes.

use crate::error::{Error, ErrorKind, Result};
use crate::node::{NodeBody, StructureNode};
use crate::paging::{PagedFile, DEFAULT_PAGE_SIZE};
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, warn};

/// Serialized size of the file header.
pub const FILE_HEADER_SIZE: usize = 48;

/// File signature at offset zero.
pub const FILE_MAGIC: [u8; 8] = *b"ASTM-E57";

/// Supported major format version.
pub const VERSION_MAJOR: u32 = 1;

/// Supported minor format version.
pub const VERSION_MINOR: u32 = 0;

/// The fixed-layout file header occupying the start of page 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileHeader {
    physical_length: u64,
    xml_offset: u64,
    xml_length: u64,
    page_size: u64,
}

impl FileHeader {
    fn to_bytes(self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[0..8].copy_from_slice(&FILE_MAGIC);
        out[8..12].copy_from_slice(&VERSION_MAJOR.to_le_bytes());
        out[12..16].copy_from_slice(&VERSION_MINOR.to_le_bytes());
        out[16..24].copy_from_slice(&self.physical_length.to_le_bytes());
        out[24..32].copy_from_slice(&self.xml_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.xml_length.to_le_bytes());
        out[40..48].copy_from_slice(&self.page_size.to_le_bytes());
        out
    }

    fn from_bytes(bytes: &[u8; FILE_HEADER_SIZE]) -> Result<Self> {
        if bytes[0..8] != FILE_MAGIC {
            return Err(Error::new(
                ErrorKind::BadCVHeader,
                format!("bad file signature {:?}", &bytes[0..8]),
            ));
        }
        let major = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let minor = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        if major != VERSION_MAJOR {
            return Err(Error::new(
                ErrorKind::BadCVHeader,
                format!("unsupported format version {major}.{minor}"),
            ));
        }
        let header = Self {
            physical_length: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            xml_offset: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            xml_length: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            page_size: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
        };
        if header.page_size < FILE_HEADER_SIZE as u64 + 4 || header.page_size > u32::MAX as u64 {
            return Err(Error::new(
                ErrorKind::BadCVHeader,
                format!("implausible page size {}", header.page_size),
            ));
        }
        Ok(header)
    }
}

/// Shared container state referenced by every node and transfer engine.
#[derive(Debug)]
pub(crate) struct ImageFileBody {
    pub(crate) path: PathBuf,
    pub(crate) paged: RefCell<PagedFile>,
    pub(crate) writable: bool,
    pub(crate) open: Cell<bool>,
    pub(crate) sick: Cell<bool>,
    pub(crate) reader_count: Cell<usize>,
    pub(crate) writer_count: Cell<usize>,
    root: Rc<NodeBody>,
    xml: RefCell<Vec<u8>>,
    xml_span: Cell<(u64, u64)>,
    /// Next free logical offset for sections, blobs, and the XML text.
    alloc_cursor: Cell<u64>,
}

impl ImageFileBody {
    /// Fails unless the container is open and not sick.
    pub(crate) fn require_usable(&self) -> Result<()> {
        if !self.open.get() {
            return Err(Error::new(ErrorKind::ImageFileNotOpen, "image file is closed"));
        }
        if self.sick.get() {
            return Err(Error::new(
                ErrorKind::ImageFileNotOpen,
                "image file is in an unusable state after an earlier I/O error",
            ));
        }
        Ok(())
    }

    /// Marks the container sick when `err` belongs to the I/O or
    /// structural class, then hands the error back.
    pub(crate) fn sicken(&self, err: Error) -> Error {
        if err.sickens_container() {
            self.sick.set(true);
        }
        err
    }

    pub(crate) fn root_body(&self) -> Rc<NodeBody> {
        Rc::clone(&self.root)
    }

    /// Reserves `len` logical bytes and returns their starting offset.
    pub(crate) fn allocate(&self, len: u64) -> u64 {
        let at = self.alloc_cursor.get();
        self.alloc_cursor.set(at + len);
        at
    }

    /// Aligns the allocation cursor to the next page-payload boundary and
    /// returns it; the caller reserves the section with [`Self::end_section`].
    pub(crate) fn begin_section(&self) -> u64 {
        let aligned = self.paged.borrow().align_up_to_page(self.alloc_cursor.get());
        self.alloc_cursor.set(aligned);
        aligned
    }

    /// Records the end of a section begun with [`Self::begin_section`].
    pub(crate) fn end_section(&self, end: u64) {
        debug_assert!(end >= self.alloc_cursor.get());
        self.alloc_cursor.set(end);
    }
}

impl Drop for ImageFileBody {
    fn drop(&mut self) {
        if self.open.get() && self.writable {
            warn!(path = ?self.path, "image file dropped while open; header was not patched");
        }
    }
}

/// Handle to an open E57 container.
///
/// Handles are cheap to clone and share one underlying container. Closing
/// the container invalidates every node, reader, and writer derived from
/// it; their operations fail with `ImageFileNotOpen` afterwards.
#[derive(Debug, Clone)]
pub struct ImageFile {
    pub(crate) body: Rc<ImageFileBody>,
}

impl ImageFile {
    /// Creates a new container for writing, with the default 1024-byte
    /// page size.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Self::create_with_page_size(path, DEFAULT_PAGE_SIZE)
    }

    /// Creates a new container for writing with an explicit page size.
    pub fn create_with_page_size(path: impl AsRef<Path>, page_size: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut paged = PagedFile::create(&path, page_size)?;

        // Placeholder header; the real lengths are patched at close.
        let header = FileHeader {
            physical_length: 0,
            xml_offset: 0,
            xml_length: 0,
            page_size: page_size as u64,
        };
        paged.write_logical(0, &header.to_bytes())?;

        let body = Rc::new_cyclic(|weak| ImageFileBody {
            path,
            paged: RefCell::new(paged),
            writable: true,
            open: Cell::new(true),
            sick: Cell::new(false),
            reader_count: Cell::new(0),
            writer_count: Cell::new(0),
            root: NodeBody::new_root(weak),
            xml: RefCell::new(Vec::new()),
            xml_span: Cell::new((0, 0)),
            alloc_cursor: Cell::new(FILE_HEADER_SIZE as u64),
        });
        Ok(Self { body })
    }

    /// Opens an existing container for reading. The header is parsed and
    /// page 0 is checksum-verified; the node tree is left empty for the
    /// schema layer to reconstruct from the XML section.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        // The page size needed to verify page 0 comes from the header
        // itself, so the first 48 bytes are read raw.
        let mut prefix = [0u8; FILE_HEADER_SIZE];
        File::open(&path)
            .and_then(|mut f| f.read_exact(&mut prefix))
            .map_err(|e| Error::new(ErrorKind::ReadFailed, format!("open {path:?}: {e}")))?;
        let header = FileHeader::from_bytes(&prefix)?;

        let mut paged = PagedFile::open(&path, header.page_size as u32)?;
        // Re-read through the page layer to enforce the page 0 checksum.
        let mut verified = [0u8; FILE_HEADER_SIZE];
        paged.read_logical(0, &mut verified)?;
        let logical_length = paged.logical_length()?;

        let body = Rc::new_cyclic(|weak| ImageFileBody {
            path,
            paged: RefCell::new(paged),
            writable: false,
            open: Cell::new(true),
            sick: Cell::new(false),
            reader_count: Cell::new(0),
            writer_count: Cell::new(0),
            root: NodeBody::new_root(weak),
            xml: RefCell::new(Vec::new()),
            xml_span: Cell::new((header.xml_offset, header.xml_length)),
            alloc_cursor: Cell::new(logical_length),
        });
        Ok(Self { body })
    }

    pub(crate) fn from_body(body: Rc<ImageFileBody>) -> Self {
        Self { body }
    }

    /// Grants node constructors access to the container body. The
    /// container must be open; read-only containers are permitted so the
    /// schema layer can reconstruct the declared tree.
    pub(crate) fn creation_body(&self) -> Result<Rc<ImageFileBody>> {
        self.body.require_usable()?;
        Ok(Rc::clone(&self.body))
    }

    /// The predefined root structure of the container.
    pub fn root(&self) -> Result<StructureNode> {
        self.body.require_usable()?;
        Ok(StructureNode::from_body(self.body.root_body()))
    }

    /// True while the container has not been closed and is not sick.
    pub fn is_open(&self) -> bool {
        self.body.open.get() && !self.body.sick.get()
    }

    /// True if the container was created for writing.
    pub fn is_writable(&self) -> bool {
        self.body.writable
    }

    /// Number of open readers over this container.
    pub fn reader_count(&self) -> Result<usize> {
        self.body.require_usable()?;
        Ok(self.body.reader_count.get())
    }

    /// Number of open writers over this container (0 or 1).
    pub fn writer_count(&self) -> Result<usize> {
        self.body.require_usable()?;
        Ok(self.body.writer_count.get())
    }

    /// The physical page size of the container.
    pub fn page_size(&self) -> u32 {
        self.body.paged.borrow().page_size()
    }

    /// The path the container was created or opened at.
    pub fn path(&self) -> PathBuf {
        self.body.path.clone()
    }

    /// Stashes the serialized XML section to be written at close. The
    /// bytes are produced by the external schema layer.
    pub fn set_xml(&self, bytes: Vec<u8>) -> Result<()> {
        self.body.require_usable()?;
        if !self.body.writable {
            return Err(Error::new(ErrorKind::FileReadOnly, "set_xml"));
        }
        *self.body.xml.borrow_mut() = bytes;
        Ok(())
    }

    /// Returns the raw XML section bytes: the stash on a writable
    /// container, the on-disk section otherwise.
    pub fn xml_bytes(&self) -> Result<Vec<u8>> {
        self.body.require_usable()?;
        if self.body.writable {
            return Ok(self.body.xml.borrow().clone());
        }
        let (offset, length) = self.body.xml_span.get();
        let mut bytes = vec![0u8; length as usize];
        self.body
            .paged
            .borrow_mut()
            .read_logical(offset, &mut bytes)
            .map_err(|e| self.body.sicken(e))?;
        Ok(bytes)
    }

    /// Closes the container: on a writable container, writes the XML
    /// section, patches the header, and syncs. Invalidates all handles.
    /// Closing an already-closed container is not an error.
    ///
    /// # Errors
    ///
    /// `BadAPIArgument` while readers or writers are still open;
    /// `WriteFailed` if flushing fails.
    pub fn close(&self) -> Result<()> {
        if !self.body.open.get() {
            return Ok(());
        }
        if self.body.reader_count.get() > 0 || self.body.writer_count.get() > 0 {
            return Err(Error::new(
                ErrorKind::BadAPIArgument,
                format!(
                    "{} readers and {} writers still open",
                    self.body.reader_count.get(),
                    self.body.writer_count.get()
                ),
            ));
        }
        if self.body.sick.get() {
            warn!(path = ?self.body.path, "closing sick image file without patching the header");
            self.body.open.set(false);
            return Ok(());
        }
        if self.body.writable {
            self.finish_write().map_err(|e| self.body.sicken(e))?;
        }
        self.body.open.set(false);
        Ok(())
    }

    fn finish_write(&self) -> Result<()> {
        let xml = self.body.xml.borrow();
        let mut paged = self.body.paged.borrow_mut();

        let (xml_offset, xml_length) = if xml.is_empty() {
            (0, 0)
        } else {
            let offset = self.body.allocate(xml.len() as u64);
            paged.write_logical(offset, &xml)?;
            (offset, xml.len() as u64)
        };
        self.body.xml_span.set((xml_offset, xml_length));

        // Page 0 already exists, so writing the header cannot change the
        // physical length recorded in it.
        let header = FileHeader {
            physical_length: paged.physical_length()?,
            xml_offset,
            xml_length,
            page_size: paged.page_size() as u64,
        };
        paged.write_logical(0, &header.to_bytes())?;
        paged.sync()?;
        debug!(path = ?self.body.path, length = header.physical_length, "image file closed");
        Ok(())
    }

    /// Checks the externally visible container invariants: transfer
    /// counts are consistent and the root is a parentless structure.
    pub fn check_invariant(&self, do_recurse: bool) -> Result<()> {
        if self.body.require_usable().is_err() {
            return Ok(());
        }
        if self.body.writer_count.get() > 1 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "more than one writer open",
            ));
        }
        if self.body.writer_count.get() > 0 && self.body.reader_count.get() > 0 {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "readers and a writer open at once",
            ));
        }
        let root = self.root()?;
        if !root.is_root() {
            return Err(Error::new(
                ErrorKind::InvarianceViolation,
                "container root has a parent",
            ));
        }
        if do_recurse {
            root.check_invariant(true, true)?;
        }
        Ok(())
    }
}
