//! Paged file image with per-page CRC-32C trailers.
//!
//! The container is an array of fixed-size physical pages (1024 bytes by
//! default). The last 4 bytes of every page hold a CRC-32C (Castagnoli)
//! checksum over the preceding payload. All higher layers address the file
//! through *logical* offsets, which skip the checksum trailers:
//!
//! ```text
//! ┌────────────────────────────┬──────┬────────────────────────────┬──────┐
//! │  payload (page_size - 4)   │ CRC  │  payload (page_size - 4)   │ CRC  │
//! └────────────────────────────┴──────┴────────────────────────────┴──────┘
//!  logical 0 .. payload              logical payload .. 2*payload
//! ```
//!
//! Reads verify the checksum of every page they touch and fail with
//! `BadChecksum` on mismatch. Writes recompute the trailer of every page
//! they touch. The physical file length is always a whole number of pages;
//! payload bytes past the logical end are zero.

use crate::error::{Error, ErrorKind, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Default physical page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 1024;

/// Size of the per-page checksum trailer in bytes.
pub const CHECKSUM_SIZE: u32 = 4;

/// A random-access file image made of checksummed pages.
#[derive(Debug)]
pub struct PagedFile {
    file: File,
    page_size: u32,
    writable: bool,
}

impl PagedFile {
    /// Creates a new, empty paged file, truncating any existing file.
    pub fn create(path: &Path, page_size: u32) -> Result<Self> {
        debug_assert!(page_size > CHECKSUM_SIZE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::new(ErrorKind::WriteFailed, format!("create {path:?}: {e}")))?;
        Ok(Self {
            file,
            page_size,
            writable: true,
        })
    }

    /// Opens an existing paged file read-only.
    pub fn open(path: &Path, page_size: u32) -> Result<Self> {
        debug_assert!(page_size > CHECKSUM_SIZE);
        let file = File::open(path)
            .map_err(|e| Error::new(ErrorKind::ReadFailed, format!("open {path:?}: {e}")))?;
        Ok(Self {
            file,
            page_size,
            writable: false,
        })
    }

    /// The physical page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Usable payload bytes per page.
    pub fn page_payload(&self) -> u64 {
        (self.page_size - CHECKSUM_SIZE) as u64
    }

    /// Physical length of the underlying file in bytes.
    pub fn physical_length(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| Error::new(ErrorKind::ReadFailed, format!("metadata: {e}")))
    }

    /// Logical length of the file image (payload bytes across all pages).
    pub fn logical_length(&self) -> Result<u64> {
        let physical = self.physical_length()?;
        Ok(physical / self.page_size as u64 * self.page_payload())
    }

    /// Converts a logical offset to its physical file offset.
    pub fn physical_offset(&self, logical: u64) -> u64 {
        let payload = self.page_payload();
        (logical / payload) * self.page_size as u64 + logical % payload
    }

    /// Rounds a logical offset up to the next page-payload boundary.
    pub fn align_up_to_page(&self, logical: u64) -> u64 {
        let payload = self.page_payload();
        logical.div_ceil(payload) * payload
    }

    /// Reads `buf.len()` logical bytes starting at `logical`, verifying the
    /// checksum of every page touched.
    pub fn read_logical(&mut self, logical: u64, buf: &mut [u8]) -> Result<()> {
        let payload = self.page_payload();
        let mut page = logical / payload;
        let mut offset = (logical % payload) as usize;
        let mut filled = 0usize;

        while filled < buf.len() {
            let contents = self.read_page(page)?;
            let take = (payload as usize - offset).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&contents[offset..offset + take]);
            filled += take;
            offset = 0;
            page += 1;
        }
        Ok(())
    }

    /// Writes `data` at logical offset `logical`, recomputing the checksum
    /// trailer of every page touched. Pages are extended with zero payload
    /// as needed.
    pub fn write_logical(&mut self, logical: u64, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::new(ErrorKind::WriteFailed, "file opened read-only"));
        }
        let payload = self.page_payload();
        let mut page = logical / payload;
        let mut offset = (logical % payload) as usize;
        let mut written = 0usize;

        while written < data.len() {
            // Read-modify-write; fresh pages past the end start zeroed.
            let mut contents = if page < self.page_count()? {
                self.read_page_unchecked(page)?
            } else {
                vec![0u8; payload as usize]
            };
            let take = (payload as usize - offset).min(data.len() - written);
            contents[offset..offset + take].copy_from_slice(&data[written..written + take]);
            self.write_page(page, &contents)?;
            written += take;
            offset = 0;
            page += 1;
        }
        Ok(())
    }

    /// Flushes buffered writes and syncs file contents to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .map_err(|e| Error::new(ErrorKind::WriteFailed, format!("sync: {e}")))
    }

    /// Verifies the checksum of every page, returning the index of the
    /// first corrupt page on failure.
    pub fn verify_all_pages(&mut self) -> Result<()> {
        for page in 0..self.page_count()? {
            self.read_page(page)
                .map_err(|e| e.in_operation("verify_all_pages"))?;
        }
        Ok(())
    }

    fn page_count(&self) -> Result<u64> {
        Ok(self.physical_length()? / self.page_size as u64)
    }

    /// Reads one page's payload and verifies its trailer.
    fn read_page(&mut self, page: u64) -> Result<Vec<u8>> {
        if page >= self.page_count()? {
            // Reads past the physical end see zero payload.
            return Ok(vec![0u8; self.page_payload() as usize]);
        }
        let mut raw = vec![0u8; self.page_size as usize];
        self.seek_physical(page * self.page_size as u64)?;
        self.file
            .read_exact(&mut raw)
            .map_err(|e| Error::new(ErrorKind::ReadFailed, format!("page {page}: {e}")))?;

        let split = (self.page_size - CHECKSUM_SIZE) as usize;
        let stored = u32::from_le_bytes(raw[split..].try_into().unwrap());
        let actual = crc32c::crc32c(&raw[..split]);
        if stored != actual {
            return Err(Error::new(
                ErrorKind::BadChecksum,
                format!("page {page}: stored {stored:#010x}, computed {actual:#010x}"),
            ));
        }
        raw.truncate(split);
        Ok(raw)
    }

    /// Reads one page's payload without verifying the trailer. Used on the
    /// read-modify-write path, where the trailer is about to be replaced.
    fn read_page_unchecked(&mut self, page: u64) -> Result<Vec<u8>> {
        let mut raw = vec![0u8; (self.page_size - CHECKSUM_SIZE) as usize];
        self.seek_physical(page * self.page_size as u64)?;
        self.file
            .read_exact(&mut raw)
            .map_err(|e| Error::new(ErrorKind::ReadFailed, format!("page {page}: {e}")))?;
        Ok(raw)
    }

    /// Writes one page's payload followed by its freshly computed trailer.
    fn write_page(&mut self, page: u64, contents: &[u8]) -> Result<()> {
        debug_assert_eq!(contents.len() as u64, self.page_payload());
        let crc = crc32c::crc32c(contents);
        self.seek_physical(page * self.page_size as u64)?;
        self.file
            .write_all(contents)
            .and_then(|()| self.file.write_all(&crc.to_le_bytes()))
            .map_err(|e| Error::new(ErrorKind::WriteFailed, format!("page {page}: {e}")))
    }

    fn seek_physical(&mut self, physical: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(physical))
            .map(|_| ())
            .map_err(|e| Error::new(ErrorKind::SeekFailed, format!("offset {physical}: {e}")))
    }
}
