//! Block identifiers
//!
//! A block identifier names a block by the file that stores it, the byte
//! offset inside that file, and the block size. Sizes are always positive
//! multiples of the block alignment. [`Bid`] fixes the size at compile
//! time; [`DynBid`] carries it at runtime. Both read and write through the
//! owning file's request queue.

use std::sync::Arc;

use crate::buffer::{AlignedBuf, BLOCK_ALIGNMENT};
use crate::error::{BlocklineError, Result};
use crate::io::request::{CompletionHandler, RequestPtr};
use crate::io::{same_file, DiskFile, FileExt, FilePtr};

/// Access to the fields the allocators fill in, independent of whether the
/// block size is a compile-time or runtime value.
pub trait BlockDescriptor {
    /// Block size in bytes.
    fn bytes(&self) -> usize;

    fn storage(&self) -> Option<&FilePtr>;

    fn set_storage(&mut self, file: FilePtr);

    fn offset(&self) -> u64;

    fn set_offset(&mut self, offset: u64);
}

/// Block identifier with a compile-time block size.
#[derive(Clone, Default)]
pub struct Bid<const N: usize> {
    pub storage: Option<FilePtr>,
    pub offset: u64,
}

impl<const N: usize> Bid<N> {
    /// Block size in bytes.
    pub const BYTES: usize = N;

    pub fn new() -> Self {
        debug_assert!(N > 0 && N % BLOCK_ALIGNMENT == 0);
        Self {
            storage: None,
            offset: 0,
        }
    }

    /// True once the block manager assigned storage.
    pub fn valid(&self) -> bool {
        self.storage.is_some()
    }

    /// True iff the owning file belongs to a disk allocator.
    pub fn is_managed(&self) -> bool {
        self.storage
            .as_ref()
            .map(|f| f.allocator_id().is_some())
            .unwrap_or(false)
    }

    /// Schedule an asynchronous read of this block into `buf`.
    pub fn read(&self, buf: AlignedBuf, on_complete: Option<CompletionHandler>) -> Result<RequestPtr> {
        let file = self
            .storage
            .as_ref()
            .ok_or_else(|| BlocklineError::invalid("block has no storage assigned"))?;
        file.aread(buf, self.offset, on_complete)
    }

    /// Schedule an asynchronous write of `buf` to this block.
    pub fn write(&self, buf: AlignedBuf, on_complete: Option<CompletionHandler>) -> Result<RequestPtr> {
        let file = self
            .storage
            .as_ref()
            .ok_or_else(|| BlocklineError::invalid("block has no storage assigned"))?;
        file.awrite(buf, self.offset, on_complete)
    }
}

impl<const N: usize> BlockDescriptor for Bid<N> {
    fn bytes(&self) -> usize {
        N
    }

    fn storage(&self) -> Option<&FilePtr> {
        self.storage.as_ref()
    }

    fn set_storage(&mut self, file: FilePtr) {
        self.storage = Some(file);
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }
}

impl<const N: usize> PartialEq for Bid<N> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
            && match (&self.storage, &other.storage) {
                (Some(a), Some(b)) => same_file(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

impl<const N: usize> Eq for Bid<N> {}

impl<const N: usize> std::fmt::Debug for Bid<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bid[{}]{:#x}/{:#x}",
            self.storage
                .as_ref()
                .map(|s| s.io_type())
                .unwrap_or("unassigned"),
            self.offset,
            N,
        )
    }
}

/// Block identifier with a runtime block size.
#[derive(Clone, Default)]
pub struct DynBid {
    pub storage: Option<FilePtr>,
    pub offset: u64,
    pub size: usize,
}

impl DynBid {
    pub fn new(size: usize) -> Self {
        debug_assert!(size > 0 && size % BLOCK_ALIGNMENT == 0);
        Self {
            storage: None,
            offset: 0,
            size,
        }
    }

    pub fn valid(&self) -> bool {
        self.storage.is_some()
    }

    pub fn is_managed(&self) -> bool {
        self.storage
            .as_ref()
            .map(|f| f.allocator_id().is_some())
            .unwrap_or(false)
    }

    pub fn read(&self, buf: AlignedBuf, on_complete: Option<CompletionHandler>) -> Result<RequestPtr> {
        let file = self
            .storage
            .as_ref()
            .ok_or_else(|| BlocklineError::invalid("block has no storage assigned"))?;
        file.aread(buf, self.offset, on_complete)
    }

    pub fn write(&self, buf: AlignedBuf, on_complete: Option<CompletionHandler>) -> Result<RequestPtr> {
        let file = self
            .storage
            .as_ref()
            .ok_or_else(|| BlocklineError::invalid("block has no storage assigned"))?;
        file.awrite(buf, self.offset, on_complete)
    }
}

impl BlockDescriptor for DynBid {
    fn bytes(&self) -> usize {
        self.size
    }

    fn storage(&self) -> Option<&FilePtr> {
        self.storage.as_ref()
    }

    fn set_storage(&mut self, file: FilePtr) {
        self.storage = Some(file);
    }

    fn offset(&self) -> u64 {
        self.offset
    }

    fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }
}

impl PartialEq for DynBid {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
            && self.size == other.size
            && match (&self.storage, &other.storage) {
                (Some(a), Some(b)) => same_file(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

impl Eq for DynBid {}

impl std::fmt::Debug for DynBid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bid[{}]{:#x}/{:#x}",
            self.storage
                .as_ref()
                .map(|s| s.io_type())
                .unwrap_or("unassigned"),
            self.offset,
            self.size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DirectMode, DiskConfig};
    use crate::io::create_file;
    use tempfile::tempdir;

    fn file(dir: &tempfile::TempDir, name: &str, device: u32) -> FilePtr {
        let cfg = DiskConfig::new(dir.path().join(name), 1 << 20).direct(DirectMode::Off);
        create_file(&cfg, device, None).unwrap()
    }

    #[test]
    fn sized_bid_reports_its_size() {
        let bid = Bid::<{ 1 << 20 }>::new();
        assert_eq!(bid.bytes(), 1 << 20);
        assert!(!bid.valid());
    }

    #[test]
    fn equality_needs_same_file_and_offset() {
        let dir = tempdir().unwrap();
        let a = file(&dir, "a", 7700);
        let b = file(&dir, "b", 7701);

        let mut x = Bid::<4096>::new();
        let mut y = Bid::<4096>::new();
        assert_eq!(x, y);

        x.set_storage(Arc::clone(&a));
        y.set_storage(Arc::clone(&a));
        x.set_offset(4096);
        y.set_offset(4096);
        assert_eq!(x, y);

        y.set_storage(b);
        assert_ne!(x, y);
    }

    #[test]
    fn dyn_bid_carries_runtime_size() {
        let mut bid = DynBid::new(8192);
        assert_eq!(bid.bytes(), 8192);
        bid.set_offset(4096);
        assert_eq!(bid.offset(), 4096);
    }

    #[test]
    fn unassigned_bid_cannot_transfer() {
        let bid = DynBid::new(4096);
        let buf = AlignedBuf::new(4096).unwrap();
        assert!(bid.read(buf, None).is_err());
    }
}
