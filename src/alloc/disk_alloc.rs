//! Per-disk free-space management
//!
//! The allocator keeps an ordered map `start-offset → extent-length` of the
//! free regions of one disk. Entries are pairwise disjoint and never
//! adjacent: freeing always merges with its neighbors, so the number of
//! entries is bounded by fragmentation, not by the number of frees.
//!
//! Allocation is first-fit on the total requested size. If nothing fits
//! and the disk may grow, the file is extended; otherwise the request is
//! split in half recursively to place it into smaller extents. A failing
//! allocation returns every extent it already carved, leaving the map
//! exactly as it was.

use std::collections::BTreeMap;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::alloc::bid::BlockDescriptor;
use crate::config::DiskConfig;
use crate::error::{BlocklineError, Result};
use crate::io::{DiskFile, FilePtr};

struct Inner {
    free_space: BTreeMap<u64, u64>,
    free_bytes: u64,
    disk_bytes: u64,
}

/// Free-space map of one disk.
pub struct DiskAllocator {
    inner: Mutex<Inner>,
    cfg_bytes: u64,
    autogrow: bool,
    storage: FilePtr,
}

impl DiskAllocator {
    /// Build the allocator and size the file to its configured capacity.
    pub fn new(storage: FilePtr, cfg: &DiskConfig) -> Result<Self> {
        let allocator = Self {
            inner: Mutex::new(Inner {
                free_space: BTreeMap::new(),
                free_bytes: 0,
                disk_bytes: 0,
            }),
            cfg_bytes: cfg.size,
            autogrow: cfg.autogrow,
            storage,
        };
        {
            let mut inner = allocator.inner.lock();
            allocator.grow_file(&mut inner, cfg.size)?;
        }
        Ok(allocator)
    }

    pub fn autogrow(&self) -> bool {
        self.autogrow
    }

    pub fn free_bytes(&self) -> u64 {
        self.inner.lock().free_bytes
    }

    pub fn used_bytes(&self) -> u64 {
        let inner = self.inner.lock();
        inner.disk_bytes - inner.free_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().disk_bytes
    }

    /// Whether `bytes` could be allocated without failing.
    pub fn has_available_space(&self, bytes: u64) -> bool {
        self.autogrow || self.free_bytes() >= bytes
    }

    /// Copy of the free-space map, for assertions and diagnostics.
    pub fn free_extents(&self) -> Vec<(u64, u64)> {
        self.inner
            .lock()
            .free_space
            .iter()
            .map(|(&pos, &len)| (pos, len))
            .collect()
    }

    /// Assign offsets to a range of blocks destined for this disk.
    pub fn new_blocks<B: BlockDescriptor>(&self, bids: &mut [B]) -> Result<()> {
        if bids.is_empty() {
            return Ok(());
        }
        let sizes: Vec<u64> = bids.iter().map(|b| b.bytes() as u64).collect();
        let offsets = self.allocate(&sizes)?;
        for (bid, offset) in bids.iter_mut().zip(offsets) {
            bid.set_offset(offset);
        }
        Ok(())
    }

    /// Allocate a run of extents with the given sizes; returns one offset
    /// per size, in order. Either the whole run is placed or the map is
    /// left untouched.
    pub fn allocate(&self, sizes: &[u64]) -> Result<Vec<u64>> {
        let mut offsets = vec![0u64; sizes.len()];
        let mut placed: Vec<(u64, u64)> = Vec::new();
        match self.allocate_run(sizes, &mut offsets, &mut placed) {
            Ok(()) => Ok(offsets),
            Err(err) => {
                let mut inner = self.inner.lock();
                for (pos, len) in placed {
                    if let Err(e) = Self::add_free_region(&mut inner, pos, len) {
                        warn!(pos, len, error = %e, "failed to roll back allocation");
                    }
                }
                Err(err)
            }
        }
    }

    fn allocate_run(
        &self,
        sizes: &[u64],
        offsets: &mut [u64],
        placed: &mut Vec<(u64, u64)>,
    ) -> Result<()> {
        let requested: u64 = sizes.iter().sum();
        let mut inner = self.inner.lock();

        debug!(
            requested,
            blocks = sizes.len(),
            free = inner.free_bytes,
            total = inner.disk_bytes,
            "allocating blocks"
        );

        if inner.free_bytes < requested {
            if !self.autogrow {
                return Err(BlocklineError::OutOfSpace {
                    requested,
                    free: inner.free_bytes,
                });
            }
            self.grow_file(&mut inner, requested)?;
        }

        let mut region = Self::find_first_fit(&inner, requested);
        if region.is_none() && sizes.len() == 1 {
            if !self.autogrow {
                warn!(
                    requested,
                    free = inner.free_bytes,
                    "severe free-space fragmentation, nothing fits"
                );
                return Err(BlocklineError::OutOfSpace {
                    requested,
                    free: inner.free_bytes,
                });
            }
            self.grow_file(&mut inner, requested)?;
            region = Self::find_first_fit(&inner, requested);
        }

        if let Some(region_pos) = region {
            let region_size = inner
                .free_space
                .remove(&region_pos)
                .expect("first-fit extent exists");
            if region_size > requested {
                inner
                    .free_space
                    .insert(region_pos + requested, region_size - requested);
            }
            inner.free_bytes -= requested;
            placed.push((region_pos, requested));

            let mut pos = region_pos;
            for (offset, size) in offsets.iter_mut().zip(sizes) {
                *offset = pos;
                pos += size;
            }
            return Ok(());
        }

        // no contiguous region: place the two halves independently
        debug!(
            requested,
            blocks = sizes.len(),
            "no contiguous free region, splitting the request"
        );
        drop(inner);
        let mid = sizes.len() / 2;
        let (left_sizes, right_sizes) = sizes.split_at(mid);
        let (left_offsets, right_offsets) = offsets.split_at_mut(mid);
        self.allocate_run(left_sizes, left_offsets, placed)?;
        self.allocate_run(right_sizes, right_offsets, placed)
    }

    fn find_first_fit(inner: &MutexGuard<'_, Inner>, requested: u64) -> Option<u64> {
        inner
            .free_space
            .iter()
            .find(|(_, &len)| len >= requested)
            .map(|(&pos, _)| pos)
    }

    /// Return one block's region to the free-space map.
    pub fn delete_block<B: BlockDescriptor>(&self, bid: &B) -> Result<()> {
        self.free_region(bid.offset(), bid.bytes() as u64)
    }

    /// Return every block of the slice.
    pub fn delete_blocks<B: BlockDescriptor>(&self, bids: &[B]) -> Result<()> {
        for bid in bids {
            self.delete_block(bid)?;
        }
        Ok(())
    }

    pub(crate) fn free_region(&self, offset: u64, len: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        debug!(
            offset,
            len,
            free = inner.free_bytes,
            total = inner.disk_bytes,
            "freeing block"
        );
        Self::add_free_region(&mut inner, offset, len)
    }

    /// Extend the file and hand the new tail to the free-space map.
    fn grow_file(&self, inner: &mut MutexGuard<'_, Inner>, extend: u64) -> Result<()> {
        if extend == 0 {
            return Ok(());
        }
        let new_size = inner.disk_bytes + extend;
        self.storage.set_size(new_size)?;
        let pos = inner.disk_bytes;
        Self::add_free_region(inner, pos, extend)?;
        inner.disk_bytes = new_size;
        debug!(new_size, extend, "disk grown");
        Ok(())
    }

    /// Insert `[pos, pos+len)` into the map, merging with the adjacent
    /// extents. Any overlap with an existing extent is a double free.
    fn add_free_region(inner: &mut Inner, pos: u64, len: u64) -> Result<()> {
        let pred = inner
            .free_space
            .range(..pos)
            .next_back()
            .map(|(&p, &l)| (p, l));
        let succ = inner.free_space.range(pos..).next().map(|(&p, &l)| (p, l));

        if let Some((p, l)) = pred {
            if p + l > pos {
                return Err(BlocklineError::DoubleFree {
                    offset: pos,
                    size: len,
                    free_offset: p,
                    free_size: l,
                });
            }
        }
        if let Some((p, l)) = succ {
            if pos + len > p {
                return Err(BlocklineError::DoubleFree {
                    offset: pos,
                    size: len,
                    free_offset: p,
                    free_size: l,
                });
            }
        }

        let mut region_pos = pos;
        let mut region_len = len;
        if let Some((p, l)) = succ {
            if pos + len == p {
                inner.free_space.remove(&p);
                region_len += l;
            }
        }
        if let Some((p, l)) = pred {
            if p + l == pos {
                inner.free_space.remove(&p);
                region_pos = p;
                region_len += l;
            }
        }
        inner.free_space.insert(region_pos, region_len);
        inner.free_bytes += len;
        Ok(())
    }
}

impl Drop for DiskAllocator {
    /// Shrink an autogrown disk back to its configured size.
    fn drop(&mut self) {
        let disk_bytes = self.inner.lock().disk_bytes;
        if disk_bytes > self.cfg_bytes {
            if let Err(e) = self.storage.set_size(self.cfg_bytes) {
                warn!(error = %e, "failed to shrink disk to its configured size");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::bid::DynBid;
    use crate::config::{BackendKind, DirectMode};
    use crate::io::create_file;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn allocator(dir: &tempfile::TempDir, size: u64, autogrow: bool, device: u32) -> DiskAllocator {
        let cfg = DiskConfig::new(dir.path().join(format!("disk{device}")), size)
            .backend(BackendKind::Syscall)
            .direct(DirectMode::Off)
            .autogrow(autogrow);
        let file = create_file(&cfg, device, Some(0)).unwrap();
        DiskAllocator::new(file, &cfg).unwrap()
    }

    fn bids(count: usize, size: usize) -> Vec<DynBid> {
        (0..count).map(|_| DynBid::new(size)).collect()
    }

    /// Free extents must be disjoint, non-adjacent, and sum to free_bytes.
    fn assert_map_invariants(alloc: &DiskAllocator) {
        let extents = alloc.free_extents();
        let mut total = 0u64;
        for window in extents.windows(2) {
            let (p0, l0) = window[0];
            let (p1, _) = window[1];
            assert!(p0 + l0 < p1, "extents adjacent or overlapping");
        }
        for (_, len) in &extents {
            total += len;
        }
        assert_eq!(total, alloc.free_bytes());
        assert_eq!(alloc.free_bytes() + alloc.used_bytes(), alloc.total_bytes());
    }

    #[test]
    fn contiguous_first_fit() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 8 << 20, false, 7800);

        let mut blocks = bids(3, 1 << 20);
        alloc.new_blocks(&mut blocks).unwrap();
        assert_eq!(blocks[0].offset(), 0);
        assert_eq!(blocks[1].offset(), 1 << 20);
        assert_eq!(blocks[2].offset(), 2 << 20);
        assert_eq!(alloc.used_bytes(), 3 << 20);
        assert_map_invariants(&alloc);
    }

    #[test]
    fn first_fit_reuses_freed_hole() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 8 << 20, false, 7801);

        let mut blocks = bids(3, 1 << 20);
        alloc.new_blocks(&mut blocks).unwrap();
        alloc.delete_block(&blocks[1]).unwrap();
        assert_map_invariants(&alloc);

        let mut one = bids(1, 1 << 20);
        alloc.new_blocks(&mut one).unwrap();
        assert_eq!(one[0].offset(), 1 << 20);
        assert_map_invariants(&alloc);
    }

    #[test]
    fn adjacent_frees_coalesce() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 4 << 20, false, 7802);

        let mut blocks = bids(2, 512 << 10);
        alloc.new_blocks(&mut blocks).unwrap();
        alloc.delete_block(&blocks[0]).unwrap();
        alloc.delete_block(&blocks[1]).unwrap();

        let extents = alloc.free_extents();
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0], (0, 4 << 20));
        assert_map_invariants(&alloc);
    }

    #[test]
    fn allocate_then_free_restores_the_map() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 16 << 20, false, 7803);
        let before = alloc.free_extents();

        let mut blocks = bids(7, 1 << 20);
        alloc.new_blocks(&mut blocks).unwrap();
        alloc.delete_blocks(&blocks).unwrap();

        assert_eq!(alloc.free_extents(), before);
        assert_map_invariants(&alloc);
    }

    #[test]
    fn double_free_fails_loudly() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 4 << 20, false, 7804);

        let mut blocks = bids(1, 1 << 20);
        alloc.new_blocks(&mut blocks).unwrap();
        alloc.delete_block(&blocks[0]).unwrap();
        let err = alloc.delete_block(&blocks[0]);
        assert!(matches!(err, Err(BlocklineError::DoubleFree { .. })));
        assert_map_invariants(&alloc);
    }

    #[test]
    fn partial_overlap_free_is_rejected() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 4 << 20, false, 7805);

        let mut blocks = bids(1, 2 << 20);
        alloc.new_blocks(&mut blocks).unwrap();
        alloc.delete_block(&blocks[0]).unwrap();

        // overlaps the free extent's tail
        let err = alloc.free_region(1 << 20, 1 << 20);
        assert!(matches!(err, Err(BlocklineError::DoubleFree { .. })));
    }

    #[test]
    fn out_of_space_without_autogrow() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 1 << 20, false, 7806);

        let mut blocks = bids(2, 1 << 20);
        let err = alloc.new_blocks(&mut blocks);
        assert!(matches!(err, Err(BlocklineError::OutOfSpace { .. })));
        // failing allocation leaves the map unchanged
        assert_eq!(alloc.free_bytes(), 1 << 20);
        assert_map_invariants(&alloc);
    }

    #[test]
    fn autogrow_extends_the_file() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 0, true, 7807);
        assert_eq!(alloc.total_bytes(), 0);

        let mut blocks = bids(4, 1 << 20);
        alloc.new_blocks(&mut blocks).unwrap();
        assert_eq!(alloc.total_bytes(), 4 << 20);
        for (i, bid) in blocks.iter().enumerate() {
            assert_eq!(bid.offset(), (i as u64) << 20);
        }
        assert_map_invariants(&alloc);
    }

    #[test]
    fn fragmented_request_splits_into_holes() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 4 << 20, false, 7808);

        // carve the disk into four blocks, free two non-adjacent ones
        let mut blocks = bids(4, 1 << 20);
        alloc.new_blocks(&mut blocks).unwrap();
        alloc.delete_block(&blocks[0]).unwrap();
        alloc.delete_block(&blocks[2]).unwrap();
        assert_eq!(alloc.free_extents().len(), 2);

        // two blocks cannot sit contiguously, so they go to the two holes
        let mut pair = bids(2, 1 << 20);
        alloc.new_blocks(&mut pair).unwrap();
        let mut offsets = vec![pair[0].offset(), pair[1].offset()];
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 2 << 20]);
        assert_eq!(alloc.free_bytes(), 0);
        assert_map_invariants(&alloc);
    }

    #[test]
    fn failed_split_rolls_back_the_placed_half() {
        let dir = tempdir().unwrap();
        let alloc = allocator(&dir, 4 << 20, false, 7809);

        // free space: one 1 MiB hole plus two isolated 512 KiB holes
        let mut blocks = bids(8, 512 << 10);
        alloc.new_blocks(&mut blocks).unwrap();
        alloc.delete_block(&blocks[0]).unwrap();
        alloc.delete_block(&blocks[1]).unwrap();
        alloc.delete_block(&blocks[3]).unwrap();
        alloc.delete_block(&blocks[5]).unwrap();
        let before = alloc.free_extents();
        assert_eq!(before.len(), 3);

        // two 1 MiB blocks: enough free bytes, but only the first half can
        // be placed; the second finds no 1 MiB extent and the whole
        // allocation must unwind
        let mut pair = bids(2, 1 << 20);
        let err = alloc.new_blocks(&mut pair);
        assert!(matches!(err, Err(BlocklineError::OutOfSpace { .. })));
        assert_eq!(alloc.free_extents(), before);
        assert_map_invariants(&alloc);
    }

    #[test]
    fn disk_shrinks_back_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("disk7810");
        let cfg = DiskConfig::new(&path, 0)
            .direct(DirectMode::Off)
            .autogrow(true);
        let file = create_file(&cfg, 7810, Some(0)).unwrap();
        {
            let alloc = DiskAllocator::new(Arc::clone(&file), &cfg).unwrap();
            let mut blocks = bids(2, 1 << 20);
            alloc.new_blocks(&mut blocks).unwrap();
            assert_eq!(file.size().unwrap(), 2 << 20);
        }
        assert_eq!(file.size().unwrap(), 0);
    }
}
