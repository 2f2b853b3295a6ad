//! Block manager
//!
//! The top of the allocation stack: opens one file per configured disk,
//! owns the per-disk allocators, and turns "give me N blocks, striped" into
//! per-disk offset assignments. Deletion dispatches back to the allocator
//! owning the block's file.
//!
//! Dropping the manager tears the stack down in order: allocators first
//! (shrinking autogrown files back to their configured size), then the
//! scratch files are removed. Files stay alive beyond that for as long as
//! in-flight requests hold them.

use std::sync::Arc;

use tracing::{debug, info};

use crate::alloc::bid::BlockDescriptor;
use crate::alloc::disk_alloc::DiskAllocator;
use crate::alloc::strategy::AllocStrategy;
use crate::config::DiskConfig;
use crate::error::{BlocklineError, Result};
use crate::io::{create_file, DiskFile, FilePtr};

pub struct BlockManager {
    // allocators come first: they must shrink files before scratch cleanup
    allocators: Vec<DiskAllocator>,
    files: Vec<FilePtr>,
    delete_on_exit: Vec<bool>,
}

impl BlockManager {
    /// Open every configured disk and prime its allocator.
    pub fn new(disks: Vec<DiskConfig>) -> Result<Self> {
        if disks.is_empty() {
            return Err(BlocklineError::config("no disks configured"));
        }

        let mut allocators = Vec::with_capacity(disks.len());
        let mut files: Vec<FilePtr> = Vec::with_capacity(disks.len());
        let mut delete_on_exit = Vec::with_capacity(disks.len());

        for (index, cfg) in disks.into_iter().enumerate() {
            let cfg = cfg.normalize()?;
            let device_id = cfg.device_id.unwrap_or(index as u32);
            let file = create_file(&cfg, device_id, Some(index))?;
            let allocator = DiskAllocator::new(Arc::clone(&file), &cfg)?;
            debug!(
                disk = index,
                path = %cfg.path.display(),
                backend = %cfg.backend,
                size = cfg.size,
                autogrow = cfg.autogrow,
                "disk attached"
            );
            allocators.push(allocator);
            delete_on_exit.push(cfg.delete_on_exit);
            files.push(file);
        }

        let manager = Self {
            allocators,
            files,
            delete_on_exit,
        };
        info!(
            disks = manager.files.len(),
            total_bytes = manager.total_bytes(),
            "block manager initialized"
        );
        Ok(manager)
    }

    pub fn ndisks(&self) -> usize {
        self.files.len()
    }

    /// The file backing disk `index`.
    pub fn file(&self, index: usize) -> &FilePtr {
        &self.files[index]
    }

    /// The allocator of disk `index`.
    pub fn allocator(&self, index: usize) -> &DiskAllocator {
        &self.allocators[index]
    }

    pub fn total_bytes(&self) -> u64 {
        self.allocators.iter().map(|a| a.total_bytes()).sum()
    }

    pub fn free_bytes(&self) -> u64 {
        self.allocators.iter().map(|a| a.free_bytes()).sum()
    }

    pub fn used_bytes(&self) -> u64 {
        self.allocators.iter().map(|a| a.used_bytes()).sum()
    }

    /// Allocate the blocks of `bids` across the disks chosen by
    /// `strategy`, assigning file and offset into each descriptor.
    ///
    /// Either every block is placed or, if some disk cannot satisfy its
    /// share, every placement is undone before the error is returned.
    pub fn new_blocks<S, B>(&self, strategy: &S, bids: &mut [B]) -> Result<()>
    where
        S: AllocStrategy,
        B: BlockDescriptor,
    {
        let ndisks = self.ndisks();
        let mut disk_of = Vec::with_capacity(bids.len());
        let mut sizes_per_disk: Vec<Vec<u64>> = vec![Vec::new(); ndisks];

        for (index, bid) in bids.iter_mut().enumerate() {
            let disk = strategy.assign(index);
            if disk >= ndisks {
                return Err(BlocklineError::invalid(format!(
                    "allocation strategy picked disk {disk}, only {ndisks} configured"
                )));
            }
            bid.set_storage(Arc::clone(&self.files[disk]));
            sizes_per_disk[disk].push(bid.bytes() as u64);
            disk_of.push(disk);
        }

        let mut offsets_per_disk: Vec<Vec<u64>> = vec![Vec::new(); ndisks];
        for disk in 0..ndisks {
            if sizes_per_disk[disk].is_empty() {
                continue;
            }
            match self.allocators[disk].allocate(&sizes_per_disk[disk]) {
                Ok(offsets) => offsets_per_disk[disk] = offsets,
                Err(err) => {
                    // undo the disks that already carved their share
                    for done in 0..disk {
                        let offsets = &offsets_per_disk[done];
                        let sizes = &sizes_per_disk[done];
                        for (&offset, &len) in offsets.iter().zip(sizes) {
                            let _ = self.allocators[done].free_region(offset, len);
                        }
                    }
                    return Err(err);
                }
            }
        }

        let mut cursor = vec![0usize; ndisks];
        for (index, bid) in bids.iter_mut().enumerate() {
            let disk = disk_of[index];
            bid.set_offset(offsets_per_disk[disk][cursor[disk]]);
            cursor[disk] += 1;
        }
        Ok(())
    }

    /// Return one block to its disk's free space.
    pub fn delete_block<B: BlockDescriptor>(&self, bid: &B) -> Result<()> {
        let file = bid
            .storage()
            .ok_or_else(|| BlocklineError::invalid("block has no storage assigned"))?;
        let disk = file
            .allocator_id()
            .ok_or_else(|| BlocklineError::invalid("block does not belong to a managed disk"))?;
        self.allocators[disk].delete_block(bid)?;
        file.discard(bid.offset(), bid.bytes() as u64)?;
        Ok(())
    }

    /// Return a range of blocks.
    pub fn delete_blocks<B: BlockDescriptor>(&self, bids: &[B]) -> Result<()> {
        for bid in bids {
            self.delete_block(bid)?;
        }
        Ok(())
    }
}

impl Drop for BlockManager {
    fn drop(&mut self) {
        // allocators shrink their files while the descriptors are still open
        self.allocators.clear();
        for (file, delete) in self.files.iter().zip(&self.delete_on_exit) {
            if *delete {
                file.close_remove();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::bid::{Bid, DynBid};
    use crate::alloc::strategy::{SingleDisk, Striping};
    use crate::config::DirectMode;
    use tempfile::tempdir;

    const MIB: usize = 1 << 20;

    fn disk(dir: &tempfile::TempDir, name: &str, size: u64, device: u32) -> DiskConfig {
        let mut cfg = DiskConfig::new(dir.path().join(name), size).direct(DirectMode::Off);
        cfg.device_id = Some(device);
        cfg
    }

    #[test]
    fn striping_across_two_disks() {
        let dir = tempdir().unwrap();
        let manager = BlockManager::new(vec![
            disk(&dir, "disk0", 10 << 20, 7900),
            disk(&dir, "disk1", 10 << 20, 7901),
        ])
        .unwrap();

        let mut bids: Vec<Bid<MIB>> = (0..4).map(|_| Bid::new()).collect();
        manager
            .new_blocks(&Striping::new(0, manager.ndisks()), &mut bids)
            .unwrap();

        // blocks 0, 2 on disk 0 at offsets 0 and 1 MiB; 1, 3 on disk 1
        assert!(crate::io::same_file(
            bids[0].storage().unwrap(),
            manager.file(0)
        ));
        assert!(crate::io::same_file(
            bids[1].storage().unwrap(),
            manager.file(1)
        ));
        assert_eq!(bids[0].offset(), 0);
        assert_eq!(bids[1].offset(), 0);
        assert_eq!(bids[2].offset(), MIB as u64);
        assert_eq!(bids[3].offset(), MIB as u64);
    }

    #[test]
    fn delete_dispatches_to_the_owning_disk() {
        let dir = tempdir().unwrap();
        let manager = BlockManager::new(vec![
            disk(&dir, "disk0", 4 << 20, 7902),
            disk(&dir, "disk1", 4 << 20, 7903),
        ])
        .unwrap();

        let mut bids: Vec<Bid<MIB>> = (0..4).map(|_| Bid::new()).collect();
        manager
            .new_blocks(&Striping::new(0, 2), &mut bids)
            .unwrap();
        assert_eq!(manager.used_bytes(), 4 << 20);

        manager.delete_blocks(&bids).unwrap();
        assert_eq!(manager.used_bytes(), 0);
        assert_eq!(manager.allocator(0).used_bytes(), 0);
        assert_eq!(manager.allocator(1).used_bytes(), 0);
    }

    #[test]
    fn failing_disk_unwinds_the_others() {
        let dir = tempdir().unwrap();
        // disk 1 is too small for its share
        let manager = BlockManager::new(vec![
            disk(&dir, "disk0", 10 << 20, 7904),
            disk(&dir, "disk1", 1 << 20, 7905),
        ])
        .unwrap();

        let mut bids: Vec<Bid<MIB>> = (0..6).map(|_| Bid::new()).collect();
        let err = manager.new_blocks(&Striping::new(0, 2), &mut bids);
        assert!(err.is_err());
        assert_eq!(manager.used_bytes(), 0);
    }

    #[test]
    fn runtime_sized_blocks_allocate_too() {
        let dir = tempdir().unwrap();
        let manager = BlockManager::new(vec![disk(&dir, "disk0", 8 << 20, 7906)]).unwrap();

        let mut bids = vec![DynBid::new(MIB), DynBid::new(2 * MIB), DynBid::new(MIB)];
        manager.new_blocks(&SingleDisk::new(0), &mut bids).unwrap();
        assert_eq!(bids[0].offset(), 0);
        assert_eq!(bids[1].offset(), MIB as u64);
        assert_eq!(bids[2].offset(), 3 * MIB as u64);
        assert_eq!(manager.used_bytes(), 4 << 20);
    }

    #[test]
    fn strategy_out_of_range_is_rejected() {
        let dir = tempdir().unwrap();
        let manager = BlockManager::new(vec![disk(&dir, "disk0", 4 << 20, 7907)]).unwrap();
        let mut bids: Vec<Bid<MIB>> = vec![Bid::new()];
        let err = manager.new_blocks(&SingleDisk::new(5), &mut bids);
        assert!(err.is_err());
    }

    #[test]
    fn scratch_disks_vanish_on_drop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scratch");
        {
            let mut cfg = DiskConfig::new(&path, 0).direct(DirectMode::Off);
            cfg.device_id = Some(7908);
            let manager = BlockManager::new(vec![cfg]).unwrap();
            let mut bids: Vec<Bid<MIB>> = (0..2).map(|_| Bid::new()).collect();
            manager.new_blocks(&SingleDisk::new(0), &mut bids).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
