//! Memory-map file backend
//!
//! Serves each transfer by mapping exactly the requested window, copying
//! between the mapping and the request buffer, and unmapping. The window
//! must lie within the file, so the block layer sizes the file before any
//! transfer is issued; offsets are page-aligned by the block alignment
//! contract.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::MmapOptions;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DirectMode;
use crate::error::{BlocklineError, Result};
use crate::io::{open_disk_file, unlink_after_open, DiskFile, RequestKind};
use crate::stats::{FileStats, Stats};

pub struct MmapFile {
    file: Mutex<File>,
    path: PathBuf,
    device_id: u32,
    allocator_id: Option<usize>,
    queue_id: i64,
    stats: Arc<FileStats>,
}

impl MmapFile {
    pub fn open(
        path: &Path,
        direct: DirectMode,
        device_id: u32,
        allocator_id: Option<usize>,
        queue_id: i64,
        unlink_on_open: bool,
    ) -> Result<Self> {
        let (file, _direct_enabled) = open_disk_file(path, direct)?;
        if unlink_on_open {
            unlink_after_open(path);
        }
        debug!(path = %path.display(), device_id, "opened mmap file");
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            device_id,
            allocator_id,
            queue_id,
            stats: Stats::global().file_stats(device_id),
        })
    }
}

impl DiskFile for MmapFile {
    fn serve(&self, buf: &mut [u8], offset: u64, kind: RequestKind) -> Result<()> {
        let file = self.file.lock();
        // A window past end-of-file would fault on access, not at map time.
        let size = file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| BlocklineError::io_op("size", &self.path, &e))?;
        if offset + buf.len() as u64 > size {
            return Err(BlocklineError::Io {
                operation: "mmap",
                path: self.path.display().to_string(),
                offset,
                bytes: buf.len(),
                direction: kind.as_str(),
                detail: format!("transfer window exceeds file size {size}"),
            });
        }
        match kind {
            RequestKind::Read => {
                // SAFETY: the mapping is private to this call and dropped
                // before the file lock is released.
                let map = unsafe { MmapOptions::new().offset(offset).len(buf.len()).map(&*file) }
                    .map_err(|e| {
                        BlocklineError::io("mmap", &self.path, offset, buf.len(), kind.as_str(), &e)
                    })?;
                buf.copy_from_slice(&map[..]);
            }
            RequestKind::Write => {
                // SAFETY: as above; the shared mapping writes through to the
                // file when dropped.
                let mut map =
                    unsafe { MmapOptions::new().offset(offset).len(buf.len()).map_mut(&*file) }
                        .map_err(|e| {
                            BlocklineError::io(
                                "mmap",
                                &self.path,
                                offset,
                                buf.len(),
                                kind.as_str(),
                                &e,
                            )
                        })?;
                map[..].copy_from_slice(buf);
            }
        }
        Ok(())
    }

    fn set_size(&self, bytes: u64) -> Result<()> {
        self.file
            .lock()
            .set_len(bytes)
            .map_err(|e| BlocklineError::io_op("set_size", &self.path, &e))
    }

    fn size(&self) -> Result<u64> {
        self.file
            .lock()
            .metadata()
            .map(|m| m.len())
            .map_err(|e| BlocklineError::io_op("size", &self.path, &e))
    }

    #[cfg(unix)]
    fn lock(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let file = self.file.lock();
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            return Err(BlocklineError::io_op("lock", &self.path, &e));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock(&self) -> Result<()> {
        Ok(())
    }

    fn close_remove(&self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove file");
        }
    }

    fn queue_id(&self) -> i64 {
        self.queue_id
    }

    fn allocator_id(&self) -> Option<usize> {
        self.allocator_id
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn file_stats(&self) -> &Arc<FileStats> {
        &self.stats
    }

    fn io_type(&self) -> &'static str {
        "mmap"
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
