//! Syscall file backend
//!
//! The default backend: one file descriptor guarded by a mutex, served with
//! positioned read/write syscalls. Short transfers are retried and a read
//! that runs past end-of-file is padded with zeroes.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DirectMode;
use crate::error::{BlocklineError, Result};
use crate::io::{open_disk_file, transfer, unlink_after_open, DiskFile, RequestKind};
use crate::stats::{FileStats, Stats};

pub struct SyscallFile {
    file: Mutex<File>,
    path: PathBuf,
    device_id: u32,
    allocator_id: Option<usize>,
    queue_id: i64,
    stats: Arc<FileStats>,
    direct: bool,
}

impl SyscallFile {
    pub fn open(
        path: &Path,
        direct: DirectMode,
        device_id: u32,
        allocator_id: Option<usize>,
        queue_id: i64,
        unlink_on_open: bool,
    ) -> Result<Self> {
        let (file, direct_enabled) = open_disk_file(path, direct)?;
        if unlink_on_open {
            unlink_after_open(path);
        }
        debug!(
            path = %path.display(),
            device_id,
            direct = direct_enabled,
            "opened syscall file"
        );
        Ok(Self {
            file: Mutex::new(file),
            path: path.to_path_buf(),
            device_id,
            allocator_id,
            queue_id,
            stats: Stats::global().file_stats(device_id),
            direct: direct_enabled,
        })
    }
}

impl DiskFile for SyscallFile {
    fn serve(&self, buf: &mut [u8], offset: u64, kind: RequestKind) -> Result<()> {
        let file = self.file.lock();
        transfer(&file, &self.path, buf, offset, kind)
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

    #[cfg(target_os = "linux")]
    fn discard(&self, offset: u64, len: u64) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let file = self.file.lock();
        let rc = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if rc != 0 {
            let e = std::io::Error::last_os_error();
            debug!(path = %self.path.display(), offset, len, error = %e, "discard not supported");
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn discard(&self, _offset: u64, _len: u64) -> Result<()> {
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
        "syscall"
    }

    fn needs_alignment(&self) -> bool {
        self.direct
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
