//! File-per-block backend
//!
//! Keeps every block in its own file, named by the block's offset under a
//! common prefix. Useful when blocks come and go and the filesystem should
//! reclaim space immediately: `discard` simply deletes the block's file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{AlignedBuf, BLOCK_ALIGNMENT};
use crate::config::DirectMode;
use crate::error::{BlocklineError, Result};
use crate::io::{open_disk_file, transfer, DiskFile, RequestKind};
use crate::stats::{FileStats, Stats};

pub struct FilePerBlockFile {
    prefix: PathBuf,
    direct: DirectMode,
    device_id: u32,
    allocator_id: Option<usize>,
    queue_id: i64,
    stats: Arc<FileStats>,
    /// logical size, grown by set_size
    current_size: Mutex<u64>,
    lock_file: Mutex<Option<std::fs::File>>,
}

impl FilePerBlockFile {
    pub fn new(
        prefix: &Path,
        direct: DirectMode,
        device_id: u32,
        allocator_id: Option<usize>,
        queue_id: i64,
    ) -> Self {
        debug!(prefix = %prefix.display(), device_id, "file-per-block backend ready");
        Self {
            prefix: prefix.to_path_buf(),
            direct,
            device_id,
            allocator_id,
            queue_id,
            stats: Stats::global().file_stats(device_id),
            current_size: Mutex::new(0),
            lock_file: Mutex::new(None),
        }
    }

    /// Path of the file holding the block at `offset`. Padded so a
    /// directory listing sorts blocks by position.
    fn filename_for_block(&self, offset: u64) -> PathBuf {
        let mut name = self.prefix.as_os_str().to_os_string();
        name.push(format!("_fpb_{offset:020}"));
        PathBuf::from(name)
    }

    fn lock_file_path(&self) -> PathBuf {
        let mut name = self.prefix.as_os_str().to_os_string();
        name.push("_fpb_lock");
        PathBuf::from(name)
    }
}

impl DiskFile for FilePerBlockFile {
    fn serve(&self, buf: &mut [u8], offset: u64, kind: RequestKind) -> Result<()> {
        let path = self.filename_for_block(offset);
        let (file, _direct) = open_disk_file(&path, self.direct)?;
        if kind == RequestKind::Write {
            file.set_len(buf.len() as u64)
                .map_err(|e| BlocklineError::io_op("set_size", &path, &e))?;
        }
        transfer(&file, &path, buf, 0, kind)
    }

    fn set_size(&self, bytes: u64) -> Result<()> {
        let mut size = self.current_size.lock();
        *size = (*size).max(bytes);
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(*self.current_size.lock())
    }

    fn lock(&self) -> Result<()> {
        let mut guard = self.lock_file.lock();
        if guard.is_none() {
            let path = self.lock_file_path();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .map_err(|e| BlocklineError::io_op("open", &path, &e))?;
            // an empty file cannot be locked everywhere, give it one page
            let mut page = AlignedBuf::new(BLOCK_ALIGNMENT)?;
            file.set_len(BLOCK_ALIGNMENT as u64)
                .map_err(|e| BlocklineError::io_op("set_size", &path, &e))?;
            transfer(&file, &path, &mut page[..], 0, RequestKind::Write)?;
            *guard = Some(file);
        }
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let file = guard.as_ref().expect("lock file just created");
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
            if rc != 0 {
                let e = std::io::Error::last_os_error();
                return Err(BlocklineError::io_op("lock", &self.lock_file_path(), &e));
            }
        }
        Ok(())
    }

    /// A freed block's file is deleted outright.
    fn discard(&self, offset: u64, len: u64) -> Result<()> {
        let path = self.filename_for_block(offset);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove block file");
        }
        debug!(offset, len, "discarded block file");
        Ok(())
    }

    fn close_remove(&self) {
        if self.lock_file.lock().take().is_some() {
            let path = self.lock_file_path();
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove lock file");
            }
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
        "fileperblock"
    }

    fn path(&self) -> &Path {
        &self.prefix
    }
}
