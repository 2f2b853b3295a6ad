//! Batch-submission file backend
//!
//! Files on this backend route their requests through the batched
//! submission queue, so non-overlapping transfers proceed in parallel up to
//! the queue depth while overlapping ones keep their submission order. The
//! alignment contract is mandatory here regardless of whether the open
//! actually got direct I/O.
//!
//! `serve` is the raw positioned transfer executed by the submission pool;
//! there is no per-file mutex because positioned reads and writes on a
//! shared descriptor are safe to issue concurrently.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::DirectMode;
use crate::error::{BlocklineError, Result};
use crate::io::{
    open_disk_file, transfer, unlink_after_open, DiskFile, QueueDiscipline, RequestKind,
};
use crate::stats::{FileStats, Stats};

pub struct AioFile {
    file: File,
    /// taken only for size changes, not for transfers
    resize_lock: Mutex<()>,
    path: PathBuf,
    device_id: u32,
    allocator_id: Option<usize>,
    queue_id: i64,
    depth: usize,
    stats: Arc<FileStats>,
}

impl AioFile {
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        path: &Path,
        direct: DirectMode,
        device_id: u32,
        allocator_id: Option<usize>,
        queue_id: i64,
        unlink_on_open: bool,
        depth: usize,
    ) -> Result<Self> {
        let (file, direct_enabled) = open_disk_file(path, direct)?;
        if unlink_on_open {
            unlink_after_open(path);
        }
        debug!(
            path = %path.display(),
            device_id,
            depth,
            direct = direct_enabled,
            "opened aio file"
        );
        Ok(Self {
            file,
            resize_lock: Mutex::new(()),
            path: path.to_path_buf(),
            device_id,
            allocator_id,
            queue_id,
            depth,
            stats: Stats::global().file_stats(device_id),
        })
    }

    /// Depth requested for this file's submission queue.
    pub fn desired_queue_depth(&self) -> usize {
        self.depth
    }
}

impl DiskFile for AioFile {
    fn serve(&self, buf: &mut [u8], offset: u64, kind: RequestKind) -> Result<()> {
        transfer(&self.file, &self.path, buf, offset, kind)
    }

    fn set_size(&self, bytes: u64) -> Result<()> {
        let _guard = self.resize_lock.lock();
        self.file
            .set_len(bytes)
            .map_err(|e| BlocklineError::io_op("set_size", &self.path, &e))
    }

    fn size(&self) -> Result<u64> {
        self.file
            .metadata()
            .map(|m| m.len())
            .map_err(|e| BlocklineError::io_op("size", &self.path, &e))
    }

    #[cfg(unix)]
    fn lock(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
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
        "aio"
    }

    fn needs_alignment(&self) -> bool {
        true
    }

    fn queue_discipline(&self) -> QueueDiscipline {
        QueueDiscipline::Batch { depth: self.depth }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}
