//! File backends and the asynchronous request layer
//!
//! This module provides a uniform abstraction over the ways a disk can be
//! driven (positioned syscalls, per-transfer memory mapping, batched
//! asynchronous submission, one-file-per-block), together with the request
//! objects and per-disk queues that carry transfers from application
//! threads to the backend workers.
//!
//! # Design
//!
//! A [`DiskFile`] is an opened disk. Requests own their buffer for the
//! duration of the transfer: the buffer is moved in on submission and taken
//! back once the request completes, so the serving side has exclusive
//! access while the I/O is in flight.
//!
//! Each file names the queue that serves it. Files on distinct devices get
//! distinct serving queues; files on the batch backend share one submission
//! queue by default. The [`queues::DiskQueues`] registry owns the queues
//! and dispatches each request to the right one.

pub mod aio;
pub mod batch_queue;
pub mod fileperblock;
pub mod mmap;
pub mod queue;
pub mod queues;
pub mod request;
pub mod syscall;

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use crate::buffer::AlignedBuf;
use crate::config::{BackendKind, DiskConfig};
use crate::error::{BlocklineError, Result};
use crate::stats::FileStats;

pub use aio::AioFile;
pub use fileperblock::FilePerBlockFile;
pub use mmap::MmapFile;
pub use queue::ServingQueue;
pub use queues::{DiskQueues, PriorityOp, RequestQueue};
pub use request::{cancel_all, wait_all, CompletionHandler, Request, RequestPtr, RequestState};
pub use syscall::SyscallFile;

use crate::config::DirectMode;

/// Queue id of the batch-submission queue shared by aio files that do not
/// select their own queue.
pub const DEFAULT_AIO_QUEUE: i64 = -2;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Read => "READ",
            RequestKind::Write => "WRITE",
        }
    }
}

/// How requests for a file are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDiscipline {
    /// One worker thread serving reads and writes from two lists.
    Serving,
    /// Batched submission with at most `depth` transfers in flight.
    Batch { depth: usize },
}

/// An opened disk: the target of block reads and writes.
///
/// `serve` performs one synchronous transfer; the request layer calls it
/// from queue workers. Implementations must be safe to share across the
/// application threads, the queue workers, and the submission pool.
pub trait DiskFile: Send + Sync {
    /// Perform one synchronous transfer of `buf.len()` bytes at `offset`.
    fn serve(&self, buf: &mut [u8], offset: u64, kind: RequestKind) -> Result<()>;

    /// Change the size of the file.
    fn set_size(&self, bytes: u64) -> Result<()>;

    /// Current size of the file in bytes.
    fn size(&self) -> Result<u64>;

    /// Acquire a filesystem lock on the file.
    fn lock(&self) -> Result<()>;

    /// Mark a region unused. Backend-specific; the default does nothing.
    fn discard(&self, _offset: u64, _len: u64) -> Result<()> {
        Ok(())
    }

    /// Close and unlink the backing file(s).
    fn close_remove(&self) {}

    /// Queue this file's requests are dispatched to.
    fn queue_id(&self) -> i64;

    /// Index of the disk allocator owning this file, if block-managed.
    fn allocator_id(&self) -> Option<usize>;

    /// Physical device id for statistics attribution.
    fn device_id(&self) -> u32;

    /// Per-device statistics this file reports into.
    fn file_stats(&self) -> &Arc<FileStats>;

    /// Name of the backend, for logs and errors.
    fn io_type(&self) -> &'static str;

    /// Whether transfers must satisfy the direct-I/O alignment contract.
    fn needs_alignment(&self) -> bool {
        false
    }

    /// Scheduling discipline for this file's queue.
    fn queue_discipline(&self) -> QueueDiscipline {
        QueueDiscipline::Serving
    }

    /// Path of the backing file, for logs and errors.
    fn path(&self) -> &Path;
}

/// Shared handle to an opened disk. Requests hold one of these for their
/// whole lifetime, so a file cannot be destroyed under in-flight I/O.
pub type FilePtr = Arc<dyn DiskFile>;

/// Identity comparison for disk files behind trait objects.
pub(crate) fn same_file(a: &FilePtr, b: &FilePtr) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Asynchronous submission interface of a [`FilePtr`].
pub trait FileExt {
    /// Schedule an asynchronous read into `buf` at `offset`. The buffer is
    /// owned by the request until completion.
    fn aread(
        &self,
        buf: AlignedBuf,
        offset: u64,
        on_complete: Option<CompletionHandler>,
    ) -> Result<RequestPtr>;

    /// Schedule an asynchronous write of `buf` at `offset`.
    fn awrite(
        &self,
        buf: AlignedBuf,
        offset: u64,
        on_complete: Option<CompletionHandler>,
    ) -> Result<RequestPtr>;

    /// Read synchronously: submit, wait, hand the buffer back.
    fn read_block(&self, buf: AlignedBuf, offset: u64) -> Result<AlignedBuf>;

    /// Write synchronously: submit, wait, hand the buffer back.
    fn write_block(&self, buf: AlignedBuf, offset: u64) -> Result<AlignedBuf>;
}

impl FileExt for FilePtr {
    fn aread(
        &self,
        buf: AlignedBuf,
        offset: u64,
        on_complete: Option<CompletionHandler>,
    ) -> Result<RequestPtr> {
        let req = Request::new(Arc::clone(self), buf, offset, RequestKind::Read, on_complete)?;
        DiskQueues::global().add_request(&req)?;
        Ok(req)
    }

    fn awrite(
        &self,
        buf: AlignedBuf,
        offset: u64,
        on_complete: Option<CompletionHandler>,
    ) -> Result<RequestPtr> {
        let req = Request::new(Arc::clone(self), buf, offset, RequestKind::Write, on_complete)?;
        DiskQueues::global().add_request(&req)?;
        Ok(req)
    }

    fn read_block(&self, buf: AlignedBuf, offset: u64) -> Result<AlignedBuf> {
        let req = self.aread(buf, offset, None)?;
        req.wait()?;
        req.take_buffer()
            .ok_or_else(|| BlocklineError::invalid("request buffer already taken"))
    }

    fn write_block(&self, buf: AlignedBuf, offset: u64) -> Result<AlignedBuf> {
        let req = self.awrite(buf, offset, None)?;
        req.wait()?;
        req.take_buffer()
            .ok_or_else(|| BlocklineError::invalid("request buffer already taken"))
    }
}

/// Open a disk file honoring the direct-I/O tristate.
///
/// Returns the file and whether direct I/O is actually active.
pub(crate) fn open_disk_file(path: &Path, direct: DirectMode) -> Result<(File, bool)> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);

    if direct == DirectMode::Off {
        let file = options
            .open(path)
            .map_err(|e| BlocklineError::io_op("open", path, &e))?;
        return Ok((file, false));
    }

    match open_with_direct_flag(path, &options) {
        Ok(file) => Ok((file, true)),
        Err(e) if direct == DirectMode::Try => {
            warn!(
                path = %path.display(),
                error = %e,
                "direct I/O not supported here, falling back to buffered I/O"
            );
            let file = options
                .open(path)
                .map_err(|e| BlocklineError::io_op("open", path, &e))?;
            Ok((file, false))
        }
        Err(e) => Err(BlocklineError::io_op("open direct", path, &e)),
    }
}

#[cfg(target_os = "linux")]
fn open_with_direct_flag(path: &Path, options: &OpenOptions) -> std::io::Result<File> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut direct_options = options.clone();
    direct_options.custom_flags(libc::O_DIRECT);
    direct_options.open(path)
}

#[cfg(target_os = "macos")]
fn open_with_direct_flag(path: &Path, options: &OpenOptions) -> std::io::Result<File> {
    use std::os::unix::io::AsRawFd;

    let file = options.open(path)?;
    // F_NOCACHE is the closest macOS equivalent of O_DIRECT.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(file)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn open_with_direct_flag(_path: &Path, _options: &OpenOptions) -> std::io::Result<File> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "direct I/O is not supported on this platform",
    ))
}

/// Unlink a path right after opening it, where the platform allows.
pub(crate) fn unlink_after_open(path: &Path) {
    if cfg!(unix) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "unlink-on-open failed");
        }
    } else {
        warn!(path = %path.display(), "unlink-on-open is not supported on this platform");
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt as _;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt as _;
    file.write_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt as _;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt as _;
    file.seek_write(buf, offset)
}

/// Positioned transfer loop shared by the syscall-style backends.
///
/// Handles short transfers by retrying the tail. A read that extends past
/// end-of-file yields zeroes for the missing tail, matching what the block
/// layer expects from freshly grown disks.
pub(crate) fn transfer(
    file: &File,
    path: &Path,
    buf: &mut [u8],
    offset: u64,
    kind: RequestKind,
) -> Result<()> {
    let total = buf.len();
    let mut done = 0usize;

    while done < total {
        let pos = offset + done as u64;
        let rc = match kind {
            RequestKind::Read => read_at(file, &mut buf[done..], pos),
            RequestKind::Write => write_at(file, &buf[done..], pos),
        };
        match rc {
            Ok(0) if kind == RequestKind::Read => {
                // read past end-of-file: zero the remainder
                buf[done..].fill(0);
                return Ok(());
            }
            Ok(0) => {
                return Err(BlocklineError::Io {
                    operation: "serve",
                    path: path.display().to_string(),
                    offset,
                    bytes: total,
                    direction: kind.as_str(),
                    detail: "zero-length write".to_string(),
                });
            }
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return Err(BlocklineError::io("serve", path, offset, total, kind.as_str(), &e))
            }
        }
    }
    Ok(())
}

/// Open the file described by `cfg` with the requested backend.
///
/// `device_id` attributes statistics; `allocator_id` links the file back to
/// the disk allocator that owns it (None for unmanaged files). The queue id
/// is resolved here: an explicit id wins, aio files default to the shared
/// batch queue, and everything else gets a per-device queue.
pub fn create_file(
    cfg: &DiskConfig,
    device_id: u32,
    allocator_id: Option<usize>,
) -> Result<FilePtr> {
    let queue_id = cfg.queue_id.unwrap_or(match cfg.backend {
        BackendKind::Aio => DEFAULT_AIO_QUEUE,
        _ => device_id as i64,
    });

    let file: FilePtr = match cfg.backend {
        BackendKind::Syscall => Arc::new(SyscallFile::open(
            &cfg.path,
            cfg.direct,
            device_id,
            allocator_id,
            queue_id,
            cfg.unlink_on_open,
        )?),
        BackendKind::Mmap => Arc::new(MmapFile::open(
            &cfg.path,
            cfg.direct,
            device_id,
            allocator_id,
            queue_id,
            cfg.unlink_on_open,
        )?),
        BackendKind::Aio => Arc::new(AioFile::open(
            &cfg.path,
            cfg.direct,
            device_id,
            allocator_id,
            queue_id,
            cfg.unlink_on_open,
            cfg.effective_queue_depth(),
        )?),
        BackendKind::FilePerBlock => Arc::new(FilePerBlockFile::new(
            &cfg.path,
            cfg.direct,
            device_id,
            allocator_id,
            queue_id,
        )),
    };
    Ok(file)
}
