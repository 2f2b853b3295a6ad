//! Asynchronous I/O requests
//!
//! A [`Request`] describes one pending transfer: the target file, the owned
//! buffer, the offset, and the direction. Its state advances monotonically
//! `Op → Done → Ready2Die`: `Done` is set before the completion handler
//! runs, waiters wake only after the handler returned and the file handle
//! was released, and only then may the request be dropped by its last
//! holder.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::{AlignedBuf, BLOCK_ALIGNMENT};
use crate::error::{BlocklineError, Result};
use crate::io::{DiskFile, DiskQueues, FilePtr, RequestKind};
use crate::stats::{Stats, WaitKind};
use crate::sync::SharedState;

/// Completion callback, invoked exactly once with `success = false` for
/// cancelled and failed requests. A failed request also carries the error
/// in its error slot; the handler can tell the two apart through
/// [`Request::check_errors`].
pub type CompletionHandler = Box<dyn FnOnce(&Request, bool) + Send>;

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    /// Queued or being served.
    Op,
    /// Transfer finished or cancelled; handler has been invoked.
    Done,
    /// File reference released, waiters woken; safe to drop.
    Ready2Die,
}

/// Shared handle to a request. Held by the submitter, the serving queue,
/// and (transiently) the completion path.
pub type RequestPtr = Arc<Request>;

/// One pending transfer.
pub struct Request {
    file: Mutex<Option<FilePtr>>,
    buffer: Mutex<Option<AlignedBuf>>,
    offset: u64,
    bytes: usize,
    kind: RequestKind,
    queue_id: i64,
    on_complete: Mutex<Option<CompletionHandler>>,
    error: Mutex<Option<BlocklineError>>,
    state: SharedState<RequestState>,
}

impl Request {
    /// Build a request. The buffer's full length is the transfer size; an
    /// empty buffer is rejected here rather than at the queue.
    pub fn new(
        file: FilePtr,
        buffer: AlignedBuf,
        offset: u64,
        kind: RequestKind,
        on_complete: Option<CompletionHandler>,
    ) -> Result<RequestPtr> {
        let bytes = buffer.len();
        if bytes == 0 {
            return Err(BlocklineError::invalid("empty request"));
        }
        let queue_id = file.queue_id();
        let needs_alignment = file.needs_alignment();
        let req = Arc::new(Self {
            file: Mutex::new(Some(file)),
            buffer: Mutex::new(Some(buffer)),
            offset,
            bytes,
            kind,
            queue_id,
            on_complete: Mutex::new(on_complete),
            error: Mutex::new(None),
            state: SharedState::new(RequestState::Op),
        });
        if needs_alignment {
            req.check_alignment();
        }
        Ok(req)
    }

    /// Offset of the transfer within the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes to transfer.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// One-past-the-end offset of the transfer.
    pub fn end(&self) -> u64 {
        self.offset + self.bytes as u64
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// The target file, until the request reaches `Done`.
    pub fn file(&self) -> Option<FilePtr> {
        self.file.lock().clone()
    }

    pub(crate) fn queue_id(&self) -> i64 {
        self.queue_id
    }

    /// True once the request reached `Done` (served, failed, or cancelled).
    pub fn poll(&self) -> bool {
        self.state.get() >= RequestState::Done
    }

    /// Re-raise an error captured while serving this request.
    pub fn check_errors(&self) -> Result<()> {
        match self.error.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Block the calling thread until the request is fully completed, then
    /// re-raise any captured error. Wait time is reported to the statistics
    /// table.
    pub fn wait(&self) -> Result<()> {
        let wait_kind = match self.kind {
            RequestKind::Read => WaitKind::Read,
            RequestKind::Write => WaitKind::Write,
        };
        let stats = Stats::global();
        stats.wait_started(wait_kind);
        self.state.wait_for_at_least(RequestState::Ready2Die);
        stats.wait_finished(wait_kind);
        self.check_errors()
    }

    /// Attempt to cancel the request.
    ///
    /// Returns true iff the transfer did not and will not occur; the
    /// request is then completed with `success = false`. A false return
    /// does not prove the transfer ran, so callers must still `wait()`.
    pub fn cancel(self: &Arc<Self>) -> bool {
        if self.file.lock().is_none() {
            return false;
        }
        DiskQueues::global().cancel_request(self, self.queue_id)
    }

    /// Take the buffer back after completion. Returns `None` while the
    /// transfer is still in flight or if the buffer was already taken.
    pub fn take_buffer(&self) -> Option<AlignedBuf> {
        if !self.poll() {
            return None;
        }
        self.buffer.lock().take()
    }

    /// Two requests overlap iff they target the same file and their byte
    /// ranges intersect.
    pub fn overlaps(&self, other: &Request) -> bool {
        let a = self.file.lock().clone();
        let b = other.file.lock().clone();
        match (a, b) {
            (Some(fa), Some(fb)) if super::same_file(&fa, &fb) => {
                self.offset < other.end() && other.offset < self.end()
            }
            _ => false,
        }
    }

    /// Log (once, at submission) any violation of the direct-I/O alignment
    /// contract: offset, length, and buffer address must all be multiples
    /// of the block alignment.
    fn check_alignment(&self) {
        let align = BLOCK_ALIGNMENT as u64;
        if self.offset % align != 0 {
            warn!(
                offset = self.offset,
                "direct I/O offset is not aligned to {} bytes", BLOCK_ALIGNMENT
            );
        }
        if self.bytes % BLOCK_ALIGNMENT != 0 {
            warn!(
                bytes = self.bytes,
                "direct I/O length is not a multiple of {} bytes", BLOCK_ALIGNMENT
            );
        }
        let addr = self
            .buffer
            .lock()
            .as_ref()
            .map(|b| b.as_ptr() as usize)
            .unwrap_or(0);
        if addr % BLOCK_ALIGNMENT != 0 {
            warn!(
                address = addr,
                "direct I/O buffer is not aligned to {} bytes", BLOCK_ALIGNMENT
            );
        }
    }

    /// Perform the transfer on the calling (worker) thread. Any failure is
    /// captured in the error slot; completion is signalled separately.
    pub(crate) fn execute_io(&self) {
        let file = self.file.lock().clone();
        let Some(file) = file else {
            debug!("request executed after completion, skipping");
            return;
        };
        let stats = Arc::clone(file.file_stats());
        let mut guard = self.buffer.lock();
        let result = match guard.as_mut() {
            Some(buf) => match self.kind {
                RequestKind::Read => {
                    stats.read_started(self.bytes as u64);
                    let r = file.serve(&mut buf[..], self.offset, self.kind);
                    stats.read_finished();
                    r
                }
                RequestKind::Write => {
                    stats.write_started(self.bytes as u64);
                    let r = file.serve(&mut buf[..], self.offset, self.kind);
                    stats.write_finished();
                    r
                }
            },
            None => Err(BlocklineError::invalid("request buffer missing")),
        };
        drop(guard);

        if let Err(err) = result {
            warn!(
                offset = self.offset,
                bytes = self.bytes,
                op = self.kind.as_str(),
                error = %err,
                "transfer failed"
            );
            *self.error.lock() = Some(err);
        }
    }

    /// Drive the request to its terminal state: mark `Done`, run the
    /// completion handler, release the file reference, then wake waiters
    /// by advancing to `Ready2Die`.
    pub(crate) fn completed(&self, canceled: bool) {
        debug_assert_eq!(self.state.get(), RequestState::Op);
        self.state.set_to(RequestState::Done);

        let success = !canceled && self.error.lock().is_none();
        if let Some(handler) = self.on_complete.lock().take() {
            handler(self, success);
        }

        // the file reference is released exactly once, at completion
        *self.file.lock() = None;
        self.state.set_to(RequestState::Ready2Die);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("offset", &self.offset)
            .field("bytes", &self.bytes)
            .field("kind", &self.kind.as_str())
            .field("state", &self.state.get())
            .finish()
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if self.state.get() == RequestState::Op {
            debug!(
                offset = self.offset,
                bytes = self.bytes,
                "request dropped before completion"
            );
        }
    }
}

/// Wait for every request in the slice; the first captured error (if any)
/// is returned after all requests reached their terminal state.
pub fn wait_all(requests: &[RequestPtr]) -> Result<()> {
    let mut first_err = None;
    for req in requests {
        if let Err(e) = req.wait() {
            first_err.get_or_insert(e);
        }
    }
    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Try to cancel every request in the slice; returns how many were
/// cancelled before their transfer ran.
pub fn cancel_all(requests: &[RequestPtr]) -> usize {
    requests.iter().filter(|r| r.cancel()).count()
}
