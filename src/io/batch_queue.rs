//! Batched-submission queue
//!
//! Requests pass through three lists: `waiting` (accepted from the
//! application), `delayed` (blocked by an in-flight overlap), and `posted`
//! (handed to the submission context). A submitter thread batches
//! non-conflicting requests and posts them; a completer thread reaps
//! completions, finalizes the requests, and wakes the submitter.
//!
//! Two requests *conflict* iff they overlap on the same file and at least
//! one of them is a write. Once a write is in flight to a region, no
//! overlapping request is posted until it completes; the submission
//! context is otherwise free to reorder, so this is what preserves
//! per-address write ordering. Non-overlapping requests proceed in
//! parallel up to the queue depth.
//!
//! The submission context itself exposes exactly the semantics the queue
//! needs from a kernel AIO interface: submit a batch of at most `depth`
//! requests, block for at least one completion, cancel one submitted
//! request. It is implemented here by a bounded serving pool, which keeps
//! the ordering logic portable and deterministic under test.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::error::{BlocklineError, Result};
use crate::io::queues::{PriorityOp, RequestQueue};
use crate::io::request::RequestPtr;
use crate::io::RequestKind;
use crate::sync::{SharedState, ThreadState};

/// Serving threads backing one submission context.
const POOL_THREADS: usize = 8;

struct CtxInner {
    /// submitted, not yet picked up by a serving thread
    pending: VecDeque<RequestPtr>,
    /// served, not yet reaped by `wait_events`
    done: Vec<RequestPtr>,
    /// accepted and not yet reaped
    in_flight: usize,
    /// pending empty-return requests from `wake`
    wakeups: usize,
}

/// Bounded submission context: the "kernel side" of the batch queue.
struct SubmitContext {
    inner: Mutex<CtxInner>,
    pending_cv: Condvar,
    events_cv: Condvar,
    capacity: usize,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SubmitContext {
    fn new(capacity: usize) -> Result<Arc<Self>> {
        let ctx = Arc::new(Self {
            inner: Mutex::new(CtxInner {
                pending: VecDeque::new(),
                done: Vec::new(),
                in_flight: 0,
                wakeups: 0,
            }),
            pending_cv: Condvar::new(),
            events_cv: Condvar::new(),
            capacity,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });
        let threads = capacity.min(POOL_THREADS).max(1);
        let mut workers = ctx.workers.lock();
        for i in 0..threads {
            let ctx2 = Arc::clone(&ctx);
            let handle = std::thread::Builder::new()
                .name(format!("blockline-aio-{i}"))
                .spawn(move || ctx2.serve_loop())
                .map_err(|e| {
                    BlocklineError::invalid(format!("failed to spawn submission pool: {e}"))
                })?;
            workers.push(handle);
        }
        drop(workers);
        Ok(ctx)
    }

    /// Accept a prefix of `batch` up to the remaining capacity; returns how
    /// many were accepted.
    fn submit(&self, batch: &[RequestPtr]) -> usize {
        let mut inner = self.inner.lock();
        let room = self.capacity.saturating_sub(inner.in_flight);
        let accepted = room.min(batch.len());
        if accepted == 0 {
            return 0;
        }
        inner.in_flight += accepted;
        for req in &batch[..accepted] {
            inner.pending.push_back(Arc::clone(req));
        }
        drop(inner);
        if accepted == 1 {
            self.pending_cv.notify_one();
        } else {
            self.pending_cv.notify_all();
        }
        accepted
    }

    /// Block until at least one completion is available, then reap all of
    /// them. Returns empty when woken via [`wake`] with nothing completed.
    fn wait_events(&self) -> Vec<RequestPtr> {
        let mut inner = self.inner.lock();
        while inner.done.is_empty() && inner.wakeups == 0 && !self.shutdown.load(Ordering::Acquire)
        {
            self.events_cv.wait(&mut inner);
        }
        if inner.wakeups > 0 {
            inner.wakeups -= 1;
        }
        let events: Vec<_> = inner.done.drain(..).collect();
        inner.in_flight -= events.len();
        events
    }

    /// Force one `wait_events` call to return (possibly empty).
    fn wake(&self) {
        self.inner.lock().wakeups += 1;
        self.events_cv.notify_all();
    }

    /// Withdraw one submitted request before a serving thread picks it up.
    fn cancel(&self, req: &RequestPtr) -> bool {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.pending.iter().position(|r| Arc::ptr_eq(r, req)) {
            inner.pending.remove(pos);
            inner.in_flight -= 1;
            return true;
        }
        false
    }

    fn serve_loop(&self) {
        loop {
            let req = {
                let mut inner = self.inner.lock();
                loop {
                    if let Some(req) = inner.pending.pop_front() {
                        break req;
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    self.pending_cv.wait(&mut inner);
                }
            };
            req.execute_io();
            self.inner.lock().done.push(req);
            self.events_cv.notify_all();
        }
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.pending_cv.notify_all();
        self.events_cv.notify_all();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
    }
}

struct Lists {
    waiting: VecDeque<RequestPtr>,
    delayed: VecDeque<RequestPtr>,
    posted: Vec<RequestPtr>,
}

/// Per-queue state shared by the submitter, the completer, and callers.
struct Shared {
    lists: Mutex<Lists>,
    submit_cv: Condvar,
    depth: usize,
    ctx: Arc<SubmitContext>,
    submit_state: SharedState<ThreadState>,
    complete_state: SharedState<ThreadState>,
}

/// Queue for files on the batch-submission backend.
pub struct BatchQueue {
    shared: Arc<Shared>,
    submitter: Mutex<Option<JoinHandle<()>>>,
    completer: Mutex<Option<JoinHandle<()>>>,
}

/// True iff posting `req` while `other` is outstanding could be reordered
/// into a visible difference: the two overlap and at least one writes.
fn conflicts(req: &RequestPtr, other: &RequestPtr) -> bool {
    (req.kind() == RequestKind::Write || other.kind() == RequestKind::Write)
        && req.overlaps(other)
}

fn conflicts_with_any<'a>(
    req: &RequestPtr,
    lists: impl IntoIterator<Item = &'a RequestPtr>,
) -> bool {
    lists.into_iter().any(|other| conflicts(req, other))
}

impl BatchQueue {
    pub fn new(depth: usize) -> Result<Arc<Self>> {
        let depth = depth.max(1);
        let shared = Arc::new(Shared {
            lists: Mutex::new(Lists {
                waiting: VecDeque::new(),
                delayed: VecDeque::new(),
                posted: Vec::new(),
            }),
            submit_cv: Condvar::new(),
            depth,
            ctx: SubmitContext::new(depth)?,
            submit_state: SharedState::new(ThreadState::NotRunning),
            complete_state: SharedState::new(ThreadState::NotRunning),
        });

        let submit_shared = Arc::clone(&shared);
        let submitter = std::thread::Builder::new()
            .name("blockline-submit".to_string())
            .spawn(move || submit_loop(&submit_shared))
            .map_err(|e| BlocklineError::invalid(format!("failed to spawn submitter: {e}")))?;
        shared.submit_state.set_to(ThreadState::Running);

        let complete_shared = Arc::clone(&shared);
        let completer = std::thread::Builder::new()
            .name("blockline-complete".to_string())
            .spawn(move || complete_loop(&complete_shared))
            .map_err(|e| BlocklineError::invalid(format!("failed to spawn completer: {e}")))?;
        shared.complete_state.set_to(ThreadState::Running);

        info!(depth, "batch queue started");
        Ok(Arc::new(Self {
            shared,
            submitter: Mutex::new(Some(submitter)),
            completer: Mutex::new(Some(completer)),
        }))
    }

    /// Queue depth negotiated at construction.
    pub fn depth(&self) -> usize {
        self.shared.depth
    }
}

impl RequestQueue for BatchQueue {
    fn add_request(&self, req: RequestPtr) -> Result<()> {
        if self.shared.submit_state.get() != ThreadState::Running {
            return Err(BlocklineError::invalid(
                "request submitted to a terminating queue",
            ));
        }
        self.shared.lists.lock().waiting.push_back(req);
        self.shared.submit_cv.notify_all();
        Ok(())
    }

    /// Cancellation order mirrors how far a request may have travelled:
    /// waiting first, then delayed, then posted (where the submission
    /// context may still withdraw it).
    fn cancel_request(&self, req: &RequestPtr) -> bool {
        let mut lists = self.shared.lists.lock();

        if let Some(pos) = lists.waiting.iter().position(|r| Arc::ptr_eq(r, req)) {
            lists.waiting.remove(pos);
            drop(lists);
            req.completed(true);
            self.shared.submit_cv.notify_all();
            return true;
        }

        if let Some(pos) = lists.delayed.iter().position(|r| Arc::ptr_eq(r, req)) {
            lists.delayed.remove(pos);
            drop(lists);
            req.completed(true);
            self.shared.submit_cv.notify_all();
            return true;
        }

        if let Some(pos) = lists.posted.iter().position(|r| Arc::ptr_eq(r, req)) {
            if self.shared.ctx.cancel(req) {
                lists.posted.remove(pos);
                drop(lists);
                req.completed(true);
                self.shared.submit_cv.notify_all();
                return true;
            }
        }

        false
    }

    fn set_priority_op(&self, _op: PriorityOp) {
        // batching already reorders freely within the conflict rules
    }

    fn terminate(&self) {
        if self.shared.submit_state.get() != ThreadState::Running {
            return;
        }
        self.shared.submit_state.set_to(ThreadState::Terminating);
        self.shared.submit_cv.notify_all();
        if let Some(handle) = self.submitter.lock().take() {
            let _ = handle.join();
        }

        self.shared.complete_state.set_to(ThreadState::Terminating);
        self.shared.ctx.wake();
        if let Some(handle) = self.completer.lock().take() {
            let _ = handle.join();
        }

        self.shared.ctx.shutdown();
        debug!("batch queue terminated");
    }
}

/// Remove reaped requests from `posted` and finalize them.
fn finish_events(shared: &Shared, events: Vec<RequestPtr>, canceled: bool) {
    if events.is_empty() {
        return;
    }
    {
        let mut lists = shared.lists.lock();
        for req in &events {
            if let Some(pos) = lists.posted.iter().position(|r| Arc::ptr_eq(r, req)) {
                lists.posted.remove(pos);
            }
        }
    }
    for req in events {
        req.completed(canceled);
    }
    shared.submit_cv.notify_all();
}

fn submit_loop(shared: &Shared) {
    loop {
        let mut lists = shared.lists.lock();

        // wait until there is something to post and room to post it
        loop {
            if shared.submit_state.get() == ThreadState::Terminating
                && lists.waiting.is_empty()
                && lists.delayed.is_empty()
            {
                drop(lists);
                shared.submit_state.set_to(ThreadState::Terminated);
                return;
            }
            let backlog = !lists.waiting.is_empty() || !lists.delayed.is_empty();
            if backlog && lists.posted.len() < shared.depth {
                break;
            }
            shared.submit_cv.wait(&mut lists);
        }

        lists.posted.retain(|r| !r.poll());

        // build the local batch: delayed entries whose conflicts cleared
        // move first (FIFO), then fresh waiting entries
        let mut batch: Vec<RequestPtr> = Vec::new();
        let mut still_delayed: VecDeque<RequestPtr> = VecDeque::new();
        while let Some(req) = lists.delayed.pop_front() {
            let blocked = conflicts_with_any(&req, &lists.posted)
                || conflicts_with_any(&req, &still_delayed)
                || conflicts_with_any(&req, &batch);
            if blocked || lists.posted.len() + batch.len() >= shared.depth {
                still_delayed.push_back(req);
            } else {
                batch.push(req);
            }
        }
        lists.delayed = still_delayed;

        while lists.posted.len() + batch.len() < shared.depth {
            let Some(req) = lists.waiting.pop_front() else {
                break;
            };
            let blocked = conflicts_with_any(&req, &lists.posted)
                || conflicts_with_any(&req, &lists.delayed)
                || conflicts_with_any(&req, &batch);
            if blocked {
                lists.delayed.push_back(req);
            } else {
                batch.push(req);
            }
        }

        if batch.is_empty() {
            // everything is blocked behind in-flight overlaps; a completion
            // will wake us
            shared.submit_cv.wait(&mut lists);
            continue;
        }

        // hand the batch over; on a full context, drain at least one
        // completion and retry the tail
        let mut posted = 0;
        while posted < batch.len() {
            let accepted = shared.ctx.submit(&batch[posted..]);
            if accepted == 0 {
                drop(lists);
                let events = shared.ctx.wait_events();
                finish_events(shared, events, false);
                lists = shared.lists.lock();
                continue;
            }
            lists
                .posted
                .extend(batch[posted..posted + accepted].iter().cloned());
            posted += accepted;
        }
        debug!(batch = posted, in_flight = lists.posted.len(), "batch posted");
    }
}

fn complete_loop(shared: &Shared) {
    loop {
        if shared.complete_state.get() == ThreadState::Terminating
            && shared.lists.lock().posted.is_empty()
        {
            break;
        }
        let events = shared.ctx.wait_events();
        finish_events(shared, events, false);
    }
    shared.complete_state.set_to(ThreadState::Terminated);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuf;
    use crate::config::DirectMode;
    use crate::io::request::Request;
    use crate::io::syscall::SyscallFile;
    use crate::io::{DiskFile, FilePtr, RequestKind};
    use tempfile::tempdir;

    fn request(file: &FilePtr, offset: u64, len: usize, kind: RequestKind) -> RequestPtr {
        let buf = AlignedBuf::new(len).unwrap();
        Request::new(Arc::clone(file), buf, offset, kind, None).unwrap()
    }

    fn test_file(dir: &tempfile::TempDir, device: u32) -> FilePtr {
        let path = dir.path().join(format!("disk{device}"));
        let file =
            SyscallFile::open(&path, DirectMode::Off, device, None, device as i64, false).unwrap();
        file.set_size(1 << 22).unwrap();
        Arc::new(file)
    }

    #[test]
    fn conflict_requires_overlap_and_a_write() {
        let dir = tempdir().unwrap();
        let file = test_file(&dir, 7300);

        let w0 = request(&file, 0, 8192, RequestKind::Write);
        let w1 = request(&file, 4096, 8192, RequestKind::Write);
        let r0 = request(&file, 0, 8192, RequestKind::Read);
        let r1 = request(&file, 4096, 8192, RequestKind::Read);
        let far = request(&file, 1 << 20, 4096, RequestKind::Write);

        assert!(conflicts(&w0, &w1));
        assert!(conflicts(&w0, &r1));
        assert!(!conflicts(&r0, &r1));
        assert!(!conflicts(&w0, &far));
    }

    #[test]
    fn no_conflict_across_files() {
        let dir = tempdir().unwrap();
        let a = test_file(&dir, 7301);
        let b = test_file(&dir, 7302);
        let w0 = request(&a, 0, 4096, RequestKind::Write);
        let w1 = request(&b, 0, 4096, RequestKind::Write);
        assert!(!conflicts(&w0, &w1));
    }

    #[test]
    fn overlapping_writes_complete_in_submission_order() {
        let dir = tempdir().unwrap();
        let file = test_file(&dir, 7303);
        let queue = BatchQueue::new(4).unwrap();

        // first a wide write of 0x11, then a narrower overlapping 0x22
        let mut wide = AlignedBuf::new(2 << 20).unwrap();
        wide.fill(0x11);
        let r1 = Request::new(Arc::clone(&file), wide, 0, RequestKind::Write, None).unwrap();

        let mut narrow = AlignedBuf::new(1 << 20).unwrap();
        narrow.fill(0x22);
        let r2 =
            Request::new(Arc::clone(&file), narrow, 1 << 20, RequestKind::Write, None).unwrap();

        queue.add_request(Arc::clone(&r1)).unwrap();
        queue.add_request(Arc::clone(&r2)).unwrap();
        r1.wait().unwrap();
        r2.wait().unwrap();

        let mut check = vec![0u8; 2 << 20];
        file.serve(&mut check, 0, RequestKind::Read).unwrap();
        assert!(check[..1 << 20].iter().all(|&b| b == 0x11));
        assert!(check[1 << 20..].iter().all(|&b| b == 0x22));

        queue.terminate();
    }

    #[test]
    fn terminate_drains_pending_requests() {
        let dir = tempdir().unwrap();
        let file = test_file(&dir, 7304);
        let queue = BatchQueue::new(2).unwrap();

        let reqs: Vec<_> = (0..8)
            .map(|i| request(&file, i * 4096, 4096, RequestKind::Write))
            .collect();
        for req in &reqs {
            queue.add_request(Arc::clone(req)).unwrap();
        }
        queue.terminate();
        for req in &reqs {
            assert!(req.poll());
        }
    }

    #[test]
    fn add_after_terminate_is_rejected() {
        let dir = tempdir().unwrap();
        let file = test_file(&dir, 7305);
        let queue = BatchQueue::new(2).unwrap();
        queue.terminate();
        let req = request(&file, 0, 4096, RequestKind::Write);
        assert!(queue.add_request(req).is_err());
    }
}
