//! Two-queue serving worker
//!
//! One worker thread per disk, draining a read list and a write list. The
//! priority mode picks which list is preferred: `Write` drains writes until
//! empty, `Read` is symmetric, `None` alternates. A semaphore counts the
//! total enqueued requests, so the worker sleeps when both lists are empty
//! and shutdown can drain exactly the remaining count.
//!
//! Ordering across the two lists is not enforced: submitting a request that
//! overlaps a pending request in the opposite direction is legal but almost
//! certainly a bug in the caller, so it is logged.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{BlocklineError, Result};
use crate::io::queues::{PriorityOp, RequestQueue};
use crate::io::request::RequestPtr;
use crate::io::RequestKind;
use crate::sync::{Semaphore, SharedState, ThreadState};

pub struct ServingQueue {
    read_queue: Mutex<VecDeque<RequestPtr>>,
    write_queue: Mutex<VecDeque<RequestPtr>>,
    sem: Semaphore,
    priority: Mutex<PriorityOp>,
    thread_state: SharedState<ThreadState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ServingQueue {
    pub fn new() -> Result<Arc<Self>> {
        let queue = Arc::new(Self {
            read_queue: Mutex::new(VecDeque::new()),
            write_queue: Mutex::new(VecDeque::new()),
            sem: Semaphore::new(0),
            priority: Mutex::new(PriorityOp::Write),
            thread_state: SharedState::new(ThreadState::NotRunning),
            worker: Mutex::new(None),
        });
        let worker_queue = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("blockline-serve".to_string())
            .spawn(move || worker_queue.run())
            .map_err(|e| BlocklineError::invalid(format!("failed to spawn queue worker: {e}")))?;
        *queue.worker.lock() = Some(handle);
        queue.thread_state.set_to(ThreadState::Running);
        info!("serving queue started");
        Ok(queue)
    }

    fn run(&self) {
        self.thread_state.wait_for_at_least(ThreadState::Running);
        let mut write_phase = true;
        loop {
            self.sem.acquire();

            if write_phase {
                let req = self.write_queue.lock().pop_front();
                match req {
                    Some(req) => {
                        req.execute_io();
                        req.completed(false);
                    }
                    None => {
                        self.sem.signal();
                        if *self.priority.lock() == PriorityOp::Write {
                            write_phase = false;
                        }
                    }
                }
                if matches!(*self.priority.lock(), PriorityOp::None | PriorityOp::Read) {
                    write_phase = false;
                }
            } else {
                let req = self.read_queue.lock().pop_front();
                match req {
                    Some(req) => {
                        req.execute_io();
                        req.completed(false);
                    }
                    None => {
                        self.sem.signal();
                        if *self.priority.lock() == PriorityOp::Read {
                            write_phase = true;
                        }
                    }
                }
                if matches!(*self.priority.lock(), PriorityOp::None | PriorityOp::Write) {
                    write_phase = true;
                }
            }

            // drain the remaining count before exiting
            if self.thread_state.get() == ThreadState::Terminating {
                if self.sem.acquire() == 0 {
                    break;
                }
                self.sem.signal();
            }
        }
        self.thread_state.set_to(ThreadState::Terminated);
        debug!("serving queue worker exited");
    }

    /// Log submissions that overlap a pending request going the other way;
    /// the caller is expected to complete one before issuing the other.
    fn warn_on_opposite_overlap(&self, req: &RequestPtr) {
        let other = match req.kind() {
            RequestKind::Read => self.write_queue.lock(),
            RequestKind::Write => self.read_queue.lock(),
        };
        if let Some(pending) = other.iter().find(|p| req.overlaps(p)) {
            warn!(
                offset = req.offset(),
                bytes = req.bytes(),
                op = req.kind().as_str(),
                pending_op = pending.kind().as_str(),
                "request overlaps a pending request in the opposite direction"
            );
        }
    }
}

impl RequestQueue for ServingQueue {
    fn add_request(&self, req: RequestPtr) -> Result<()> {
        if self.thread_state.get() != ThreadState::Running {
            return Err(BlocklineError::invalid(
                "request submitted to a terminating queue",
            ));
        }
        self.warn_on_opposite_overlap(&req);
        match req.kind() {
            RequestKind::Read => self.read_queue.lock().push_back(req),
            RequestKind::Write => self.write_queue.lock().push_back(req),
        }
        self.sem.signal();
        Ok(())
    }

    fn cancel_request(&self, req: &RequestPtr) -> bool {
        let removed = {
            let mut queue = match req.kind() {
                RequestKind::Read => self.read_queue.lock(),
                RequestKind::Write => self.write_queue.lock(),
            };
            match queue.iter().position(|r| Arc::ptr_eq(r, req)) {
                Some(pos) => {
                    queue.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            // reclaim the credit counted for this request; at worst the
            // worker holds it briefly while finding the list empty
            self.sem.acquire();
            req.completed(true);
        }
        removed
    }

    fn set_priority_op(&self, op: PriorityOp) {
        *self.priority.lock() = op;
    }

    fn terminate(&self) {
        if self.thread_state.get() != ThreadState::Running {
            return;
        }
        self.thread_state.set_to(ThreadState::Terminating);
        self.sem.signal();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        debug!("serving queue terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuf;
    use crate::config::DirectMode;
    use crate::io::request::Request;
    use crate::io::syscall::SyscallFile;
    use crate::io::{DiskFile, FilePtr};
    use tempfile::tempdir;

    fn test_file(dir: &tempfile::TempDir, device: u32) -> FilePtr {
        let path = dir.path().join(format!("disk{device}"));
        let file =
            SyscallFile::open(&path, DirectMode::Off, device, None, device as i64, false).unwrap();
        file.set_size(1 << 22).unwrap();
        Arc::new(file)
    }

    #[test]
    fn requests_are_served() {
        let dir = tempdir().unwrap();
        let file = test_file(&dir, 7400);
        let queue = ServingQueue::new().unwrap();

        let mut buf = AlignedBuf::new(8192).unwrap();
        buf.fill(0x7e);
        let write =
            Request::new(Arc::clone(&file), buf, 0, RequestKind::Write, None).unwrap();
        queue.add_request(Arc::clone(&write)).unwrap();
        write.wait().unwrap();

        let read_buf = AlignedBuf::new(8192).unwrap();
        let read = Request::new(Arc::clone(&file), read_buf, 0, RequestKind::Read, None).unwrap();
        queue.add_request(Arc::clone(&read)).unwrap();
        read.wait().unwrap();

        let back = read.take_buffer().unwrap();
        assert!(back.iter().all(|&b| b == 0x7e));

        queue.terminate();
    }

    #[test]
    fn completion_handler_fires_once_with_success() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let dir = tempdir().unwrap();
        let file = test_file(&dir, 7401);
        let queue = ServingQueue::new().unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        let buf = AlignedBuf::new(4096).unwrap();
        let req = Request::new(
            Arc::clone(&file),
            buf,
            0,
            RequestKind::Write,
            Some(Box::new(move |_req, success| {
                assert!(success);
                calls2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
        queue.add_request(Arc::clone(&req)).unwrap();
        req.wait().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(req.poll());

        queue.terminate();
    }

    #[test]
    fn terminate_drains_queue() {
        let dir = tempdir().unwrap();
        let file = test_file(&dir, 7402);
        let queue = ServingQueue::new().unwrap();

        let reqs: Vec<_> = (0..8)
            .map(|i| {
                let buf = AlignedBuf::new(4096).unwrap();
                Request::new(Arc::clone(&file), buf, i * 4096, RequestKind::Write, None).unwrap()
            })
            .collect();
        for req in &reqs {
            queue.add_request(Arc::clone(req)).unwrap();
        }
        queue.terminate();
        for req in &reqs {
            assert!(req.poll());
        }
        assert_eq!(file.size().unwrap(), 1 << 22);
    }

    #[test]
    fn add_after_terminate_is_rejected() {
        let dir = tempdir().unwrap();
        let file = test_file(&dir, 7403);
        let queue = ServingQueue::new().unwrap();
        queue.terminate();

        let buf = AlignedBuf::new(4096).unwrap();
        let req = Request::new(Arc::clone(&file), buf, 0, RequestKind::Write, None).unwrap();
        assert!(queue.add_request(req).is_err());
    }

    #[test]
    fn priority_mode_is_settable() {
        let queue = ServingQueue::new().unwrap();
        queue.set_priority_op(PriorityOp::Read);
        assert_eq!(*queue.priority.lock(), PriorityOp::Read);
        queue.set_priority_op(PriorityOp::None);
        queue.terminate();
    }
}
