//! Per-disk queue registry
//!
//! Process-wide map from queue id to queue. The first request for a queue
//! id constructs the queue matching the file's backend: batch submission
//! for aio files, the two-queue serving worker for everything else. The
//! registry also fans the global priority mode out to every queue.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{BlocklineError, Result};
use crate::io::request::RequestPtr;
use crate::io::{batch_queue::BatchQueue, queue::ServingQueue, DiskFile, QueueDiscipline};
use crate::stats::Stats;

/// Which side of a two-queue worker is drained preferentially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityOp {
    Read,
    Write,
    None,
}

/// A per-disk request queue.
pub trait RequestQueue: Send + Sync {
    fn add_request(&self, req: RequestPtr) -> Result<()>;

    /// Remove the request before it is served, completing it as cancelled.
    /// Returns false if the request could not be withdrawn.
    fn cancel_request(&self, req: &RequestPtr) -> bool;

    fn set_priority_op(&self, op: PriorityOp);

    /// Stop accepting requests, drain the backlog, and join the workers.
    fn terminate(&self);
}

/// Registry of all per-disk queues.
pub struct DiskQueues {
    queues: Mutex<HashMap<i64, Arc<dyn RequestQueue>>>,
}

impl DiskQueues {
    pub fn global() -> &'static DiskQueues {
        static INSTANCE: OnceLock<DiskQueues> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            // statistics must exist before the first queue starts reporting
            Stats::global();
            DiskQueues {
                queues: Mutex::new(HashMap::new()),
            }
        })
    }

    /// Dispatch a request to its file's queue, constructing the queue on
    /// first use. The registry lock is not held across the enqueue itself.
    pub fn add_request(&self, req: &RequestPtr) -> Result<()> {
        let file = req
            .file()
            .ok_or_else(|| BlocklineError::invalid("request already completed"))?;
        let queue_id = file.queue_id();
        let queue = {
            let mut queues = self.queues.lock();
            match queues.get(&queue_id) {
                Some(queue) => Arc::clone(queue),
                None => {
                    let queue: Arc<dyn RequestQueue> = match file.queue_discipline() {
                        QueueDiscipline::Serving => ServingQueue::new()?,
                        QueueDiscipline::Batch { depth } => BatchQueue::new(depth)?,
                    };
                    debug!(queue_id, backend = file.io_type(), "queue created");
                    queues.insert(queue_id, Arc::clone(&queue));
                    queue
                }
            }
        };
        queue.add_request(Arc::clone(req))
    }

    /// Try to cancel a request scheduled on `queue_id`.
    pub fn cancel_request(&self, req: &RequestPtr, queue_id: i64) -> bool {
        let queue = self.queues.lock().get(&queue_id).cloned();
        match queue {
            Some(queue) => queue.cancel_request(req),
            None => false,
        }
    }

    /// Change the service priority of every queue.
    pub fn set_priority_op(&self, op: PriorityOp) {
        let queues: Vec<_> = self.queues.lock().values().cloned().collect();
        for queue in queues {
            queue.set_priority_op(op);
        }
    }

    /// Drain and join every queue. Queues are re-created on demand by later
    /// requests.
    pub fn terminate_all(&self) {
        let queues: Vec<_> = {
            let mut map = self.queues.lock();
            map.drain().map(|(_, q)| q).collect()
        };
        for queue in queues {
            queue.terminate();
        }
    }
}
