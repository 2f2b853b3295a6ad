//! Cancellation semantics: a request withdrawn before its worker picks it
//! up never touches the disk, completes with `success = false`, and still
//! satisfies `wait()` and `poll()`.

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use blockline::buffer::AlignedBuf;
use blockline::config::DirectMode;
use blockline::error::Result;
use blockline::io::{
    cancel_all, wait_all, DiskFile, FileExt, FilePtr, RequestKind, SyscallFile,
};
use blockline::stats::FileStats;

use common::{init_tracing, MIB};

/// Wraps a real file but blocks the first write at offset zero until the
/// gate opens, pinning the queue worker so that later requests stay
/// cancellable.
struct GateFile {
    inner: SyscallFile,
    stats: Arc<FileStats>,
    device_id: u32,
    gate: Mutex<bool>,
    gate_cv: Condvar,
}

impl GateFile {
    fn new(path: &Path, device_id: u32) -> Arc<Self> {
        let inner = SyscallFile::open(
            path,
            DirectMode::Off,
            device_id,
            None,
            device_id as i64,
            false,
        )
        .unwrap();
        Arc::new(Self {
            inner,
            stats: blockline::Stats::global().file_stats(device_id),
            device_id,
            gate: Mutex::new(false),
            gate_cv: Condvar::new(),
        })
    }

    fn open_gate(&self) {
        *self.gate.lock().unwrap() = true;
        self.gate_cv.notify_all();
    }
}

impl DiskFile for GateFile {
    fn serve(&self, buf: &mut [u8], offset: u64, kind: RequestKind) -> Result<()> {
        if kind == RequestKind::Write && offset == 0 {
            let mut open = self.gate.lock().unwrap();
            while !*open {
                open = self.gate_cv.wait(open).unwrap();
            }
        }
        self.inner.serve(buf, offset, kind)
    }

    fn set_size(&self, bytes: u64) -> Result<()> {
        self.inner.set_size(bytes)
    }

    fn size(&self) -> Result<u64> {
        self.inner.size()
    }

    fn lock(&self) -> Result<()> {
        self.inner.lock()
    }

    fn queue_id(&self) -> i64 {
        self.device_id as i64
    }

    fn allocator_id(&self) -> Option<usize> {
        None
    }

    fn device_id(&self) -> u32 {
        self.device_id
    }

    fn file_stats(&self) -> &Arc<FileStats> {
        &self.stats
    }

    fn io_type(&self) -> &'static str {
        "gated"
    }

    fn path(&self) -> &Path {
        self.inner.path()
    }
}

#[test]
fn cancel_before_start_leaves_the_file_untouched() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk8200");
    let gated = GateFile::new(&path, 8200);
    let file: FilePtr = Arc::clone(&gated) as FilePtr;
    file.set_size(4 * MIB as u64).unwrap();

    // prior contents everywhere
    let mut prior = AlignedBuf::new(4 * MIB).unwrap();
    prior.fill(0x11);
    gated.inner.serve(&mut prior[..], 0, RequestKind::Write).unwrap();

    let completions = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(0));
    let mut requests = Vec::new();
    for i in 0..4u64 {
        let mut buf = AlignedBuf::new(MIB).unwrap();
        buf.fill(0x22);
        let completions = Arc::clone(&completions);
        let failures = Arc::clone(&failures);
        let handler = Box::new(move |_req: &blockline::Request, success: bool| {
            completions.fetch_add(1, Ordering::SeqCst);
            if !success {
                failures.fetch_add(1, Ordering::SeqCst);
            }
        });
        requests.push(file.awrite(buf, i * MIB as u64, Some(handler)).unwrap());
    }

    // the worker is pinned on request 0; 2 and 3 are still queued
    let canceled = cancel_all(&requests[2..]);
    assert_eq!(canceled, 2);
    assert!(requests[2].poll());
    assert!(requests[3].poll());

    gated.open_gate();
    wait_all(&requests).unwrap();
    assert_eq!(completions.load(Ordering::SeqCst), 4);
    assert_eq!(failures.load(Ordering::SeqCst), 2);

    // cancelled regions keep their prior contents, served ones changed
    let mut back = vec![0u8; 4 * MIB];
    gated.inner.serve(&mut back, 0, RequestKind::Read).unwrap();
    assert!(back[..MIB].iter().all(|&b| b == 0x22));
    assert!(back[MIB..2 * MIB].iter().all(|&b| b == 0x22));
    assert!(back[2 * MIB..].iter().all(|&b| b == 0x11));
}

#[test]
fn cancel_after_completion_returns_false() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk8201");
    let file: FilePtr = Arc::new(
        SyscallFile::open(&path, DirectMode::Off, 8201, None, 8201, false).unwrap(),
    );
    file.set_size(MIB as u64).unwrap();

    let mut buf = AlignedBuf::new(MIB).unwrap();
    buf.fill(0x77);
    let req = file.awrite(buf, 0, None).unwrap();
    req.wait().unwrap();
    assert!(!req.cancel());
}

#[test]
fn cancelled_request_is_not_an_error() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("disk8202");
    let gated = GateFile::new(&path, 8202);
    let file: FilePtr = Arc::clone(&gated) as FilePtr;
    file.set_size(2 * MIB as u64).unwrap();

    let mut head = AlignedBuf::new(MIB).unwrap();
    head.fill(1);
    let pinned = file.awrite(head, 0, None).unwrap();

    let mut tail = AlignedBuf::new(MIB).unwrap();
    tail.fill(2);
    let victim = file.awrite(tail, MIB as u64, None).unwrap();

    assert!(victim.cancel());
    // cancellation is reported through the success flag, not the error slot
    victim.check_errors().unwrap();
    victim.wait().unwrap();

    gated.open_gate();
    pinned.wait().unwrap();
}
