//! I/O statistics
//!
//! Every transfer reports two events (started, finished) against the
//! per-device table; `Request::wait` reports wait begin/end. Time counters
//! follow the concurrency-weighted rule: while `n` operations of a kind are
//! active and `Δt` elapses, the serving-time counter grows by `n·Δt`, and
//! the corresponding parallel-time counter grows by `Δt` whenever `n > 0`.
//! Snapshots can be subtracted to measure a region of execution.

use std::ops::Sub;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use parking_lot::Mutex;

/// Seconds since the first statistics access in this process.
pub fn timestamp() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Which kind of request a wait is blocked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitKind {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct DirCounters {
    count: u64,
    bytes: u64,
    /// concurrency-weighted serving time (n·Δt)
    time: f64,
    p_begin: f64,
    acc: u64,
}

impl DirCounters {
    fn started(&mut self, bytes: u64, now: f64) {
        self.count += 1;
        self.bytes += bytes;
        let diff = now - self.p_begin;
        self.time += self.acc as f64 * diff;
        self.acc += 1;
        self.p_begin = now;
    }

    fn finished(&mut self, now: f64) {
        let diff = now - self.p_begin;
        self.time += self.acc as f64 * diff;
        self.acc = self.acc.saturating_sub(1);
        self.p_begin = now;
    }
}

/// Per-device transfer counters. One instance per physical device id; files
/// on the same device share it. The statistics table owns these for the
/// process lifetime, so they may outlive any file that reports into them.
pub struct FileStats {
    device_id: u32,
    read: Mutex<DirCounters>,
    write: Mutex<DirCounters>,
}

impl FileStats {
    fn new(device_id: u32) -> Self {
        Self {
            device_id,
            read: Mutex::new(DirCounters::default()),
            write: Mutex::new(DirCounters::default()),
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn read_started(&self, bytes: u64) {
        let now = timestamp();
        self.read.lock().started(bytes, now);
        Stats::global().parallel_started(WaitKind::Read, now);
    }

    pub fn read_finished(&self) {
        let now = timestamp();
        self.read.lock().finished(now);
        Stats::global().parallel_finished(WaitKind::Read, now);
    }

    pub fn write_started(&self, bytes: u64) {
        let now = timestamp();
        self.write.lock().started(bytes, now);
        Stats::global().parallel_started(WaitKind::Write, now);
    }

    pub fn write_finished(&self) {
        let now = timestamp();
        self.write.lock().finished(now);
        Stats::global().parallel_finished(WaitKind::Write, now);
    }

    pub fn snapshot(&self) -> FileStatsData {
        let read = self.read.lock();
        let write = self.write.lock();
        FileStatsData {
            device_id: self.device_id,
            read_count: read.count,
            write_count: write.count,
            read_bytes: read.bytes,
            write_bytes: write.bytes,
            read_time: read.time,
            write_time: write.time,
        }
    }
}

#[derive(Debug, Default)]
struct ParallelCounters {
    p_reads: f64,
    p_writes: f64,
    p_ios: f64,
    acc_reads: u64,
    acc_writes: u64,
    acc_ios: u64,
    p_begin_read: f64,
    p_begin_write: f64,
    p_begin_io: f64,
}

#[derive(Debug, Default)]
struct WaitAcc {
    /// concurrency-weighted wait time (n·Δt)
    time: f64,
    p_begin: f64,
    acc: u64,
}

impl WaitAcc {
    fn started(&mut self, now: f64) {
        let diff = now - self.p_begin;
        self.time += self.acc as f64 * diff;
        self.acc += 1;
        self.p_begin = now;
    }

    fn finished(&mut self, now: f64) {
        let diff = now - self.p_begin;
        self.time += self.acc as f64 * diff;
        self.acc = self.acc.saturating_sub(1);
        self.p_begin = now;
    }
}

#[derive(Debug, Default)]
struct WaitCounters {
    any: WaitAcc,
    read: WaitAcc,
    write: WaitAcc,
    p_waits: f64,
    p_begin_wait: f64,
    acc_waits: u64,
}

/// Process-wide statistics table.
///
/// Created before any queue or file (both reach for it on construction) and
/// never torn down, so completion paths can always report into it.
pub struct Stats {
    files: Mutex<Vec<Arc<FileStats>>>,
    parallel: Mutex<ParallelCounters>,
    waits: Mutex<WaitCounters>,
    creation: f64,
}

impl Stats {
    pub fn global() -> &'static Stats {
        static INSTANCE: OnceLock<Stats> = OnceLock::new();
        INSTANCE.get_or_init(|| Stats {
            files: Mutex::new(Vec::new()),
            parallel: Mutex::new(ParallelCounters::default()),
            waits: Mutex::new(WaitCounters::default()),
            creation: timestamp(),
        })
    }

    /// Counters for `device_id`, creating the entry on first use.
    pub fn file_stats(&self, device_id: u32) -> Arc<FileStats> {
        let mut files = self.files.lock();
        if let Some(fs) = files.iter().find(|fs| fs.device_id == device_id) {
            return Arc::clone(fs);
        }
        let fs = Arc::new(FileStats::new(device_id));
        files.push(Arc::clone(&fs));
        fs
    }

    fn parallel_started(&self, kind: WaitKind, now: f64) {
        let mut p = self.parallel.lock();
        match kind {
            WaitKind::Read => {
                let diff = now - p.p_begin_read;
                if p.acc_reads > 0 {
                    p.p_reads += diff;
                }
                p.acc_reads += 1;
                p.p_begin_read = now;
            }
            WaitKind::Write => {
                let diff = now - p.p_begin_write;
                if p.acc_writes > 0 {
                    p.p_writes += diff;
                }
                p.acc_writes += 1;
                p.p_begin_write = now;
            }
        }
        let diff = now - p.p_begin_io;
        if p.acc_ios > 0 {
            p.p_ios += diff;
        }
        p.acc_ios += 1;
        p.p_begin_io = now;
    }

    fn parallel_finished(&self, kind: WaitKind, now: f64) {
        let mut p = self.parallel.lock();
        match kind {
            WaitKind::Read => {
                let diff = now - p.p_begin_read;
                if p.acc_reads > 0 {
                    p.p_reads += diff;
                }
                p.acc_reads = p.acc_reads.saturating_sub(1);
                p.p_begin_read = now;
            }
            WaitKind::Write => {
                let diff = now - p.p_begin_write;
                if p.acc_writes > 0 {
                    p.p_writes += diff;
                }
                p.acc_writes = p.acc_writes.saturating_sub(1);
                p.p_begin_write = now;
            }
        }
        let diff = now - p.p_begin_io;
        if p.acc_ios > 0 {
            p.p_ios += diff;
        }
        p.acc_ios = p.acc_ios.saturating_sub(1);
        p.p_begin_io = now;
    }

    pub fn wait_started(&self, kind: WaitKind) {
        let now = timestamp();
        let mut w = self.waits.lock();
        let diff = now - w.p_begin_wait;
        if w.acc_waits > 0 {
            w.p_waits += diff;
        }
        w.acc_waits += 1;
        w.p_begin_wait = now;
        w.any.started(now);
        match kind {
            WaitKind::Read => w.read.started(now),
            WaitKind::Write => w.write.started(now),
        }
    }

    pub fn wait_finished(&self, kind: WaitKind) {
        let now = timestamp();
        let mut w = self.waits.lock();
        let diff = now - w.p_begin_wait;
        if w.acc_waits > 0 {
            w.p_waits += diff;
        }
        w.acc_waits = w.acc_waits.saturating_sub(1);
        w.p_begin_wait = now;
        w.any.finished(now);
        match kind {
            WaitKind::Read => w.read.finished(now),
            WaitKind::Write => w.write.finished(now),
        }
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsData {
        let files = self.files.lock();
        let file_data = files.iter().map(|fs| fs.snapshot()).collect();
        let p = self.parallel.lock();
        let w = self.waits.lock();
        StatsData {
            files: file_data,
            parallel_read_time: p.p_reads,
            parallel_write_time: p.p_writes,
            parallel_io_time: p.p_ios,
            wait_time: w.any.time,
            read_wait_time: w.read.time,
            write_wait_time: w.write.time,
            parallel_wait_time: w.p_waits,
            elapsed: timestamp() - self.creation,
        }
    }
}

/// Snapshot of one device's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FileStatsData {
    pub device_id: u32,
    pub read_count: u64,
    pub write_count: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub read_time: f64,
    pub write_time: f64,
}

/// Snapshot of the whole statistics table. Two snapshots taken around a
/// region of execution subtract to the counters accumulated inside it.
#[derive(Debug, Clone, Default)]
pub struct StatsData {
    files: Vec<FileStatsData>,
    pub parallel_read_time: f64,
    pub parallel_write_time: f64,
    pub parallel_io_time: f64,
    pub wait_time: f64,
    pub read_wait_time: f64,
    pub write_wait_time: f64,
    pub parallel_wait_time: f64,
    pub elapsed: f64,
}

impl StatsData {
    pub fn files(&self) -> &[FileStatsData] {
        &self.files
    }

    pub fn read_count(&self) -> u64 {
        self.files.iter().map(|f| f.read_count).sum()
    }

    pub fn write_count(&self) -> u64 {
        self.files.iter().map(|f| f.write_count).sum()
    }

    pub fn read_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.read_bytes).sum()
    }

    pub fn write_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.write_bytes).sum()
    }

    pub fn read_time(&self) -> f64 {
        self.files.iter().map(|f| f.read_time).sum()
    }

    pub fn write_time(&self) -> f64 {
        self.files.iter().map(|f| f.write_time).sum()
    }
}

impl Sub for &StatsData {
    type Output = StatsData;

    /// Subtract an earlier snapshot from a later one.
    ///
    /// Every device present in `rhs` must be present in `self`; devices that
    /// appeared after `rhs` was taken are carried over unchanged.
    fn sub(self, rhs: &StatsData) -> StatsData {
        let files = self
            .files
            .iter()
            .map(|f| {
                let base = rhs
                    .files
                    .iter()
                    .find(|r| r.device_id == f.device_id)
                    .copied()
                    .unwrap_or(FileStatsData {
                        device_id: f.device_id,
                        ..FileStatsData::default()
                    });
                FileStatsData {
                    device_id: f.device_id,
                    read_count: f.read_count - base.read_count,
                    write_count: f.write_count - base.write_count,
                    read_bytes: f.read_bytes - base.read_bytes,
                    write_bytes: f.write_bytes - base.write_bytes,
                    read_time: f.read_time - base.read_time,
                    write_time: f.write_time - base.write_time,
                }
            })
            .collect();
        for r in &rhs.files {
            assert!(
                self.files.iter().any(|f| f.device_id == r.device_id),
                "statistics snapshots do not cover the same devices (device {} missing)",
                r.device_id
            );
        }
        StatsData {
            files,
            parallel_read_time: self.parallel_read_time - rhs.parallel_read_time,
            parallel_write_time: self.parallel_write_time - rhs.parallel_write_time,
            parallel_io_time: self.parallel_io_time - rhs.parallel_io_time,
            wait_time: self.wait_time - rhs.wait_time,
            read_wait_time: self.read_wait_time - rhs.read_wait_time,
            write_wait_time: self.write_wait_time - rhs.write_wait_time,
            parallel_wait_time: self.parallel_wait_time - rhs.parallel_wait_time,
            elapsed: self.elapsed - rhs.elapsed,
        }
    }
}

impl std::fmt::Display for StatsData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "I/O statistics: {} reads ({} bytes), {} writes ({} bytes) over {:.3}s",
            self.read_count(),
            self.read_bytes(),
            self.write_count(),
            self.write_bytes(),
            self.elapsed,
        )?;
        writeln!(
            f,
            "  serving time: read {:.3}s write {:.3}s, parallel: read {:.3}s write {:.3}s io {:.3}s",
            self.read_time(),
            self.write_time(),
            self.parallel_read_time,
            self.parallel_write_time,
            self.parallel_io_time,
        )?;
        write!(
            f,
            "  wait time: {:.3}s (read {:.3}s, write {:.3}s, parallel {:.3}s)",
            self.wait_time, self.read_wait_time, self.write_wait_time, self.parallel_wait_time,
        )?;
        for fs in &self.files {
            write!(
                f,
                "\n  device {}: {} reads ({} bytes), {} writes ({} bytes)",
                fs.device_id, fs.read_count, fs.read_bytes, fs.write_count, fs.write_bytes,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_counters_accumulate() {
        let fs = FileStats::new(9000);
        fs.read_started(4096);
        fs.read_finished();
        fs.write_started(8192);
        fs.write_finished();
        let data = fs.snapshot();
        assert_eq!(data.read_count, 1);
        assert_eq!(data.read_bytes, 4096);
        assert_eq!(data.write_count, 1);
        assert_eq!(data.write_bytes, 8192);
        assert!(data.read_time >= 0.0);
    }

    #[test]
    fn aggregate_equals_per_device_sum() {
        let a = FileStats::new(9001);
        let b = FileStats::new(9002);
        a.read_started(1000);
        a.read_finished();
        b.read_started(500);
        b.read_finished();
        let data = StatsData {
            files: vec![a.snapshot(), b.snapshot()],
            ..StatsData::default()
        };
        assert_eq!(data.read_bytes(), 1500);
        assert_eq!(data.read_count(), 2);
    }

    #[test]
    fn snapshot_diff_is_exact() {
        let stats = Stats::global();
        let fs = stats.file_stats(9100);
        let before = stats.snapshot();
        fs.write_started(4096);
        fs.write_finished();
        let after = stats.snapshot();
        let diff = &after - &before;
        let dev = diff
            .files()
            .iter()
            .find(|f| f.device_id == 9100)
            .expect("device tracked");
        assert_eq!(dev.write_count, 1);
        assert_eq!(dev.write_bytes, 4096);
    }

    #[test]
    fn wait_counters_balance() {
        let stats = Stats::global();
        let before = stats.snapshot();
        stats.wait_started(WaitKind::Read);
        stats.wait_finished(WaitKind::Read);
        let after = stats.snapshot();
        let diff = &after - &before;
        assert!(diff.read_wait_time >= 0.0);
        assert!(diff.wait_time >= diff.read_wait_time - 1e-9);
    }

    #[test]
    fn same_device_id_shares_counters() {
        let stats = Stats::global();
        let a = stats.file_stats(9200);
        let b = stats.file_stats(9200);
        assert!(Arc::ptr_eq(&a, &b));
    }
}
