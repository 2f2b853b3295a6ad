//! Disk allocation strategies
//!
//! A strategy is a pure function from block index to disk index within a
//! half-open disk range `[begin, end)`. The block manager applies it to
//! tag each block of an allocation with its target disk; everything else
//! (offset assignment, growth) happens per disk.

use rand::seq::SliceRandom;
use rand::Rng;

/// Maps block indices to disk indices.
pub trait AllocStrategy {
    fn assign(&self, index: usize) -> usize;

    fn name(&self) -> &'static str;
}

/// Round-robin over the disk range: `begin + i mod D`.
#[derive(Debug, Clone)]
pub struct Striping {
    begin: usize,
    diff: usize,
}

impl Striping {
    pub fn new(begin: usize, end: usize) -> Self {
        assert!(end > begin, "empty disk range");
        Self {
            begin,
            diff: end - begin,
        }
    }

    pub fn disks(&self) -> usize {
        self.diff
    }
}

impl AllocStrategy for Striping {
    fn assign(&self, index: usize) -> usize {
        self.begin + index % self.diff
    }

    fn name(&self) -> &'static str {
        "striping"
    }
}

/// Striping shifted by a random offset drawn once at construction.
#[derive(Debug, Clone)]
pub struct SimpleRandom {
    base: Striping,
    shift: usize,
}

impl SimpleRandom {
    pub fn new(begin: usize, end: usize) -> Self {
        let base = Striping::new(begin, end);
        let shift = rand::thread_rng().gen_range(0..base.diff);
        Self { base, shift }
    }
}

impl AllocStrategy for SimpleRandom {
    fn assign(&self, index: usize) -> usize {
        self.base.begin + (index + self.shift) % self.base.diff
    }

    fn name(&self) -> &'static str {
        "simple randomized striping"
    }
}

/// An independent uniform draw per block.
#[derive(Debug, Clone)]
pub struct FullyRandom {
    base: Striping,
}

impl FullyRandom {
    pub fn new(begin: usize, end: usize) -> Self {
        Self {
            base: Striping::new(begin, end),
        }
    }
}

impl AllocStrategy for FullyRandom {
    fn assign(&self, _index: usize) -> usize {
        self.base.begin + rand::thread_rng().gen_range(0..self.base.diff)
    }

    fn name(&self) -> &'static str {
        "fully randomized striping"
    }
}

/// Striping through a random permutation of the disk range, drawn once.
#[derive(Debug, Clone)]
pub struct RandomCyclic {
    base: Striping,
    perm: Vec<usize>,
}

impl RandomCyclic {
    pub fn new(begin: usize, end: usize) -> Self {
        let base = Striping::new(begin, end);
        let mut perm: Vec<usize> = (0..base.diff).collect();
        perm.shuffle(&mut rand::thread_rng());
        Self { base, perm }
    }
}

impl AllocStrategy for RandomCyclic {
    fn assign(&self, index: usize) -> usize {
        self.base.begin + self.perm[index % self.base.diff]
    }

    fn name(&self) -> &'static str {
        "randomized cycling striping"
    }
}

/// Every block on one disk.
#[derive(Debug, Clone)]
pub struct SingleDisk {
    disk: usize,
}

impl SingleDisk {
    pub fn new(disk: usize) -> Self {
        Self { disk }
    }
}

impl AllocStrategy for SingleDisk {
    fn assign(&self, _index: usize) -> usize {
        self.disk
    }

    fn name(&self) -> &'static str {
        "single disk"
    }
}

/// Wraps a strategy, shifting every block index by a fixed offset.
#[derive(Debug, Clone)]
pub struct OffsetStrategy<S> {
    base: S,
    offset: usize,
}

impl<S: AllocStrategy> OffsetStrategy<S> {
    pub fn new(base: S, offset: usize) -> Self {
        Self { base, offset }
    }
}

impl<S: AllocStrategy> AllocStrategy for OffsetStrategy<S> {
    fn assign(&self, index: usize) -> usize {
        self.base.assign(self.offset + index)
    }

    fn name(&self) -> &'static str {
        self.base.name()
    }
}

/// Lays `runs` parallel runs out across the disks of a base strategy, so
/// that run `r`'s block `b` lands where the base strategy puts index
/// `r + b·runs`. Consecutive blocks of every run then rotate through the
/// disks without two runs piling onto the same one.
#[derive(Debug, Clone)]
pub struct Interleaved<S> {
    base: S,
    runs: usize,
}

impl<S: AllocStrategy> Interleaved<S> {
    pub fn new(base: S, runs: usize) -> Self {
        assert!(runs > 0, "at least one run");
        Self { base, runs }
    }

    pub fn assign(&self, run: usize, block: usize) -> usize {
        debug_assert!(run < self.runs);
        self.base.assign(run + block * self.runs)
    }

    /// View of one run as a plain strategy over its own block indices.
    pub fn run(&self, run: usize) -> InterleavedRun<'_, S> {
        debug_assert!(run < self.runs);
        InterleavedRun { parent: self, run }
    }
}

pub struct InterleavedRun<'a, S> {
    parent: &'a Interleaved<S>,
    run: usize,
}

impl<S: AllocStrategy> AllocStrategy for InterleavedRun<'_, S> {
    fn assign(&self, index: usize) -> usize {
        self.parent.assign(self.run, index)
    }

    fn name(&self) -> &'static str {
        "interleaved"
    }
}
