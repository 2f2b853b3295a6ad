//! Disk configuration for blockline
//!
//! The engine consumes an already-parsed list of disk descriptors; each one
//! names a path (regular file or device node), a declared capacity, the I/O
//! backend that should serve it, and a handful of per-disk knobs. A size of
//! zero marks a scratch disk: it grows on demand and its file is removed
//! when the block manager drops.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{BlocklineError, Result};

/// Default depth of a batch-submission queue when the configuration leaves
/// it at zero.
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Upper bound on the configurable batch-queue depth.
pub const MAX_QUEUE_DEPTH: usize = 4096;

/// I/O backend serving a disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Positioned read/write syscalls under a per-file mutex.
    #[default]
    Syscall,
    /// Per-transfer memory mapping.
    Mmap,
    /// Batched asynchronous submission with a bounded in-flight window.
    Aio,
    /// One file per block, named by block offset.
    FilePerBlock,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Syscall => write!(f, "syscall"),
            BackendKind::Mmap => write!(f, "mmap"),
            BackendKind::Aio => write!(f, "aio"),
            BackendKind::FilePerBlock => write!(f, "fileperblock"),
        }
    }
}

/// Direct-I/O tristate.
///
/// `Off` never requests it, `Try` requests it and falls back (with a logged
/// warning) when the filesystem refuses, `On` fails the open instead of
/// falling back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectMode {
    Off,
    #[default]
    Try,
    On,
}

/// Configuration of one disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Filesystem path or device node.
    pub path: PathBuf,

    /// Declared capacity in bytes. Zero means autogrow plus delete-on-exit.
    #[serde(default)]
    pub size: u64,

    /// Backend serving this disk.
    #[serde(default)]
    pub backend: BackendKind,

    /// Direct-I/O tristate.
    #[serde(default)]
    pub direct: DirectMode,

    /// Extend the file on demand when an allocation does not fit.
    #[serde(default)]
    pub autogrow: bool,

    /// Remove the file when the block manager drops.
    #[serde(default)]
    pub delete_on_exit: bool,

    /// Unlink the path right after opening it (scratch space that vanishes
    /// with the last descriptor).
    #[serde(default)]
    pub unlink_on_open: bool,

    /// Request queue id. `None` selects the per-disk default queue, or the
    /// shared batch queue for the aio backend.
    #[serde(default)]
    pub queue_id: Option<i64>,

    /// Physical device id, used to attribute statistics. `None` lets the
    /// block manager enumerate devices.
    #[serde(default)]
    pub device_id: Option<u32>,

    /// Desired batch-queue depth. Zero selects [`DEFAULT_QUEUE_DEPTH`].
    #[serde(default)]
    pub queue_depth: usize,
}

impl DiskConfig {
    /// Descriptor with defaults for everything but path and size.
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
            backend: BackendKind::default(),
            direct: DirectMode::default(),
            autogrow: false,
            delete_on_exit: false,
            unlink_on_open: false,
            queue_id: None,
            device_id: None,
            queue_depth: 0,
        }
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn direct(mut self, direct: DirectMode) -> Self {
        self.direct = direct;
        self
    }

    pub fn autogrow(mut self, autogrow: bool) -> Self {
        self.autogrow = autogrow;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Apply the zero-size convention and validate the descriptor.
    pub fn normalize(mut self) -> Result<Self> {
        if self.size == 0 {
            self.autogrow = true;
            self.delete_on_exit = true;
        }
        if self.path.as_os_str().is_empty() {
            return Err(BlocklineError::config("disk path must not be empty"));
        }
        if self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(BlocklineError::config(format!(
                "queue depth {} exceeds maximum {}",
                self.queue_depth, MAX_QUEUE_DEPTH
            )));
        }
        Ok(self)
    }

    /// Effective batch-queue depth after defaulting.
    pub fn effective_queue_depth(&self) -> usize {
        if self.queue_depth == 0 {
            DEFAULT_QUEUE_DEPTH
        } else {
            self.queue_depth
        }
    }
}
