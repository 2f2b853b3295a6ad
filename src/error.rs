//! Error types for blockline
//!
//! One crate-wide error enum covers the whole engine. Errors raised while a
//! request is being served asynchronously are stored on the request itself
//! and re-raised by `Request::check_errors()`, so every variant is cheap to
//! clone.

use thiserror::Error;

/// Result type alias for blockline operations
pub type Result<T> = std::result::Result<T, BlocklineError>;

/// Main error type for blockline
#[derive(Error, Debug, Clone)]
pub enum BlocklineError {
    /// A backend syscall failed while serving a transfer. Carries the full
    /// request context so the failure can be attributed without a debugger.
    #[error("I/O error: {operation} path={path} offset={offset} bytes={bytes} op={direction}: {detail}")]
    Io {
        operation: &'static str,
        path: String,
        offset: u64,
        bytes: usize,
        direction: &'static str,
        detail: String,
    },

    /// The disk allocator cannot satisfy a request and the disk is not
    /// allowed to grow.
    #[error("out of external memory: {requested} bytes requested, {free} bytes free (enable autogrow?)")]
    OutOfSpace { requested: u64, free: u64 },

    /// Deallocation of a region that overlaps an already-free extent.
    #[error("double free of external memory: region {offset}+{size} overlaps free extent {free_offset}+{free_size}")]
    DoubleFree {
        offset: u64,
        size: u64,
        free_offset: u64,
        free_size: u64,
    },

    /// Empty request, request submitted to a terminating queue, or a
    /// similarly malformed call.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Aligned buffer allocation failed.
    #[error("aligned allocation failed: {size} bytes aligned to {alignment}")]
    AllocFailed { size: usize, alignment: usize },

    #[error("configuration error: {0}")]
    Config(String),
}

impl BlocklineError {
    /// I/O error with request context, from an OS error.
    pub fn io(
        operation: &'static str,
        path: &std::path::Path,
        offset: u64,
        bytes: usize,
        direction: &'static str,
        err: &std::io::Error,
    ) -> Self {
        BlocklineError::Io {
            operation,
            path: path.display().to_string(),
            offset,
            bytes,
            direction,
            detail: err.to_string(),
        }
    }

    /// I/O error for calls that are not transfers (open, resize, lock).
    pub fn io_op(operation: &'static str, path: &std::path::Path, err: &std::io::Error) -> Self {
        BlocklineError::Io {
            operation,
            path: path.display().to_string(),
            offset: 0,
            bytes: 0,
            direction: "-",
            detail: err.to_string(),
        }
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        BlocklineError::InvalidArgument(detail.into())
    }

    pub fn config(detail: impl Into<String>) -> Self {
        BlocklineError::Config(detail.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::path::Path;

    #[test]
    fn io_error_carries_request_context() {
        let os = io::Error::new(io::ErrorKind::Other, "short write");
        let err = BlocklineError::io("serve", Path::new("/tmp/disk0"), 4096, 8192, "WRITE", &os);
        let msg = err.to_string();
        assert!(msg.contains("/tmp/disk0"));
        assert!(msg.contains("offset=4096"));
        assert!(msg.contains("WRITE"));
        assert!(msg.contains("short write"));
    }

    #[test]
    fn out_of_space_display() {
        let err = BlocklineError::OutOfSpace {
            requested: 1 << 20,
            free: 0,
        };
        assert!(err.to_string().contains("out of external memory"));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = BlocklineError::invalid("empty request");
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
    }
}
