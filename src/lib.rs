//! # blockline
//!
//! An out-of-core block I/O engine. blockline lets an application address
//! terabytes of storage as uniformly sized blocks scattered over several
//! physical devices, while issuing concurrent, asynchronous, direct-I/O
//! transfers that bypass the operating system's page cache.
//!
//! The pieces, bottom up:
//!
//! - [`buffer::AlignedBuf`]: buffers whose address and length satisfy the
//!   direct-I/O alignment contract (4096 bytes).
//! - [`io`]: file backends (syscall, mmap, batched submission,
//!   file-per-block), the request objects with completion handlers and
//!   cancellation, and the per-disk queues that order transfers.
//! - [`alloc`]: block identifiers, pluggable striping/random allocation
//!   strategies, per-disk free-space maps, and the [`alloc::BlockManager`]
//!   that fans allocations out across disks.
//! - [`stats`]: per-device and aggregate transfer/wait accounting with
//!   snapshot differencing.
//!
//! # Example
//!
//! ```no_run
//! use blockline::alloc::{Bid, BlockManager, Striping};
//! use blockline::buffer::AlignedBuf;
//! use blockline::config::DiskConfig;
//! use blockline::io::wait_all;
//!
//! # fn main() -> blockline::Result<()> {
//! const BLOCK: usize = 1 << 20;
//!
//! let manager = BlockManager::new(vec![
//!     DiskConfig::new("/tmp/blockline.0", 0),
//!     DiskConfig::new("/tmp/blockline.1", 0),
//! ])?;
//!
//! let mut bids: Vec<Bid<BLOCK>> = (0..4).map(|_| Bid::new()).collect();
//! manager.new_blocks(&Striping::new(0, manager.ndisks()), &mut bids)?;
//!
//! let mut requests = Vec::new();
//! for bid in &bids {
//!     let mut buf = AlignedBuf::new(BLOCK)?;
//!     buf.fill(0xab);
//!     requests.push(bid.write(buf, None)?);
//! }
//! wait_all(&requests)?;
//!
//! manager.delete_blocks(&bids)?;
//! # Ok(())
//! # }
//! ```

pub mod alloc;
pub mod buffer;
pub mod config;
pub mod error;
pub mod io;
pub mod stats;
pub mod sync;

pub use alloc::{Bid, BlockManager, DynBid};
pub use buffer::{AlignedBuf, BLOCK_ALIGNMENT};
pub use config::{BackendKind, DirectMode, DiskConfig};
pub use error::{BlocklineError, Result};
pub use io::{DiskFile, DiskQueues, FileExt, FilePtr, PriorityOp, Request, RequestPtr};
pub use stats::{Stats, StatsData};
