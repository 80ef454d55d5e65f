//! User-space side of the io_uring submission/completion protocol.
//!
//! An instance is two rings shared with the kernel: requests go into the
//! submission ring as fixed-size entries, results come back through the
//! completion ring. This crate is the coordination layer over that shared
//! memory: it maps the rings at the layout the kernel reports, hands out
//! submission slots, publishes them with the right memory ordering, and
//! walks completions back out.
//!
//! The lifecycle is deliberately two-step: reserve an entry with
//! [`IoUring::get_sqe`], fill it with one of the `prep_*` methods plus a
//! user-data token, then publish everything reserved with
//! [`IoUring::submit`]. Completions are peeked or waited for, read, and
//! explicitly retired.
//!
//! ```no_run
//! use uring_core::Uring;
//!
//! # fn main() -> uring_core::Result<()> {
//! let mut ring = Uring::new(8)?;
//!
//! let sqe = ring.get_sqe().expect("fresh ring has room");
//! sqe.prep_nop();
//! sqe.set_user_data(0x4242);
//!
//! ring.submit_and_wait(1)?;
//! let cqe = ring.wait_cqe()?;
//! assert_eq!(0x4242, cqe.user_data);
//! ring.cqe_seen();
//! # Ok(())
//! # }
//! ```
//!
//! One thread may own the submission side and another the completion side
//! without further locking; only calls that touch both, like
//! [`IoUring::wait_cqes`] with a timeout, need exclusivity.

/// User-data value reserved for timeout entries the ring plants on its own
/// behalf during timed waits. Submissions must never carry it.
pub const TIMEOUT_USER_DATA: u64 = u64::MAX;

mod barrier;

mod builder;
pub use builder::IoUringBuilder;

mod completion_queue;
pub use completion_queue::{CompletionQueue, Completions};

mod cqe;
pub use cqe::{CompletionQueueEntry, CQE_BUFFER_SHIFT, CQE_F_BUFFER};

mod error;
pub use error::{Error, Result};

mod mmap;
pub use mmap::MappedMemory;

mod params;
pub use params::{
    CqRingOffsets, EnterFlags, FeatureFlags, SetupFlags, SetupParameters, SqRingFlags,
    SqRingOffsets, OFF_CQ_RING, OFF_SQES, OFF_SQ_RING,
};

mod probe;
pub use probe::{probe, Probe, ProbeOp, OP_SUPPORTED, PROBE_OPS};

mod register;
pub use register::RegisterOp;

mod ring;
pub use ring::{IoUring, Uring};

mod sqe;
pub use sqe::{
    FsyncFlags, KernelTimespec, Opcode, SpliceFlags, SqeFlags, SubmissionQueueEntry, TimeoutFlags,
};

mod submission_queue;
pub use submission_queue::SubmissionQueue;

mod syscall;
pub use syscall::{SyscallLib, Syscalls};

#[cfg(test)]
mod test_support;
