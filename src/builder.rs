use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::completion_queue::CompletionQueue;
use crate::error::{Error, Result};
use crate::mmap::MappedMemory;
use crate::params::{FeatureFlags, SetupFlags, SetupParameters, OFF_CQ_RING, OFF_SQES, OFF_SQ_RING};
use crate::ring::{IoUring, Uring};
use crate::submission_queue::SubmissionQueue;
use crate::syscall::SyscallLib;

/// Configures and sets up an instance. The plain forms on [`Uring`] cover
/// the common cases; the builder exists for the setup fields that only
/// matter together with a flag (poll idle time, affinity, explicit CQ size,
/// backend sharing).
#[derive(Default)]
pub struct IoUringBuilder {
    entries: u32,
    flags: SetupFlags,
    sq_thread_cpu: u32,
    sq_thread_idle: u32,
    cq_entries: u32,
    wq_fd: u32,
}

impl IoUringBuilder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_entries(mut self, entries: u32) -> Self {
        self.entries = entries;
        self
    }

    /// Reap completions by polling instead of interrupts. Only meaningful
    /// for files opened with O_DIRECT.
    pub fn with_io_poll(mut self, option: bool) -> Self {
        self.flags.set(SetupFlags::IOPOLL, option);
        self
    }

    /// Have a kernel thread poll the submission queue, with the given idle
    /// time in milliseconds before it goes to sleep.
    pub fn with_sq_poll(mut self, idle_ms: u32) -> Self {
        self.flags |= SetupFlags::SQPOLL;
        self.sq_thread_idle = idle_ms;
        self
    }

    /// Pin the poll thread to a cpu. Implies nothing without SQPOLL.
    pub fn with_sq_affinity(mut self, cpu: u32) -> Self {
        self.flags |= SetupFlags::SQ_AFF;
        self.sq_thread_cpu = cpu;
        self
    }

    /// Ask for an explicit completion ring size instead of the default of
    /// twice the submission size.
    pub fn with_cq_entries(mut self, entries: u32) -> Self {
        self.flags.set(SetupFlags::CQSIZE, entries > 0);
        self.cq_entries = entries;
        self
    }

    /// Clamp oversized entry counts to the supported maximum instead of
    /// failing setup.
    pub fn with_clamp(mut self, option: bool) -> Self {
        self.flags.set(SetupFlags::CLAMP, option);
        self
    }

    /// Share the async backend of an existing instance.
    pub fn with_attach_wq(mut self, ring_fd: i32) -> Self {
        self.flags |= SetupFlags::ATTACH_WQ;
        self.wq_fd = ring_fd as u32;
        self
    }

    pub fn build(self) -> Result<Uring> {
        let mut params = SetupParameters::with_flags(self.flags);
        params.sq_thread_cpu = self.sq_thread_cpu;
        params.sq_thread_idle = self.sq_thread_idle;
        params.cq_entries = self.cq_entries;
        params.wq_fd = self.wq_fd;

        setup_with_params(self.entries, &mut params)
    }
}

/// The whole setup pipeline: create the instance, then map the rings at the
/// layout the kernel reported. Any failure drops what was built so far,
/// which unmaps and closes in reverse order.
pub(crate) fn setup_with_params<S: SyscallLib>(
    entries: u32,
    params: &mut SetupParameters,
) -> Result<IoUring<S>> {
    let ret = S::io_uring_setup(entries, params);
    if ret < 0 {
        return Err(Error::Setup(-ret));
    }
    let ring_fd = unsafe { OwnedFd::from_raw_fd(ret) };

    let mut sq_bytes = params.sq_ring_bytes();
    let mut cq_bytes = params.cq_ring_bytes();

    // With the single-mmap feature one region serves both rings, sized for
    // the larger of the two.
    let single_mmap = params.has_feature(FeatureFlags::SINGLE_MMAP);
    if single_mmap {
        sq_bytes = sq_bytes.max(cq_bytes);
        cq_bytes = sq_bytes;
    }

    let sq_mem = MappedMemory::map(ring_fd.as_raw_fd(), OFF_SQ_RING, sq_bytes)?;
    let sqe_mem = MappedMemory::map(ring_fd.as_raw_fd(), OFF_SQES, params.sqes_bytes())?;
    let cq_mem = if single_mmap {
        None
    } else {
        Some(MappedMemory::map(ring_fd.as_raw_fd(), OFF_CQ_RING, cq_bytes)?)
    };

    let sq = unsafe {
        SubmissionQueue::new(
            ring_fd.as_raw_fd(),
            params.flags,
            sq_mem.offset(0),
            &params.sq_off,
            sqe_mem.offset(0),
        )
    };
    let cq_base = cq_mem.as_ref().unwrap_or(&sq_mem);
    let cq = unsafe { CompletionQueue::new(cq_base.offset(0), &params.cq_off) };

    log::debug!(
        "io_uring instance up: fd {}, sq {} cq {} entries, features {:?}",
        ring_fd.as_raw_fd(),
        params.sq_entries,
        params.cq_entries,
        params.features,
    );

    Ok(IoUring::from_parts(
        ring_fd, params, sq, cq, sq_mem, cq_mem, sqe_mem,
    ))
}
