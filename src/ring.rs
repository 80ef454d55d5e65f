use std::os::fd::{AsRawFd, OwnedFd};

use crate::completion_queue::{CompletionQueue, Completions};
use crate::cqe::CompletionQueueEntry;
use crate::error::{Error, Result};
use crate::mmap::MappedMemory;
use crate::params::{EnterFlags, FeatureFlags, SetupFlags, SetupParameters};
use crate::sqe::{KernelTimespec, SubmissionQueueEntry, TimeoutFlags};
use crate::submission_queue::SubmissionQueue;
use crate::syscall::{SyscallLib, Syscalls};
use crate::TIMEOUT_USER_DATA;

/// An io_uring instance backed by the real syscalls.
pub type Uring = IoUring<Syscalls>;

/// A live instance: the fd, the two queues, and the mappings that keep them
/// valid. Dropping it unmaps the rings and closes the fd, in any state of
/// construction. Must stay where it is while mapped; the queues hold
/// pointers into the mappings, so the type is neither `Clone` nor meant to
/// be moved between threads mid-operation.
pub struct IoUring<S: SyscallLib> {
    sq: SubmissionQueue<S>,
    cq: CompletionQueue,
    flags: SetupFlags,
    features: FeatureFlags,
    ring_fd: OwnedFd,

    // The CQ mapping is absent when the kernel coalesces both rings into the
    // SQ region (single-mmap feature).
    sq_mem: MappedMemory,
    cq_mem: Option<MappedMemory>,
    sqe_mem: MappedMemory,
}

impl Uring {
    /// Set up an instance with default parameters. `entries` is rounded and
    /// clamped by the kernel.
    pub fn new(entries: u32) -> Result<Self> {
        Self::with_flags(entries, SetupFlags::empty())
    }

    /// Set up an instance with the given setup flags only.
    pub fn with_flags(entries: u32, flags: SetupFlags) -> Result<Self> {
        let mut params = SetupParameters::with_flags(flags);
        Self::with_params(entries, &mut params)
    }

    /// Set up an instance from a caller-filled parameter record. On return
    /// the record holds the kernel's replies: actual entry counts, feature
    /// flags, and ring layout.
    pub fn with_params(entries: u32, params: &mut SetupParameters) -> Result<Self> {
        crate::builder::setup_with_params(entries, params)
    }
}

impl<S: SyscallLib> IoUring<S> {
    pub(crate) fn from_parts(
        ring_fd: OwnedFd,
        params: &SetupParameters,
        sq: SubmissionQueue<S>,
        cq: CompletionQueue,
        sq_mem: MappedMemory,
        cq_mem: Option<MappedMemory>,
        sqe_mem: MappedMemory,
    ) -> Self {
        IoUring {
            sq,
            cq,
            flags: params.flags,
            features: params.features,
            ring_fd,
            sq_mem,
            cq_mem,
            sqe_mem,
        }
    }

    #[inline]
    pub(crate) fn fd(&self) -> i32 {
        self.ring_fd.as_raw_fd()
    }

    pub fn setup_flags(&self) -> SetupFlags {
        self.flags
    }

    pub fn features(&self) -> FeatureFlags {
        self.features
    }

    /// Mark every ring mapping as not inherited across fork, so children
    /// cannot observe or corrupt this instance's state.
    pub fn ring_dontfork(&self) -> Result<()> {
        self.sq_mem.dontfork()?;
        self.sqe_mem.dontfork()?;
        if let Some(cq_mem) = &self.cq_mem {
            cq_mem.dontfork()?;
        }
        Ok(())
    }

    // ---- submission side ----

    /// Reserve the next submission entry for filling, or `None` when every
    /// slot is reserved and unsubmitted. Submit to free slots.
    pub fn get_sqe(&mut self) -> Option<&mut SubmissionQueueEntry> {
        self.sq.get_sqe()
    }

    /// Publish all reserved entries and tell the kernel, if telling it is
    /// needed. Returns how many entries the kernel consumed.
    pub fn submit(&mut self) -> Result<u32> {
        self.sq.submit()
    }

    /// As `submit`, but also wait until `wait_nr` completions are available.
    pub fn submit_and_wait(&mut self, wait_nr: u32) -> Result<u32> {
        self.sq.submit_and_wait(wait_nr)
    }

    pub fn sq_ready(&self) -> u32 {
        self.sq.sq_ready()
    }

    pub fn sq_space_left(&self) -> u32 {
        self.sq.sq_space_left()
    }

    pub fn sq_dropped(&self) -> u32 {
        self.sq.dropped()
    }

    pub fn sq_entries(&self) -> u32 {
        self.sq.ring_entries()
    }

    // ---- completion side ----

    pub fn cq_ready(&self) -> u32 {
        self.cq.ready()
    }

    pub fn cq_overflow(&self) -> u32 {
        self.cq.overflow()
    }

    pub fn cq_entries(&self) -> u32 {
        self.cq.ring_entries()
    }

    /// Iterate the completions visible right now without retiring them; call
    /// `cq_advance` with the processed count afterwards.
    pub fn completions(&self) -> Completions<'_> {
        self.cq.iter()
    }

    /// Retire `nr` completions after processing them.
    pub fn cq_advance(&mut self, nr: u32) {
        self.cq.advance(nr)
    }

    /// Retire the single completion last obtained from a peek or wait.
    pub fn cqe_seen(&mut self) {
        self.cq.advance(1)
    }

    /// Copy up to `out.len()` visible completions without retiring them.
    pub fn peek_batch_cqe(&self, out: &mut [CompletionQueueEntry]) -> usize {
        self.cq.peek_batch(out)
    }

    /// The first visible completion, if any. Ring-internal timeout entries
    /// are retired silently on the way.
    pub fn peek_cqe(&mut self) -> Result<Option<&CompletionQueueEntry>> {
        let cqe = self.cq.peek()?;
        Ok(cqe.map(|p| unsafe { &*p }))
    }

    /// The first completion, blocking until one arrives.
    pub fn wait_cqe(&mut self) -> Result<&CompletionQueueEntry> {
        self.wait_cqe_nr(1)
    }

    /// The first completion, blocking until `wait_nr` have arrived.
    pub fn wait_cqe_nr(&mut self, wait_nr: u32) -> Result<&CompletionQueueEntry> {
        if let Some(cqe) = self.cq.peek()? {
            return Ok(unsafe { &*cqe });
        }
        let cqe = self.get_cqe(0, wait_nr, None)?;
        Ok(unsafe { &*cqe })
    }

    /// As `wait_cqes` with a wait count of one.
    pub fn wait_cqe_timeout(&mut self, ts: &KernelTimespec) -> Result<&CompletionQueueEntry> {
        self.wait_cqes(1, Some(ts), None)
    }

    /// Wait for `wait_nr` completions, optionally bounded by a timeout and
    /// with a signal mask applied for the duration of the wait.
    ///
    /// The timeout is realized by submitting an internal timeout operation,
    /// so this touches the submission side as well: it must not run
    /// concurrently with another thread producing submissions, even where
    /// those threads otherwise partition the two rings between them.
    ///
    /// Expiry surfaces as [`Error::TimedOut`]; the internal completion never
    /// appears in the caller's stream.
    pub fn wait_cqes(
        &mut self,
        wait_nr: u32,
        ts: Option<&KernelTimespec>,
        sigmask: Option<&libc::sigset_t>,
    ) -> Result<&CompletionQueueEntry> {
        let mut to_submit = 0;

        if let Some(ts) = ts {
            let mut slot = self
                .sq
                .get_sqe()
                .map(|sqe| sqe as *mut SubmissionQueueEntry);
            if slot.is_none() {
                // ring full of unsubmitted entries; push them out and retry
                self.sq.submit()?;
                slot = self
                    .sq
                    .get_sqe()
                    .map(|sqe| sqe as *mut SubmissionQueueEntry);
            }
            let sqe = unsafe { &mut *slot.ok_or(Error::SqFull)? };
            sqe.prep_timeout(ts, wait_nr, TimeoutFlags::empty());
            sqe.set_user_data(TIMEOUT_USER_DATA);
            to_submit = self.sq.flush();
        }

        let cqe = self.get_cqe(to_submit, wait_nr, sigmask)?;
        Ok(unsafe { &*cqe })
    }

    /// The peek-or-enter loop behind every wait: peek first, otherwise enter
    /// with the get-events flag (and the submit count, when composing a
    /// pending submit into the same syscall). Only an interrupt is retried.
    fn get_cqe(
        &mut self,
        mut submit: u32,
        wait_nr: u32,
        sigmask: Option<&libc::sigset_t>,
    ) -> Result<*const CompletionQueueEntry> {
        let sigmask = sigmask.map_or(core::ptr::null(), |s| s as *const libc::sigset_t);

        loop {
            if let Some(cqe) = self.cq.peek()? {
                return Ok(cqe);
            }

            if wait_nr == 0 && submit == 0 {
                // nothing to wait for and nothing to push; entering would
                // block forever
                return Err(Error::Enter(libc::EAGAIN));
            }

            let mut flags = EnterFlags::empty();
            if wait_nr > 0 {
                flags |= EnterFlags::GETEVENTS;
            }
            if submit > 0 {
                self.sq.needs_enter(&mut flags);
            }

            let ret = S::io_uring_enter(self.fd(), submit, wait_nr, flags.bits(), sigmask);
            if ret < 0 {
                if -ret == libc::EINTR {
                    continue;
                }
                return Err(Error::Enter(-ret));
            }
            submit -= ret as u32;
        }
    }
}
