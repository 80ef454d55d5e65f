use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::cqe::CompletionQueueEntry;
use crate::sqe::SubmissionQueueEntry;

/// Fixed mmap offsets selecting which ring region the instance fd exposes.
pub const OFF_SQ_RING: u64 = 0;
pub const OFF_CQ_RING: u64 = 0x8000000;
pub const OFF_SQES: u64 = 0x10000000;

bitflags! {
    /// Flags passed into setup.
    #[derive(Default)]
    pub struct SetupFlags: u32 {
        /// Completions are reaped by polling the device instead of interrupts.
        const IOPOLL = 1 << 0;
        /// The kernel spawns a thread that polls the submission queue.
        const SQPOLL = 1 << 1;
        /// Pin the poll thread to `sq_thread_cpu`. Only sensible with SQPOLL.
        const SQ_AFF = 1 << 2;
        /// Take the completion ring size from `cq_entries` instead of doubling
        /// the submission size.
        const CQSIZE = 1 << 3;
        /// Clamp oversized entry counts to the maximum instead of failing.
        const CLAMP = 1 << 4;
        /// Share the async backend of the instance named by `wq_fd`.
        const ATTACH_WQ = 1 << 5;
    }
}

bitflags! {
    /// Capabilities the kernel reports back through `SetupParameters::features`.
    #[derive(Default)]
    pub struct FeatureFlags: u32 {
        /// One mapping covers both rings.
        const SINGLE_MMAP = 1 << 0;
        /// Completions are never dropped; the overflow counter stays zero.
        const NODROP = 1 << 1;
        /// SQE storage may be reused as soon as submit returns.
        const SUBMIT_STABLE = 1 << 2;
        /// Offset -1 means "current file position" for read/write.
        const RW_CUR_POS = 1 << 3;
        /// Operations run under the credentials of the submitting task by
        /// default, not the ones captured at setup.
        const CUR_PERSONALITY = 1 << 4;
        /// Poll-driven retry for files without native async support.
        const FAST_POLL = 1 << 5;
    }
}

bitflags! {
    /// Flags for the enter syscall.
    #[derive(Default)]
    pub struct EnterFlags: u32 {
        /// Block until `min_complete` completions are available.
        const GETEVENTS = 1 << 0;
        /// Wake the submission-queue poll thread.
        const SQ_WAKEUP = 1 << 1;
    }
}

bitflags! {
    /// Kernel-written state bits in the submission ring.
    #[derive(Default)]
    pub struct SqRingFlags: u32 {
        /// The poll thread went idle; the next submit must enter to wake it.
        const NEED_WAKEUP = 1 << 0;
    }
}

const_assert_eq!(40, core::mem::size_of::<SqRingOffsets>());

/// Byte offsets of the submission-ring fields inside the SQ mapping, written
/// by the kernel at setup. Field addresses must be computed from these, never
/// assumed.
#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct SqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
    pub resv1: u32,
    pub resv2: u64,
}

const_assert_eq!(40, core::mem::size_of::<CqRingOffsets>());

/// Byte offsets of the completion-ring fields inside the CQ mapping.
#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct CqRingOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub resv: [u64; 2],
}

const_assert_eq!(120, core::mem::size_of::<SetupParameters>());

/// The in/out record of the setup syscall. The caller fills the flags and the
/// thread/cq-size hints; the kernel fills the entry counts, features, and the
/// two offset records.
#[repr(C)]
#[derive(Default, Debug)]
pub struct SetupParameters {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: SetupFlags,
    pub sq_thread_cpu: u32,
    pub sq_thread_idle: u32,
    pub features: FeatureFlags,
    pub wq_fd: u32,
    pub resv: [u32; 3],
    pub sq_off: SqRingOffsets,
    pub cq_off: CqRingOffsets,
}

impl SetupParameters {
    pub fn with_flags(flags: SetupFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    #[inline]
    pub fn has_feature(&self, flag: FeatureFlags) -> bool {
        self.features.contains(flag)
    }

    /// Size of the SQ ring mapping: the index array sits last in the region.
    #[inline]
    pub(crate) fn sq_ring_bytes(&self) -> usize {
        self.sq_off.array as usize + self.sq_entries as usize * core::mem::size_of::<u32>()
    }

    /// Size of the CQ ring mapping: the CQE storage sits last in the region.
    #[inline]
    pub(crate) fn cq_ring_bytes(&self) -> usize {
        self.cq_off.cqes as usize
            + self.cq_entries as usize * core::mem::size_of::<CompletionQueueEntry>()
    }

    #[inline]
    pub(crate) fn sqes_bytes(&self) -> usize {
        self.sq_entries as usize * core::mem::size_of::<SubmissionQueueEntry>()
    }
}
