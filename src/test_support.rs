//! Hand-built instances over anonymous memory, for driving the queue logic
//! with mocked syscalls.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use crate::completion_queue::CompletionQueue;
use crate::cqe::CompletionQueueEntry;
use crate::mmap::MappedMemory;
use crate::params::{CqRingOffsets, SetupParameters, SqRingOffsets};
use crate::ring::IoUring;
use crate::submission_queue::SubmissionQueue;
use crate::syscall::SyscallLib;

pub(crate) const ENTRIES: u32 = 4;

const OFF_TAIL: usize = 4;
const OFF_MASK: usize = 8;
const OFF_ENTRIES: usize = 12;
const OFF_SQ_ARRAY: usize = 24;
const OFF_CQES: usize = 24;

fn sq_offsets() -> SqRingOffsets {
    SqRingOffsets {
        head: 0,
        tail: 4,
        ring_mask: 8,
        ring_entries: 12,
        flags: 16,
        dropped: 20,
        array: OFF_SQ_ARRAY as u32,
        ..Default::default()
    }
}

fn cq_offsets() -> CqRingOffsets {
    CqRingOffsets {
        head: 0,
        tail: 4,
        ring_mask: 8,
        ring_entries: 12,
        overflow: 16,
        cqes: OFF_CQES as u32,
        ..Default::default()
    }
}

/// Build an instance over anonymous memory; the mock syscalls stand in for
/// the kernel. The second value is the CQ region base address, for mocks
/// that post completions.
pub(crate) fn fake_uring<S: SyscallLib>() -> (IoUring<S>, usize) {
    let sq_mem = MappedMemory::anonymous(OFF_SQ_ARRAY + ENTRIES as usize * 4).unwrap();
    let cq_mem = MappedMemory::anonymous(OFF_CQES + ENTRIES as usize * 16).unwrap();
    let sqe_mem = MappedMemory::anonymous(ENTRIES as usize * 64).unwrap();

    unsafe {
        *sq_mem.offset::<u32>(OFF_MASK) = ENTRIES - 1;
        *sq_mem.offset::<u32>(OFF_ENTRIES) = ENTRIES;
        *cq_mem.offset::<u32>(OFF_MASK) = ENTRIES - 1;
        *cq_mem.offset::<u32>(OFF_ENTRIES) = ENTRIES;
    }

    let params = SetupParameters::default();
    let fd = unsafe {
        OwnedFd::from_raw_fd(libc::memfd_create(
            b"uring-test\0".as_ptr() as *const libc::c_char,
            0,
        ))
    };

    let sq = unsafe {
        SubmissionQueue::new(
            fd.as_raw_fd(),
            params.flags,
            sq_mem.offset(0),
            &sq_offsets(),
            sqe_mem.offset(0),
        )
    };
    let cq = unsafe { CompletionQueue::new(cq_mem.offset(0), &cq_offsets()) };
    let cq_base = cq_mem.offset::<u8>(0) as usize;

    (
        IoUring::from_parts(fd, &params, sq, cq, sq_mem, Some(cq_mem), sqe_mem),
        cq_base,
    )
}

/// Append a completion to a fake CQ region, the way the kernel would.
pub(crate) unsafe fn post_cqe(cq_base: usize, user_data: u64, res: i32) {
    let base = cq_base as *mut u8;
    let tail_ptr = base.add(OFF_TAIL) as *mut u32;
    let mask = *(base.add(OFF_MASK) as *const u32);
    let slot = (*tail_ptr & mask) as usize;
    let cqe = (base.add(OFF_CQES) as *mut CompletionQueueEntry).add(slot);
    (*cqe).user_data = user_data;
    (*cqe).res = res;
    (*cqe).flags = 0;
    *tail_ptr = (*tail_ptr).wrapping_add(1);
}
