use core::marker::PhantomData;

use crate::barrier::{load_acquire, read_once, store_release};
use crate::error::{Error, Result};
use crate::params::{EnterFlags, SetupFlags, SqRingFlags, SqRingOffsets};
use crate::sqe::SubmissionQueueEntry;
use crate::syscall::SyscallLib;

/// User side of the submission ring.
///
/// The kernel consumes through `khead`; we produce through `ktail`. Between a
/// reservation and its publication an entry is tracked only by the private
/// `sqe_head`/`sqe_tail` cursors, which the kernel never sees.
#[derive(Debug)]
pub struct SubmissionQueue<S: SyscallLib> {
    khead: *const u32,
    ktail: *mut u32,
    kflags: *const u32,
    kdropped: *const u32,
    array: *mut u32,
    sqes: *mut SubmissionQueueEntry,

    ring_mask: u32,
    ring_entries: u32,

    // reserved-but-unpublished range is [sqe_head, sqe_tail)
    sqe_head: u32,
    sqe_tail: u32,

    ring_fd: i32,
    setup_flags: SetupFlags,

    _syscalls: PhantomData<S>,
}

impl<S: SyscallLib> SubmissionQueue<S> {
    /// Resolve the ring field pointers from the offsets the kernel reported
    /// at setup.
    ///
    /// # Safety
    ///
    /// `ring_base` must point at a mapping laid out per `offsets`, and `sqes`
    /// at storage for the full entry array; both must outlive the queue.
    pub(crate) unsafe fn new(
        ring_fd: i32,
        setup_flags: SetupFlags,
        ring_base: *mut u8,
        offsets: &SqRingOffsets,
        sqes: *mut SubmissionQueueEntry,
    ) -> Self {
        let at = |off: u32| ring_base.add(off as usize) as *mut u32;

        SubmissionQueue {
            khead: at(offsets.head),
            ktail: at(offsets.tail),
            kflags: at(offsets.flags),
            kdropped: at(offsets.dropped),
            array: at(offsets.array),
            sqes,
            // both are constant for the life of the instance
            ring_mask: *at(offsets.ring_mask),
            ring_entries: *at(offsets.ring_entries),
            sqe_head: 0,
            sqe_tail: 0,
            ring_fd,
            setup_flags,
            _syscalls: PhantomData,
        }
    }

    /// Reserve the next free entry, or `None` if every slot is already
    /// reserved and unsubmitted. The entry is not visible to the kernel until
    /// the next submit.
    pub fn get_sqe(&mut self) -> Option<&mut SubmissionQueueEntry> {
        let next = self.sqe_tail.wrapping_add(1);
        if next.wrapping_sub(self.sqe_head) > self.ring_entries {
            return None;
        }

        let index = (self.sqe_tail & self.ring_mask) as usize;
        self.sqe_tail = next;
        Some(unsafe { &mut *self.sqes.add(index) })
    }

    /// Publish every reserved entry: point the index array at them, then move
    /// the kernel-visible tail with release semantics so the entry contents
    /// are ordered before the tail. Returns the number of entries the kernel
    /// has not yet consumed.
    pub(crate) fn flush(&mut self) -> u32 {
        let mask = self.ring_mask;

        if self.sqe_head != self.sqe_tail {
            let to_submit = self.sqe_tail.wrapping_sub(self.sqe_head);
            let mut ktail = unsafe { *self.ktail };

            for _ in 0..to_submit {
                unsafe { *self.array.add((ktail & mask) as usize) = self.sqe_head & mask };
                ktail = ktail.wrapping_add(1);
                self.sqe_head = self.sqe_head.wrapping_add(1);
            }

            unsafe { store_release(self.ktail, ktail) };
        }

        unsafe { (*self.ktail).wrapping_sub(read_once(self.khead)) }
    }

    /// Whether submitting requires the enter syscall. Without kernel-side SQ
    /// polling it always does; with it, only when the poll thread has gone
    /// idle, in which case the wakeup flag is added for the caller.
    pub(crate) fn needs_enter(&self, flags: &mut EnterFlags) -> bool {
        if !self.setup_flags.contains(SetupFlags::SQPOLL) {
            return true;
        }

        if unsafe { load_acquire(self.kflags) } & SqRingFlags::NEED_WAKEUP.bits() != 0 {
            *flags |= EnterFlags::SQ_WAKEUP;
            return true;
        }

        false
    }

    pub fn submit(&mut self) -> Result<u32> {
        self.submit_and_wait(0)
    }

    /// Publish and, if needed, enter. The return value is what the kernel
    /// consumed, which may be less than what was flushed; that is not an
    /// error.
    pub fn submit_and_wait(&mut self, wait_nr: u32) -> Result<u32> {
        let submitted = self.flush();

        let mut flags = EnterFlags::empty();
        if self.needs_enter(&mut flags) || wait_nr > 0 {
            if wait_nr > 0 {
                flags |= EnterFlags::GETEVENTS;
            }

            let ret = S::io_uring_enter(
                self.ring_fd,
                submitted,
                wait_nr,
                flags.bits(),
                core::ptr::null(),
            );
            if ret < 0 {
                return Err(Error::Enter(-ret));
            }
            Ok(ret as u32)
        } else {
            Ok(submitted)
        }
    }

    /// Entries handed to the kernel but not yet consumed by it. Uses the real
    /// kernel head so a short submit does not desynchronize the count.
    pub fn sq_ready(&self) -> u32 {
        self.sqe_tail.wrapping_sub(unsafe { read_once(self.khead) })
    }

    pub fn sq_space_left(&self) -> u32 {
        self.ring_entries - self.sq_ready()
    }

    /// Submissions the kernel rejected for malformed ring indices.
    pub fn dropped(&self) -> u32 {
        unsafe { read_once(self.kdropped) }
    }

    pub fn ring_entries(&self) -> u32 {
        self.ring_entries
    }
}
