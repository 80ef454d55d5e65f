use core::marker::PhantomData;

use crate::barrier::{load_acquire, read_once, store_release};
use crate::cqe::CompletionQueueEntry;
use crate::error::{Error, Result};
use crate::params::CqRingOffsets;
use crate::TIMEOUT_USER_DATA;

/// User side of the completion ring. The kernel produces through `ktail`; we
/// consume through `khead`. Entries stay valid until the head moves past
/// them, so retirement is always the caller's last step.
#[derive(Debug)]
pub struct CompletionQueue {
    khead: *mut u32,
    ktail: *const u32,
    koverflow: *const u32,
    cqes: *const CompletionQueueEntry,

    ring_mask: u32,
    ring_entries: u32,
}

/// Iterator over the completions visible in one tail snapshot. Yields
/// references into the shared ring; it never moves the head, so the caller
/// advances by however many it actually processed.
pub struct Completions<'a> {
    cqes: *const CompletionQueueEntry,
    mask: u32,
    head: u32,
    tail: u32,
    _ring: PhantomData<&'a CompletionQueue>,
}

impl<'a> Iterator for Completions<'a> {
    type Item = &'a CompletionQueueEntry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.head == self.tail {
            return None;
        }

        let cqe = unsafe { &*self.cqes.add((self.head & self.mask) as usize) };
        self.head = self.head.wrapping_add(1);
        Some(cqe)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.tail.wrapping_sub(self.head) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Completions<'_> {}

impl CompletionQueue {
    /// Resolve the ring field pointers from the offsets the kernel reported
    /// at setup.
    ///
    /// # Safety
    ///
    /// `ring_base` must point at a mapping laid out per `offsets` and outlive
    /// the queue.
    pub(crate) unsafe fn new(ring_base: *mut u8, offsets: &CqRingOffsets) -> Self {
        let at = |off: u32| ring_base.add(off as usize) as *mut u32;

        CompletionQueue {
            khead: at(offsets.head),
            ktail: at(offsets.tail),
            koverflow: at(offsets.overflow),
            cqes: ring_base.add(offsets.cqes as usize) as *const CompletionQueueEntry,
            ring_mask: *at(offsets.ring_mask),
            ring_entries: *at(offsets.ring_entries),
        }
    }

    /// Completions posted but not yet retired. The acquire pairs with the
    /// kernel's tail store, so every counted entry is safe to read.
    pub fn ready(&self) -> u32 {
        unsafe { load_acquire(self.ktail).wrapping_sub(*self.khead) }
    }

    /// Snapshot the tail and iterate everything visible under it.
    pub fn iter(&self) -> Completions<'_> {
        Completions {
            cqes: self.cqes,
            mask: self.ring_mask,
            head: unsafe { *self.khead },
            tail: unsafe { load_acquire(self.ktail) },
            _ring: PhantomData,
        }
    }

    /// Retire `nr` entries. The release ordering keeps every entry read
    /// before the kernel can reuse the slots.
    pub fn advance(&mut self, nr: u32) {
        if nr > 0 {
            unsafe { store_release(self.khead, (*self.khead).wrapping_add(nr)) };
        }
    }

    /// First visible completion, skipping over ring-internal timeout entries.
    /// Those are retired on the spot; a failed one surfaces as the error of
    /// the wait that planted it and never reaches the caller as an entry.
    pub(crate) fn peek(&mut self) -> Result<Option<*const CompletionQueueEntry>> {
        loop {
            let tail = unsafe { load_acquire(self.ktail) };
            let head = unsafe { *self.khead };
            if head == tail {
                return Ok(None);
            }

            let cqe = unsafe { self.cqes.add((head & self.ring_mask) as usize) };
            let (user_data, res) = unsafe { ((*cqe).user_data, (*cqe).res) };

            if user_data == TIMEOUT_USER_DATA {
                self.advance(1);
                if res < 0 {
                    return Err(match -res {
                        libc::ETIME => Error::TimedOut,
                        errno => Error::Enter(errno),
                    });
                }
                continue;
            }

            return Ok(Some(cqe));
        }
    }

    /// Copy up to `out.len()` visible completions without retiring anything.
    pub fn peek_batch(&self, out: &mut [CompletionQueueEntry]) -> usize {
        let mut filled = 0;
        for (slot, cqe) in out.iter_mut().zip(self.iter()) {
            *slot = *cqe;
            filled += 1;
        }
        filled
    }

    /// Completions the kernel had to drop for lack of ring space. Stays zero
    /// on kernels with the no-drop feature.
    pub fn overflow(&self) -> u32 {
        unsafe { read_once(self.koverflow) }
    }

    pub fn ring_entries(&self) -> u32 {
        self.ring_entries
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const ENTRIES: usize = 4;

    #[repr(C)]
    #[derive(Default)]
    struct FakeCqRing {
        head: u32,
        tail: u32,
        ring_mask: u32,
        ring_entries: u32,
        overflow: u32,
        _pad: u32,
        cqes: [CompletionQueueEntry; ENTRIES],
    }

    fn fake_offsets() -> CqRingOffsets {
        CqRingOffsets {
            head: 0,
            tail: 4,
            ring_mask: 8,
            ring_entries: 12,
            overflow: 16,
            cqes: 24,
            ..Default::default()
        }
    }

    fn fake_ring() -> Box<FakeCqRing> {
        Box::new(FakeCqRing {
            ring_mask: ENTRIES as u32 - 1,
            ring_entries: ENTRIES as u32,
            ..Default::default()
        })
    }

    fn queue(ring: &mut FakeCqRing) -> CompletionQueue {
        unsafe { CompletionQueue::new(ring as *mut FakeCqRing as *mut u8, &fake_offsets()) }
    }

    fn post(ring: &mut FakeCqRing, user_data: u64, res: i32) {
        let slot = (ring.tail & ring.ring_mask) as usize;
        ring.cqes[slot] = CompletionQueueEntry {
            user_data,
            res,
            flags: 0,
        };
        ring.tail = ring.tail.wrapping_add(1);
    }

    #[test]
    fn iteration_sees_a_snapshot_and_leaves_the_head_alone() {
        let mut ring = fake_ring();
        post(&mut ring, 1, 0);
        post(&mut ring, 2, 0);
        let mut cq = queue(&mut ring);

        assert_eq!(2, cq.ready());
        let seen: Vec<u64> = cq.iter().map(|cqe| cqe.user_data).collect();
        assert_eq!(vec![1, 2], seen);
        // nothing retired yet
        assert_eq!(2, cq.ready());
        assert_eq!(0, ring.head);

        cq.advance(2);
        assert_eq!(0, cq.ready());
        assert_eq!(2, ring.head);
    }

    #[test]
    fn peek_batch_copies_without_retiring() {
        let mut ring = fake_ring();
        post(&mut ring, 10, 1);
        post(&mut ring, 11, 2);
        post(&mut ring, 12, 3);
        let cq = queue(&mut ring);

        let mut out = [CompletionQueueEntry::default(); 2];
        assert_eq!(2, cq.peek_batch(&mut out));
        assert_eq!(10, out[0].user_data);
        assert_eq!(11, out[1].user_data);
        assert_eq!(3, cq.ready());
    }

    #[test]
    fn peek_skips_a_successful_internal_timeout() {
        let mut ring = fake_ring();
        post(&mut ring, TIMEOUT_USER_DATA, 0);
        post(&mut ring, 0x4242, 0);
        let mut cq = queue(&mut ring);

        let cqe = cq.peek().unwrap().expect("real completion behind sentinel");
        assert_eq!(0x4242, unsafe { (*cqe).user_data });
        // the sentinel was retired on the way
        assert_eq!(1, ring.head);
    }

    #[test]
    fn peek_turns_an_expired_timeout_into_an_error() {
        let mut ring = fake_ring();
        post(&mut ring, TIMEOUT_USER_DATA, -libc::ETIME);
        let mut cq = queue(&mut ring);

        match cq.peek() {
            Err(Error::TimedOut) => {}
            other => panic!("expected TimedOut, got {:?}", other.map(|_| ())),
        }
        // consumed, nothing observable remains
        assert_eq!(0, cq.ready());
        assert_eq!(1, ring.head);
    }

    #[test]
    fn peek_on_an_empty_ring_is_not_an_error() {
        let mut ring = fake_ring();
        let mut cq = queue(&mut ring);
        assert!(cq.peek().unwrap().is_none());
    }

    #[test]
    fn wrapped_indices_resolve_through_the_mask() {
        let mut ring = fake_ring();
        // pretend a long history: head == tail == 6
        ring.head = 6;
        ring.tail = 6;
        post(&mut ring, 77, 0);
        let mut cq = queue(&mut ring);

        let seen: Vec<u64> = cq.iter().map(|cqe| cqe.user_data).collect();
        assert_eq!(vec![77], seen);
        cq.advance(1);
        assert_eq!(7, ring.head);
    }
}
