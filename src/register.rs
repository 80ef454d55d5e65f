//! Registration of long-lived resources against an instance: fixed buffer
//! sets, fixed file tables, event notifiers, credentials, and the capability
//! probe. Everything here is a shape over the register syscall; the
//! registered resources themselves must outlive any submission naming them.

use libc::c_void;
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::probe::{Probe, PROBE_OPS};
use crate::ring::IoUring;
use crate::syscall::SyscallLib;

/// Operation selector of the register syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterOp(pub u32);

impl RegisterOp {
    pub const REGISTER_BUFFERS: Self = Self(0);
    pub const UNREGISTER_BUFFERS: Self = Self(1);
    pub const REGISTER_FILES: Self = Self(2);
    pub const UNREGISTER_FILES: Self = Self(3);
    pub const REGISTER_EVENTFD: Self = Self(4);
    pub const UNREGISTER_EVENTFD: Self = Self(5);
    pub const REGISTER_FILES_UPDATE: Self = Self(6);
    pub const REGISTER_EVENTFD_ASYNC: Self = Self(7);
    pub const REGISTER_PROBE: Self = Self(8);
    pub const REGISTER_PERSONALITY: Self = Self(9);
    pub const UNREGISTER_PERSONALITY: Self = Self(10);
}

const_assert_eq!(16, core::mem::size_of::<FilesUpdate>());

/// Argument record of the files-update operation.
#[repr(C)]
struct FilesUpdate {
    offset: u32,
    resv: u32,
    fds: u64,
}

impl<S: SyscallLib> IoUring<S> {
    fn register(&self, op: RegisterOp, arg: *const c_void, nr_args: u32) -> Result<i32> {
        let ret = S::io_uring_register(self.fd(), op.0, arg, nr_args);
        if ret < 0 {
            return Err(Error::Register(-ret));
        }
        Ok(ret)
    }

    /// Pin a set of buffers for fixed-buffer reads and writes. Submissions
    /// name them by index into this slice.
    pub fn register_buffers(&self, iovecs: &[libc::iovec]) -> Result<()> {
        self.register(
            RegisterOp::REGISTER_BUFFERS,
            iovecs.as_ptr() as *const c_void,
            iovecs.len() as u32,
        )?;
        Ok(())
    }

    pub fn unregister_buffers(&self) -> Result<()> {
        self.register(RegisterOp::UNREGISTER_BUFFERS, core::ptr::null(), 0)?;
        Ok(())
    }

    /// Install a fixed file table. Submissions with the fixed-file flag use
    /// indices into this table instead of descriptors.
    pub fn register_files(&self, fds: &[i32]) -> Result<()> {
        self.register(
            RegisterOp::REGISTER_FILES,
            fds.as_ptr() as *const c_void,
            fds.len() as u32,
        )?;
        Ok(())
    }

    pub fn unregister_files(&self) -> Result<()> {
        self.register(RegisterOp::UNREGISTER_FILES, core::ptr::null(), 0)?;
        Ok(())
    }

    /// Replace a span of the fixed file table starting at `offset`. A -1
    /// descriptor clears its slot. Returns how many slots were updated.
    pub fn register_files_update(&self, offset: u32, fds: &[i32]) -> Result<u32> {
        let update = FilesUpdate {
            offset,
            resv: 0,
            fds: fds.as_ptr() as u64,
        };
        let updated = self.register(
            RegisterOp::REGISTER_FILES_UPDATE,
            &update as *const FilesUpdate as *const c_void,
            fds.len() as u32,
        )?;
        Ok(updated as u32)
    }

    /// Signal the given eventfd whenever a completion is posted.
    pub fn register_eventfd(&self, fd: i32) -> Result<()> {
        self.register(
            RegisterOp::REGISTER_EVENTFD,
            &fd as *const i32 as *const c_void,
            1,
        )?;
        Ok(())
    }

    /// As `register_eventfd`, but only for completions that went through
    /// async punting; inline completions stay silent.
    pub fn register_eventfd_async(&self, fd: i32) -> Result<()> {
        self.register(
            RegisterOp::REGISTER_EVENTFD_ASYNC,
            &fd as *const i32 as *const c_void,
            1,
        )?;
        Ok(())
    }

    pub fn unregister_eventfd(&self) -> Result<()> {
        self.register(RegisterOp::UNREGISTER_EVENTFD, core::ptr::null(), 0)?;
        Ok(())
    }

    /// Snapshot the calling task's credentials; submissions can assume them
    /// through the returned id.
    pub fn register_personality(&self) -> Result<u16> {
        let id = self.register(RegisterOp::REGISTER_PERSONALITY, core::ptr::null(), 0)?;
        Ok(id as u16)
    }

    pub fn unregister_personality(&self, id: u16) -> Result<()> {
        // the id travels in the argument-count slot
        self.register(
            RegisterOp::UNREGISTER_PERSONALITY,
            core::ptr::null(),
            id as u32,
        )?;
        Ok(())
    }

    /// Fill the kernel's supported-opcode table.
    pub fn register_probe(&self, probe: &mut Probe) -> Result<()> {
        self.register(
            RegisterOp::REGISTER_PROBE,
            probe as *mut Probe as *const c_void,
            PROBE_OPS as u32,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use libc::{c_int, c_uint};
    use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

    use super::*;
    use crate::params::SetupParameters;
    use crate::test_support::fake_uring;

    static UPDATE_NR: AtomicU32 = AtomicU32::new(u32::MAX);
    static UPDATE_OFFSET: AtomicU64 = AtomicU64::new(u64::MAX);

    struct UpdateRecorder;

    impl SyscallLib for UpdateRecorder {
        fn io_uring_setup(_: u32, _: *mut SetupParameters) -> c_int {
            3
        }
        fn io_uring_enter(
            _: c_int,
            to_submit: c_uint,
            _: c_uint,
            _: c_uint,
            _: *const libc::sigset_t,
        ) -> c_int {
            to_submit as c_int
        }
        fn io_uring_register(_: c_int, opcode: c_uint, arg: *const c_void, nr_args: c_uint) -> c_int {
            assert_eq!(RegisterOp::REGISTER_FILES_UPDATE.0, opcode);
            let update = unsafe { &*(arg as *const FilesUpdate) };
            UPDATE_NR.store(nr_args, Ordering::SeqCst);
            UPDATE_OFFSET.store(update.offset as u64, Ordering::SeqCst);
            nr_args as c_int
        }
    }

    #[test]
    fn files_update_carries_offset_and_count() {
        let (ring, _) = fake_uring::<UpdateRecorder>();
        let new_fds = [8, 9];

        let updated = ring.register_files_update(2, &new_fds).unwrap();
        assert_eq!(2, updated);
        assert_eq!(2, UPDATE_NR.load(Ordering::SeqCst));
        assert_eq!(2, UPDATE_OFFSET.load(Ordering::SeqCst));
    }

    static PERSONALITY_OP: AtomicU32 = AtomicU32::new(u32::MAX);
    static PERSONALITY_NR: AtomicU32 = AtomicU32::new(u32::MAX);
    static PERSONALITY_ARG: AtomicUsize = AtomicUsize::new(usize::MAX);

    struct PersonalityRecorder;

    impl SyscallLib for PersonalityRecorder {
        fn io_uring_setup(_: u32, _: *mut SetupParameters) -> c_int {
            3
        }
        fn io_uring_enter(
            _: c_int,
            to_submit: c_uint,
            _: c_uint,
            _: c_uint,
            _: *const libc::sigset_t,
        ) -> c_int {
            to_submit as c_int
        }
        fn io_uring_register(_: c_int, opcode: c_uint, arg: *const c_void, nr_args: c_uint) -> c_int {
            PERSONALITY_OP.store(opcode, Ordering::SeqCst);
            PERSONALITY_NR.store(nr_args, Ordering::SeqCst);
            PERSONALITY_ARG.store(arg as usize, Ordering::SeqCst);
            if opcode == RegisterOp::REGISTER_PERSONALITY.0 {
                return 7;
            }
            0
        }
    }

    #[test]
    fn personality_round_trip_uses_the_count_slot_for_the_id() {
        let (ring, _) = fake_uring::<PersonalityRecorder>();

        let id = ring.register_personality().unwrap();
        assert_eq!(7, id);

        ring.unregister_personality(id).unwrap();
        assert_eq!(
            RegisterOp::UNREGISTER_PERSONALITY.0,
            PERSONALITY_OP.load(Ordering::SeqCst)
        );
        assert_eq!(7, PERSONALITY_NR.load(Ordering::SeqCst));
        assert_eq!(0, PERSONALITY_ARG.load(Ordering::SeqCst));
    }

    struct RefusingKernel;

    impl SyscallLib for RefusingKernel {
        fn io_uring_setup(_: u32, _: *mut SetupParameters) -> c_int {
            3
        }
        fn io_uring_enter(
            _: c_int,
            _: c_uint,
            _: c_uint,
            _: c_uint,
            _: *const libc::sigset_t,
        ) -> c_int {
            0
        }
        fn io_uring_register(_: c_int, _: c_uint, _: *const c_void, _: c_uint) -> c_int {
            -libc::EINVAL
        }
    }

    #[test]
    fn register_failure_surfaces_the_errno() {
        let (ring, _) = fake_uring::<RefusingKernel>();
        match ring.register_files(&[1, 2, 3]) {
            Err(Error::Register(errno)) => assert_eq!(libc::EINVAL, errno),
            other => panic!("expected Register error, got {:?}", other),
        }
    }
}
