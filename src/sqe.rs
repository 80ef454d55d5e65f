use core::ffi::CStr;

use bitflags::bitflags;
use libc::c_void;
use static_assertions::const_assert_eq;

/// Operation selector of a submission entry. An open set rather than an enum:
/// kernels keep appending opcodes, and the probe interface reports support for
/// indices this build has never heard of.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const NOP: Self = Self(0);
    pub const READV: Self = Self(1);
    pub const WRITEV: Self = Self(2);
    pub const FSYNC: Self = Self(3);
    pub const READ_FIXED: Self = Self(4);
    pub const WRITE_FIXED: Self = Self(5);
    pub const POLL_ADD: Self = Self(6);
    pub const POLL_REMOVE: Self = Self(7);
    pub const SYNC_FILE_RANGE: Self = Self(8);
    pub const SENDMSG: Self = Self(9);
    pub const RECVMSG: Self = Self(10);
    pub const TIMEOUT: Self = Self(11);
    pub const TIMEOUT_REMOVE: Self = Self(12);
    pub const ACCEPT: Self = Self(13);
    pub const ASYNC_CANCEL: Self = Self(14);
    pub const LINK_TIMEOUT: Self = Self(15);
    pub const CONNECT: Self = Self(16);
    pub const FALLOCATE: Self = Self(17);
    pub const OPENAT: Self = Self(18);
    pub const CLOSE: Self = Self(19);
    pub const FILES_UPDATE: Self = Self(20);
    pub const STATX: Self = Self(21);
    pub const READ: Self = Self(22);
    pub const WRITE: Self = Self(23);
    pub const FADVISE: Self = Self(24);
    pub const MADVISE: Self = Self(25);
    pub const SEND: Self = Self(26);
    pub const RECV: Self = Self(27);
    pub const OPENAT2: Self = Self(28);
    pub const EPOLL_CTL: Self = Self(29);
    pub const SPLICE: Self = Self(30);
    pub const PROVIDE_BUFFERS: Self = Self(31);
    pub const REMOVE_BUFFERS: Self = Self(32);

    /// One past the highest opcode this build prepares.
    pub const LAST: Self = Self(33);
}

bitflags! {
    /// Per-entry behavior flags.
    #[derive(Default)]
    pub struct SqeFlags: u8 {
        /// `fd` is an index into the registered file table.
        const FIXED_FILE = 1 << 0;
        /// Issue only after all prior entries have completed.
        const IO_DRAIN = 1 << 1;
        /// The next entry depends on this one.
        const IO_LINK = 1 << 2;
        /// As IO_LINK, but the chain survives this entry failing.
        const IO_HARDLINK = 1 << 3;
        /// Always punt to async context instead of trying inline first.
        const ASYNC = 1 << 4;
        /// Pick a buffer from the group named in `buf_group`.
        const BUFFER_SELECT = 1 << 5;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct FsyncFlags: u32 {
        /// Sync data only, like fdatasync.
        const DATASYNC = 1 << 0;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct TimeoutFlags: u32 {
        /// The timespec is an absolute clock value, not a relative delay.
        const ABS = 1 << 0;
    }
}

bitflags! {
    #[derive(Default)]
    pub struct SpliceFlags: u32 {
        /// `splice_fd_in` is an index into the registered file table.
        const FD_IN_FIXED = 1 << 31;
    }
}

/// Timespec in the layout the kernel expects, 64-bit fields on every ABI.
#[repr(C)]
#[derive(Default, Debug, Clone, Copy)]
pub struct KernelTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

impl KernelTimespec {
    pub fn from_millis(ms: u64) -> Self {
        Self {
            tv_sec: (ms / 1000) as i64,
            tv_nsec: ((ms % 1000) * 1_000_000) as i64,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union OffsetOrAddr2 {
    pub off: u64,
    pub addr2: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union AddrOrSpliceOff {
    pub addr: u64,
    pub splice_off_in: u64,
}

/// The per-opcode flag word. Exactly one member is meaningful for any given
/// opcode; the uniform prep zeroes the whole cell.
#[repr(C)]
#[derive(Clone, Copy)]
pub union OpFlags {
    pub rw_flags: i32,
    pub fsync_flags: u32,
    pub poll_events: u16,
    pub sync_range_flags: u32,
    pub msg_flags: u32,
    pub timeout_flags: u32,
    pub accept_flags: u32,
    pub cancel_flags: u32,
    pub open_flags: u32,
    pub statx_flags: u32,
    pub fadvise_advice: u32,
    pub splice_flags: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union BufIndexOrGroup {
    /// Registered buffer to use for fixed read/write.
    pub buf_index: u16,
    /// Provided-buffer group for buffer-select and provide/remove.
    pub buf_group: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct SqeExtraFields {
    pub buf: BufIndexOrGroup,
    /// Registered credential id to issue the operation under; zero means the
    /// instance default.
    pub personality: u16,
    pub splice_fd_in: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union SqeExtra {
    pub fields: SqeExtraFields,
    pub pad2: [u64; 3],
}

const_assert_eq!(64, core::mem::size_of::<SubmissionQueueEntry>());

/// A single submission record. Storage lives in the mapped SQE array; the
/// kernel reads it once the slot is published through the ring tail.
#[repr(C)]
pub struct SubmissionQueueEntry {
    pub opcode: Opcode,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: OffsetOrAddr2,
    pub addr: AddrOrSpliceOff,
    pub len: u32,
    pub op_flags: OpFlags,
    pub user_data: u64,
    pub extra: SqeExtra,
}

impl SubmissionQueueEntry {
    /// The uniform skeleton every prep goes through: common fields set,
    /// every per-opcode cell cleared.
    #[inline]
    fn prep_rw(&mut self, op: Opcode, fd: i32, addr: u64, len: u32, offset: u64) {
        self.opcode = op;
        self.flags = 0;
        self.ioprio = 0;
        self.fd = fd;
        self.off = OffsetOrAddr2 { off: offset };
        self.addr = AddrOrSpliceOff { addr };
        self.len = len;
        self.op_flags = OpFlags { rw_flags: 0 };
        self.user_data = 0;
        self.extra = SqeExtra { pad2: [0; 3] };
    }

    /// Opaque token handed back verbatim in the matching completion. The
    /// value `u64::MAX` is reserved for ring-internal timeouts.
    #[inline]
    pub fn set_user_data(&mut self, user_data: u64) {
        self.user_data = user_data;
    }

    #[inline]
    pub fn set_flags(&mut self, flags: SqeFlags) {
        self.flags = flags.bits();
    }

    /// Issue under a registered credential identity.
    #[inline]
    pub fn set_personality(&mut self, id: u16) {
        self.extra = SqeExtra {
            fields: SqeExtraFields {
                buf: unsafe { self.extra.fields.buf },
                personality: id,
                splice_fd_in: unsafe { self.extra.fields.splice_fd_in },
            },
        };
    }

    /// Name the provided-buffer group for a BUFFER_SELECT submission.
    #[inline]
    pub fn set_buf_group(&mut self, bgid: u16) {
        self.extra = SqeExtra {
            fields: SqeExtraFields {
                buf: BufIndexOrGroup { buf_group: bgid },
                personality: unsafe { self.extra.fields.personality },
                splice_fd_in: unsafe { self.extra.fields.splice_fd_in },
            },
        };
    }

    pub fn prep_nop(&mut self) {
        self.prep_rw(Opcode::NOP, -1, 0, 0, 0);
    }

    pub fn prep_readv(&mut self, fd: i32, iovecs: &[libc::iovec], offset: u64) {
        self.prep_rw(
            Opcode::READV,
            fd,
            iovecs.as_ptr() as u64,
            iovecs.len() as u32,
            offset,
        );
    }

    pub fn prep_writev(&mut self, fd: i32, iovecs: &[libc::iovec], offset: u64) {
        self.prep_rw(
            Opcode::WRITEV,
            fd,
            iovecs.as_ptr() as u64,
            iovecs.len() as u32,
            offset,
        );
    }

    pub fn prep_read(&mut self, fd: i32, buf: &mut [u8], offset: u64) {
        self.prep_rw(
            Opcode::READ,
            fd,
            buf.as_mut_ptr() as u64,
            buf.len() as u32,
            offset,
        );
    }

    pub fn prep_write(&mut self, fd: i32, buf: &[u8], offset: u64) {
        self.prep_rw(
            Opcode::WRITE,
            fd,
            buf.as_ptr() as u64,
            buf.len() as u32,
            offset,
        );
    }

    pub fn prep_read_fixed(&mut self, fd: i32, buf: &mut [u8], offset: u64, buf_index: u16) {
        self.prep_rw(
            Opcode::READ_FIXED,
            fd,
            buf.as_mut_ptr() as u64,
            buf.len() as u32,
            offset,
        );
        self.extra = SqeExtra {
            fields: SqeExtraFields {
                buf: BufIndexOrGroup { buf_index },
                personality: 0,
                splice_fd_in: 0,
            },
        };
    }

    pub fn prep_write_fixed(&mut self, fd: i32, buf: &[u8], offset: u64, buf_index: u16) {
        self.prep_rw(
            Opcode::WRITE_FIXED,
            fd,
            buf.as_ptr() as u64,
            buf.len() as u32,
            offset,
        );
        self.extra = SqeExtra {
            fields: SqeExtraFields {
                buf: BufIndexOrGroup { buf_index },
                personality: 0,
                splice_fd_in: 0,
            },
        };
    }

    pub fn prep_fsync(&mut self, fd: i32, flags: FsyncFlags) {
        self.prep_rw(Opcode::FSYNC, fd, 0, 0, 0);
        self.op_flags = OpFlags {
            fsync_flags: flags.bits(),
        };
    }

    pub fn prep_poll_add(&mut self, fd: i32, poll_mask: u16) {
        self.prep_rw(Opcode::POLL_ADD, fd, 0, 0, 0);
        self.op_flags = OpFlags {
            poll_events: poll_mask,
        };
    }

    /// Cancel a pending poll; `user_data` names the poll entry to remove.
    pub fn prep_poll_remove(&mut self, user_data: u64) {
        self.prep_rw(Opcode::POLL_REMOVE, -1, user_data, 0, 0);
    }

    /// The timespec must stay alive until the timeout completes. `count`
    /// completes the timeout early once that many other completions arrive.
    pub fn prep_timeout(&mut self, ts: &KernelTimespec, count: u32, flags: TimeoutFlags) {
        self.prep_rw(Opcode::TIMEOUT, -1, ts as *const _ as u64, 1, count as u64);
        self.op_flags = OpFlags {
            timeout_flags: flags.bits(),
        };
    }

    pub fn prep_timeout_remove(&mut self, user_data: u64, flags: TimeoutFlags) {
        self.prep_rw(Opcode::TIMEOUT_REMOVE, -1, user_data, 0, 0);
        self.op_flags = OpFlags {
            timeout_flags: flags.bits(),
        };
    }

    /// Arms a timeout against the previous, linked entry.
    pub fn prep_link_timeout(&mut self, ts: &KernelTimespec, flags: TimeoutFlags) {
        self.prep_rw(Opcode::LINK_TIMEOUT, -1, ts as *const _ as u64, 1, 0);
        self.op_flags = OpFlags {
            timeout_flags: flags.bits(),
        };
    }

    pub fn prep_accept(
        &mut self,
        fd: i32,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: u32,
    ) {
        self.prep_rw(Opcode::ACCEPT, fd, addr as u64, 0, addrlen as u64);
        self.op_flags = OpFlags {
            accept_flags: flags,
        };
    }

    pub fn prep_connect(&mut self, fd: i32, addr: *const libc::sockaddr, addrlen: libc::socklen_t) {
        self.prep_rw(Opcode::CONNECT, fd, addr as u64, 0, addrlen as u64);
    }

    pub fn prep_sendmsg(&mut self, fd: i32, msg: *const libc::msghdr, flags: u32) {
        self.prep_rw(Opcode::SENDMSG, fd, msg as u64, 1, 0);
        self.op_flags = OpFlags { msg_flags: flags };
    }

    pub fn prep_recvmsg(&mut self, fd: i32, msg: *mut libc::msghdr, flags: u32) {
        self.prep_rw(Opcode::RECVMSG, fd, msg as u64, 1, 0);
        self.op_flags = OpFlags { msg_flags: flags };
    }

    pub fn prep_send(&mut self, sockfd: i32, buf: &[u8], flags: u32) {
        self.prep_rw(Opcode::SEND, sockfd, buf.as_ptr() as u64, buf.len() as u32, 0);
        self.op_flags = OpFlags { msg_flags: flags };
    }

    pub fn prep_recv(&mut self, sockfd: i32, buf: &mut [u8], flags: u32) {
        self.prep_rw(
            Opcode::RECV,
            sockfd,
            buf.as_mut_ptr() as u64,
            buf.len() as u32,
            0,
        );
        self.op_flags = OpFlags { msg_flags: flags };
    }

    /// Cancel an in-flight operation; `user_data` names the target.
    pub fn prep_cancel(&mut self, user_data: u64, flags: u32) {
        self.prep_rw(Opcode::ASYNC_CANCEL, -1, user_data, 0, 0);
        self.op_flags = OpFlags {
            cancel_flags: flags,
        };
    }

    /// In-ring counterpart of the files-update registration.
    pub fn prep_files_update(&mut self, fds: &[i32], offset: u32) {
        self.prep_rw(
            Opcode::FILES_UPDATE,
            -1,
            fds.as_ptr() as u64,
            fds.len() as u32,
            offset as u64,
        );
    }

    pub fn prep_fallocate(&mut self, fd: i32, mode: i32, offset: u64, len: u64) {
        self.prep_rw(Opcode::FALLOCATE, fd, len, mode as u32, offset);
    }

    pub fn prep_openat(&mut self, dfd: i32, path: &CStr, flags: i32, mode: u32) {
        self.prep_rw(Opcode::OPENAT, dfd, path.as_ptr() as u64, mode, 0);
        self.op_flags = OpFlags {
            open_flags: flags as u32,
        };
    }

    pub fn prep_openat2(&mut self, dfd: i32, path: &CStr, how: &libc::open_how) {
        self.prep_rw(
            Opcode::OPENAT2,
            dfd,
            path.as_ptr() as u64,
            core::mem::size_of::<libc::open_how>() as u32,
            how as *const _ as u64,
        );
    }

    pub fn prep_close(&mut self, fd: i32) {
        self.prep_rw(Opcode::CLOSE, fd, 0, 0, 0);
    }

    pub fn prep_statx(
        &mut self,
        dfd: i32,
        path: &CStr,
        flags: i32,
        mask: u32,
        statxbuf: *mut libc::statx,
    ) {
        self.prep_rw(Opcode::STATX, dfd, path.as_ptr() as u64, mask, statxbuf as u64);
        self.op_flags = OpFlags {
            statx_flags: flags as u32,
        };
    }

    pub fn prep_fadvise(&mut self, fd: i32, offset: u64, len: u32, advice: i32) {
        self.prep_rw(Opcode::FADVISE, fd, 0, len, offset);
        self.op_flags = OpFlags {
            fadvise_advice: advice as u32,
        };
    }

    pub fn prep_madvise(&mut self, addr: *mut c_void, length: u32, advice: i32) {
        self.prep_rw(Opcode::MADVISE, -1, addr as u64, length, 0);
        self.op_flags = OpFlags {
            fadvise_advice: advice as u32,
        };
    }

    pub fn prep_splice(
        &mut self,
        fd_in: i32,
        off_in: i64,
        fd_out: i32,
        off_out: i64,
        nbytes: u32,
        flags: SpliceFlags,
    ) {
        self.prep_rw(Opcode::SPLICE, fd_out, 0, nbytes, off_out as u64);
        self.addr = AddrOrSpliceOff {
            splice_off_in: off_in as u64,
        };
        self.op_flags = OpFlags {
            splice_flags: flags.bits(),
        };
        self.extra = SqeExtra {
            fields: SqeExtraFields {
                buf: BufIndexOrGroup { buf_index: 0 },
                personality: 0,
                splice_fd_in: fd_in,
            },
        };
    }

    pub fn prep_epoll_ctl(&mut self, epfd: i32, fd: i32, op: i32, ev: *mut libc::epoll_event) {
        self.prep_rw(Opcode::EPOLL_CTL, epfd, ev as u64, op as u32, fd as u64);
    }

    /// Hand `nr` buffers of `len` bytes starting at `addr` to group `bgid`,
    /// ids starting at `bid`.
    pub fn prep_provide_buffers(
        &mut self,
        addr: *mut c_void,
        len: u32,
        nr: i32,
        bgid: u16,
        bid: u32,
    ) {
        self.prep_rw(Opcode::PROVIDE_BUFFERS, nr, addr as u64, len, bid as u64);
        self.extra = SqeExtra {
            fields: SqeExtraFields {
                buf: BufIndexOrGroup { buf_group: bgid },
                personality: 0,
                splice_fd_in: 0,
            },
        };
    }

    pub fn prep_remove_buffers(&mut self, nr: i32, bgid: u16) {
        self.prep_rw(Opcode::REMOVE_BUFFERS, nr, 0, 0, 0);
        self.extra = SqeExtra {
            fields: SqeExtraFields {
                buf: BufIndexOrGroup { buf_group: bgid },
                personality: 0,
                splice_fd_in: 0,
            },
        };
    }
}

#[cfg(test)]
mod test {
    use byteorder::{ByteOrder, NativeEndian};

    use super::*;

    fn zeroed_sqe() -> SubmissionQueueEntry {
        unsafe { core::mem::zeroed() }
    }

    fn raw(sqe: &SubmissionQueueEntry) -> &[u8] {
        unsafe { core::slice::from_raw_parts(sqe as *const _ as *const u8, 64) }
    }

    #[test]
    fn nop_touches_only_the_opcode_and_fd() {
        let mut sqe = zeroed_sqe();
        sqe.user_data = 0xdead;
        sqe.prep_nop();

        let bytes = raw(&sqe);
        assert_eq!(Opcode::NOP.0, bytes[0]);
        assert_eq!(-1, NativeEndian::read_i32(&bytes[4..8]));
        // the skeleton must have cleared the stale token
        assert_eq!(0, NativeEndian::read_u64(&bytes[32..40]));
    }

    #[test]
    fn readv_payload_lands_in_the_common_fields() {
        let data = [0u8; 16];
        let iov = [libc::iovec {
            iov_base: data.as_ptr() as *mut c_void,
            iov_len: data.len(),
        }];

        let mut sqe = zeroed_sqe();
        sqe.prep_readv(4, &iov, 0x1000);
        sqe.set_user_data(0x4242);

        let bytes = raw(&sqe);
        assert_eq!(Opcode::READV.0, bytes[0]);
        assert_eq!(4, NativeEndian::read_i32(&bytes[4..8]));
        assert_eq!(0x1000, NativeEndian::read_u64(&bytes[8..16]));
        assert_eq!(iov.as_ptr() as u64, NativeEndian::read_u64(&bytes[16..24]));
        assert_eq!(1, NativeEndian::read_u32(&bytes[24..28]));
        assert_eq!(0x4242, NativeEndian::read_u64(&bytes[32..40]));
    }

    #[test]
    fn fixed_write_records_the_buffer_index() {
        let data = [1u8; 8];
        let mut sqe = zeroed_sqe();
        sqe.prep_write_fixed(7, &data, 64, 3);

        let bytes = raw(&sqe);
        assert_eq!(Opcode::WRITE_FIXED.0, bytes[0]);
        assert_eq!(3, NativeEndian::read_u16(&bytes[40..42]));
    }

    #[test]
    fn timeout_carries_timespec_count_and_flags() {
        let ts = KernelTimespec::from_millis(1500);
        assert_eq!(1, ts.tv_sec);
        assert_eq!(500_000_000, ts.tv_nsec);

        let mut sqe = zeroed_sqe();
        sqe.prep_timeout(&ts, 2, TimeoutFlags::ABS);

        let bytes = raw(&sqe);
        assert_eq!(Opcode::TIMEOUT.0, bytes[0]);
        assert_eq!(-1, NativeEndian::read_i32(&bytes[4..8]));
        assert_eq!(2, NativeEndian::read_u64(&bytes[8..16]));
        assert_eq!(&ts as *const _ as u64, NativeEndian::read_u64(&bytes[16..24]));
        assert_eq!(1, NativeEndian::read_u32(&bytes[24..28]));
        assert_eq!(TimeoutFlags::ABS.bits(), NativeEndian::read_u32(&bytes[28..32]));
    }

    #[test]
    fn splice_spreads_across_the_auxiliary_fields() {
        let mut sqe = zeroed_sqe();
        sqe.prep_splice(3, 100, 4, 200, 512, SpliceFlags::FD_IN_FIXED);

        let bytes = raw(&sqe);
        assert_eq!(Opcode::SPLICE.0, bytes[0]);
        assert_eq!(4, NativeEndian::read_i32(&bytes[4..8]));
        assert_eq!(200, NativeEndian::read_u64(&bytes[8..16]));
        assert_eq!(100, NativeEndian::read_u64(&bytes[16..24]));
        assert_eq!(512, NativeEndian::read_u32(&bytes[24..28]));
        assert_eq!(
            SpliceFlags::FD_IN_FIXED.bits(),
            NativeEndian::read_u32(&bytes[28..32])
        );
        assert_eq!(3, NativeEndian::read_i32(&bytes[44..48]));
    }

    #[test]
    fn provide_buffers_uses_fd_as_count_and_off_as_bid() {
        let mut buf = [0u8; 256];
        let mut sqe = zeroed_sqe();
        sqe.prep_provide_buffers(buf.as_mut_ptr() as *mut c_void, 64, 4, 9, 100);

        let bytes = raw(&sqe);
        assert_eq!(Opcode::PROVIDE_BUFFERS.0, bytes[0]);
        assert_eq!(4, NativeEndian::read_i32(&bytes[4..8]));
        assert_eq!(100, NativeEndian::read_u64(&bytes[8..16]));
        assert_eq!(64, NativeEndian::read_u32(&bytes[24..28]));
        assert_eq!(9, NativeEndian::read_u16(&bytes[40..42]));
    }

    #[test]
    fn entry_flag_setters() {
        let mut sqe = zeroed_sqe();
        sqe.prep_nop();
        sqe.set_flags(SqeFlags::IO_LINK | SqeFlags::ASYNC);
        sqe.set_personality(5);

        let bytes = raw(&sqe);
        assert_eq!((SqeFlags::IO_LINK | SqeFlags::ASYNC).bits(), bytes[1]);
        assert_eq!(5, NativeEndian::read_u16(&bytes[42..44]));
    }

    #[test]
    fn epoll_ctl_packs_op_and_target_fd() {
        let mut ev: libc::epoll_event = unsafe { core::mem::zeroed() };
        let mut sqe = zeroed_sqe();
        sqe.prep_epoll_ctl(8, 11, libc::EPOLL_CTL_ADD, &mut ev);

        let bytes = raw(&sqe);
        assert_eq!(Opcode::EPOLL_CTL.0, bytes[0]);
        assert_eq!(8, NativeEndian::read_i32(&bytes[4..8]));
        assert_eq!(11, NativeEndian::read_u64(&bytes[8..16]));
        assert_eq!(libc::EPOLL_CTL_ADD as u32, NativeEndian::read_u32(&bytes[24..28]));
    }
}
