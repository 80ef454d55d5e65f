use libc::c_void;

use crate::error::{Error, Result};
use crate::syscall::last_os_error;

/// One shared region mapped over the instance fd. Unmapped on drop, so a
/// half-built instance tears down cleanly.
#[derive(Debug)]
pub struct MappedMemory {
    addr: *mut c_void,
    length: usize,
}

impl MappedMemory {
    pub fn map(fd: i32, offset: u64, length: usize) -> Result<Self> {
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                offset as libc::off_t,
            )
        };

        if addr == libc::MAP_FAILED {
            Err(Error::Mmap(last_os_error()))
        } else {
            Ok(Self { addr, length })
        }
    }

    /// Plain anonymous memory standing in for a kernel mapping in tests.
    #[cfg(test)]
    pub(crate) fn anonymous(length: usize) -> Result<Self> {
        let addr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                length,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            Err(Error::Mmap(last_os_error()))
        } else {
            Ok(Self { addr, length })
        }
    }

    /// Pointer to a field at a kernel-reported byte offset inside the region.
    #[inline]
    pub fn offset<T>(&self, offset: usize) -> *mut T {
        debug_assert!(offset < self.length);
        unsafe { (self.addr as *mut u8).add(offset) as *mut T }
    }

    /// Hint that the region must not survive into fork children; stale ring
    /// state in a child is never meaningful.
    pub fn dontfork(&self) -> Result<()> {
        let ret = unsafe { libc::madvise(self.addr, self.length, libc::MADV_DONTFORK) };
        if ret != 0 {
            return Err(Error::Madvise(last_os_error()));
        }
        Ok(())
    }
}

impl Drop for MappedMemory {
    fn drop(&mut self) {
        if self.length > 0 {
            let ret = unsafe { libc::munmap(self.addr, self.length) };
            if ret != 0 {
                // Drop must not panic; the leak is the lesser evil.
                log::error!(
                    "munmap({:p}, {}) failed: errno {}",
                    self.addr,
                    self.length,
                    last_os_error()
                );
            }
        }
    }
}
