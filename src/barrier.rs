//! Ordered access to the 32-bit index cells shared with the kernel.
//!
//! The head and tail words live in mapped memory the kernel reads and writes
//! concurrently, so every access goes through an atomic view of the cell. The
//! pointers come from kernel-reported offsets and are naturally aligned.

use core::sync::atomic::{AtomicU32, Ordering};

/// Acquire-load of a shared index. Pairs with the kernel's release-store, so
/// everything the kernel published before moving the index is visible after
/// this returns.
#[inline]
pub(crate) unsafe fn load_acquire(p: *const u32) -> u32 {
    AtomicU32::from_ptr(p as *mut u32).load(Ordering::Acquire)
}

/// Release-store of a shared index. Everything written before this call is
/// visible to the kernel once it observes the new value.
#[inline]
pub(crate) unsafe fn store_release(p: *mut u32, v: u32) {
    AtomicU32::from_ptr(p).store(v, Ordering::Release)
}

/// Unordered read of a shared cell, for values where only tearing must be
/// avoided (the kernel-side head when computing occupancy).
#[inline]
pub(crate) unsafe fn read_once(p: *const u32) -> u32 {
    AtomicU32::from_ptr(p as *mut u32).load(Ordering::Relaxed)
}
