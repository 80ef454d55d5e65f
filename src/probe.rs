use static_assertions::const_assert_eq;

use crate::error::Result;
use crate::ring::{IoUring, Uring};
use crate::sqe::Opcode;
use crate::syscall::SyscallLib;

/// Capacity of the probe table. Generous beyond any current kernel so a
/// newer one can still describe everything it has.
pub const PROBE_OPS: usize = 256;

/// Bit set in a probe entry when the kernel handles that opcode.
pub const OP_SUPPORTED: u16 = 1 << 0;

const_assert_eq!(8, core::mem::size_of::<ProbeOp>());

/// One opcode's row in the probe table.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProbeOp {
    pub op: u8,
    pub resv: u8,
    pub flags: u16,
    pub resv2: u32,
}

const_assert_eq!(16 + PROBE_OPS * 8, core::mem::size_of::<Probe>());

/// The kernel's capability table: the highest opcode it knows plus a
/// supported bit per opcode.
#[repr(C)]
pub struct Probe {
    pub last_op: u8,
    pub ops_len: u8,
    resv: u16,
    resv2: [u32; 3],
    pub ops: [ProbeOp; PROBE_OPS],
}

impl Probe {
    pub(crate) fn zeroed() -> Box<Probe> {
        // all-zero is a valid (empty) table
        unsafe { Box::new(core::mem::zeroed()) }
    }

    /// Whether the probed kernel handles `op`. Anything past `last_op` is
    /// unknown to that kernel, supported bit or not.
    pub fn opcode_supported(&self, op: Opcode) -> bool {
        if op.0 > self.last_op {
            return false;
        }
        self.ops[op.0 as usize].flags & OP_SUPPORTED != 0
    }
}

impl<S: SyscallLib> IoUring<S> {
    /// Query this instance's kernel for its supported opcodes.
    pub fn probe(&self) -> Result<Box<Probe>> {
        let mut probe = Probe::zeroed();
        self.register_probe(&mut probe)?;
        Ok(probe)
    }
}

/// Probe the running kernel through a short-lived instance.
pub fn probe() -> Result<Box<Probe>> {
    let ring = Uring::new(2)?;
    ring.probe()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn support_requires_both_the_bit_and_the_range() {
        let mut probe = Probe::zeroed();
        probe.last_op = Opcode::OPENAT.0;
        probe.ops[Opcode::NOP.0 as usize].flags = OP_SUPPORTED;
        probe.ops[Opcode::OPENAT.0 as usize].flags = OP_SUPPORTED;
        // a bit past last_op means nothing
        probe.ops[Opcode::SPLICE.0 as usize].flags = OP_SUPPORTED;

        assert!(probe.opcode_supported(Opcode::NOP));
        assert!(probe.opcode_supported(Opcode::OPENAT));
        assert!(!probe.opcode_supported(Opcode::READV));
        assert!(!probe.opcode_supported(Opcode::SPLICE));
        assert!(!probe.opcode_supported(Opcode(200)));
    }
}
