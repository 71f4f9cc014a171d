//! CPU register context model for x86-64.
//!
//! A [`CpuContext`] is a snapshot of the 16 general-purpose registers plus
//! the instruction pointer. It is the unit passed between every unwinding
//! operation: the signal bridge produces one from a hardware trap, the
//! throw trampolines capture one from live machine state, the unwinder
//! consumes one and produces the caller's, and the restore trampoline loads
//! one back into the CPU.
//!
//! Contexts are plain values: copied, never aliased across threads.

// =============================================================================
// General-Purpose Registers
// =============================================================================

/// x86-64 general-purpose registers with their hardware encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Gpr {
    /// All registers in encoding order.
    pub const ALL: [Gpr; 16] = [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rsp,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R8,
        Gpr::R9,
        Gpr::R10,
        Gpr::R11,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Registers a callee must preserve under the SysV AMD64 ABI.
    #[cfg(not(windows))]
    pub const CALLEE_SAVED: [Gpr; 6] = [Gpr::Rbx, Gpr::Rbp, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

    /// Registers a callee must preserve under the Windows x64 ABI.
    #[cfg(windows)]
    pub const CALLEE_SAVED: [Gpr; 8] = [
        Gpr::Rbx,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ];

    /// Hardware encoding (0-15).
    #[inline]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    /// Low 3 bits of the encoding (ModRM field).
    #[inline]
    pub const fn low_bits(self) -> u8 {
        (self as u8) & 0b111
    }

    /// Whether the register needs a REX extension bit (r8-r15).
    #[inline]
    pub const fn needs_rex(self) -> bool {
        (self as u8) >= 8
    }

    /// Whether this register must be preserved across calls on the current
    /// platform.
    #[inline]
    pub fn is_callee_saved(self) -> bool {
        Self::CALLEE_SAVED.contains(&self)
    }

    /// Register from an encoding, for table-driven loops.
    #[inline]
    pub const fn from_encoding(enc: u8) -> Gpr {
        Self::ALL[(enc & 0xf) as usize]
    }
}

impl std::fmt::Display for Gpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Gpr::Rax => "rax",
            Gpr::Rcx => "rcx",
            Gpr::Rdx => "rdx",
            Gpr::Rbx => "rbx",
            Gpr::Rsp => "rsp",
            Gpr::Rbp => "rbp",
            Gpr::Rsi => "rsi",
            Gpr::Rdi => "rdi",
            Gpr::R8 => "r8",
            Gpr::R9 => "r9",
            Gpr::R10 => "r10",
            Gpr::R11 => "r11",
            Gpr::R12 => "r12",
            Gpr::R13 => "r13",
            Gpr::R14 => "r14",
            Gpr::R15 => "r15",
        };
        f.write_str(name)
    }
}

// =============================================================================
// CpuContext
// =============================================================================

/// Slot index of the instruction pointer in [`CpuContext::regs`].
pub const RIP_SLOT: usize = 16;

/// Number of machine-word slots in a context (16 GPRs + rip).
pub const CONTEXT_SLOTS: usize = 17;

/// Full register-state snapshot.
///
/// Layout is fixed: slot `i` holds the register with hardware encoding `i`
/// for `i < 16`, and slot 16 holds the instruction pointer. Trampolines and
/// the signal bridge depend on this layout, so the struct is `#[repr(C)]`
/// and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct CpuContext {
    pub regs: [u64; CONTEXT_SLOTS],
}

impl CpuContext {
    /// Zeroed context.
    #[inline]
    pub const fn new() -> Self {
        CpuContext {
            regs: [0; CONTEXT_SLOTS],
        }
    }

    /// Read a general-purpose register.
    #[inline]
    pub fn get(&self, reg: Gpr) -> u64 {
        self.regs[reg.encoding() as usize]
    }

    /// Write a general-purpose register.
    #[inline]
    pub fn set(&mut self, reg: Gpr, value: u64) {
        self.regs[reg.encoding() as usize] = value;
    }

    /// Instruction pointer.
    #[inline]
    pub fn ip(&self) -> u64 {
        self.regs[RIP_SLOT]
    }

    #[inline]
    pub fn set_ip(&mut self, ip: u64) {
        self.regs[RIP_SLOT] = ip;
    }

    /// Stack pointer.
    #[inline]
    pub fn sp(&self) -> u64 {
        self.get(Gpr::Rsp)
    }

    #[inline]
    pub fn set_sp(&mut self, sp: u64) {
        self.set(Gpr::Rsp, sp);
    }

    /// Frame pointer.
    #[inline]
    pub fn fp(&self) -> u64 {
        self.get(Gpr::Rbp)
    }

    #[inline]
    pub fn set_fp(&mut self, fp: u64) {
        self.set(Gpr::Rbp, fp);
    }

    /// Byte offset of a register slot from the struct base, for emitted
    /// load/store sequences.
    #[inline]
    pub const fn slot_offset(slot: usize) -> i32 {
        (slot * std::mem::size_of::<u64>()) as i32
    }
}

// =============================================================================
// Context capture
// =============================================================================

/// Capture the caller's register state.
///
/// The recorded stack pointer is the caller's, the instruction pointer
/// points into the capture sequence, and callee-saved registers hold their
/// live values. Caller-saved registers hold whatever the compiler left in
/// them at the capture point; only the callee-saved set, rsp, and rip are
/// meaningful to an unwinder.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn capture_context() -> CpuContext {
    let mut ctx = CpuContext::new();
    unsafe {
        core::arch::asm!(
            "mov [{regs} + 0x08], rcx",
            "mov [{regs} + 0x10], rdx",
            "mov [{regs} + 0x18], rbx",
            "mov [{regs} + 0x20], rsp",
            "mov [{regs} + 0x28], rbp",
            "mov [{regs} + 0x30], rsi",
            "mov [{regs} + 0x38], rdi",
            "mov [{regs} + 0x60], r12",
            "mov [{regs} + 0x68], r13",
            "mov [{regs} + 0x70], r14",
            "mov [{regs} + 0x78], r15",
            // rip must be read through a lea; rax doubles as the scratch.
            "lea rax, [rip + 0]",
            "mov [{regs} + 0x80], rax",
            regs = in(reg) ctx.regs.as_mut_ptr(),
            out("rax") _,
            options(nostack),
        );
    }
    ctx
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encodings_match_slot_order() {
        for (i, reg) in Gpr::ALL.iter().enumerate() {
            assert_eq!(reg.encoding() as usize, i);
        }
        assert_eq!(Gpr::from_encoding(11), Gpr::R11);
        assert!(Gpr::R8.needs_rex());
        assert!(!Gpr::Rdi.needs_rex());
        assert_eq!(Gpr::R13.low_bits(), 0b101);
    }

    #[test]
    fn test_callee_saved_classification() {
        assert!(Gpr::Rbx.is_callee_saved());
        assert!(Gpr::R15.is_callee_saved());
        assert!(!Gpr::Rax.is_callee_saved());
        assert!(!Gpr::R11.is_callee_saved());
    }

    #[test]
    fn test_context_accessors() {
        let mut ctx = CpuContext::new();
        ctx.set(Gpr::R12, 0xdead);
        ctx.set_sp(0x7fff_0000);
        ctx.set_ip(0x4000_1234);
        assert_eq!(ctx.get(Gpr::R12), 0xdead);
        assert_eq!(ctx.sp(), 0x7fff_0000);
        assert_eq!(ctx.get(Gpr::Rsp), 0x7fff_0000);
        assert_eq!(ctx.ip(), 0x4000_1234);
        assert_eq!(ctx.regs[RIP_SLOT], 0x4000_1234);
    }

    #[test]
    fn test_layout_is_stable() {
        assert_eq!(
            std::mem::size_of::<CpuContext>(),
            CONTEXT_SLOTS * std::mem::size_of::<u64>()
        );
        assert_eq!(CpuContext::slot_offset(RIP_SLOT), 0x80);
        assert_eq!(CpuContext::slot_offset(Gpr::Rsp.encoding() as usize), 0x20);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_capture_records_live_stack_pointer() {
        let ctx = capture_context();
        let here = &ctx as *const _ as u64;
        // The captured rsp must sit at or below the local frame, within a
        // plausible distance of it.
        assert!(ctx.sp() <= here);
        assert!(here - ctx.sp() < 64 * 1024);
        assert_ne!(ctx.ip(), 0);
    }
}
