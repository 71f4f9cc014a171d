//! Runtime-emitted trampoline stubs.
//!
//! Four fixed-purpose blobs bridge hardware/native state and the portable
//! dispatch logic:
//!
//! - `restore_context`: load a [`CpuContext`] back into the CPU and jump.
//! - `call_filter`: run a filter or finally/fault body against the machine
//!   state captured at the fault point.
//! - the throw family (`throw`, `rethrow`, `throw_by_token`,
//!   `resume_unwind`): capture full register state into a stack-local
//!   context and tail into the dispatch driver; these never return.
//!
//! The stubs are emitted once process-wide into one W^X page, flipped to
//! execute-only, and are thereafter immutable and callable from any number
//! of threads concurrently; they hold no mutable state.
//!
//! # Throw-stub frame layout
//!
//! ```text
//!  entry rsp + 8   <- caller stack pointer (recorded in the context)
//!  entry rsp       <- return address (recorded as the context ip)
//!  ...
//!  rsp + 0x30      <- CpuContext (17 slots, 136 bytes)
//!  rsp + 0         <- outgoing-call area (Win64 shadow space fits here)
//! ```
//!
//! The frame is sized so rsp is 16-byte aligned at the dispatch call.

use std::sync::OnceLock;

use tracing::info;

use crate::code_index::{CodeRegion, CodeRegionIndex, RegionError, RegionKind};
use crate::context::{CpuContext, Gpr, RIP_SLOT};
use crate::stubs::{Asm, PAGE_SIZE, StubBuffer};
use crate::unwind_info::{UnwindProgram, UnwindProgramBuilder};

// =============================================================================
// ABI register assignments
// =============================================================================

#[cfg(not(windows))]
const ARG1: Gpr = Gpr::Rdi;
#[cfg(not(windows))]
const ARG2: Gpr = Gpr::Rsi;
#[cfg(not(windows))]
const ARG3: Gpr = Gpr::Rdx;

#[cfg(windows)]
const ARG1: Gpr = Gpr::Rcx;
#[cfg(windows)]
const ARG2: Gpr = Gpr::Rdx;
#[cfg(windows)]
const ARG3: Gpr = Gpr::R8;

/// Throw-stub frame size. Keeps the dispatch call 16-byte aligned.
const THROW_FRAME: i32 = 184;
/// Offset of the captured context within the throw-stub frame. Leaves the
/// bottom of the frame free for the outgoing call (Win64 shadow space).
const THROW_CTX_OFF: i32 = 48;

// =============================================================================
// Errors
// =============================================================================

/// Failure while building the trampoline page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrampolineError {
    /// Executable memory could not be allocated.
    AllocationFailed,
    /// The page could not be flipped to execute-only.
    ProtectFailed,
}

impl std::fmt::Display for TrampolineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrampolineError::AllocationFailed => {
                write!(f, "failed to allocate trampoline memory")
            }
            TrampolineError::ProtectFailed => {
                write!(f, "failed to make trampoline memory executable")
            }
        }
    }
}

impl std::error::Error for TrampolineError {}

// =============================================================================
// Dispatch entry addresses
// =============================================================================

/// Addresses of the dispatch entry points the throw stubs tail into.
///
/// Signatures, all `extern "C"` and non-returning:
/// `throw(ctx, exception, rethrow_flag)`,
/// `throw_by_token(ctx, token, pc_offset)`, `resume_unwind(ctx)`.
#[derive(Debug, Clone, Copy)]
pub struct DispatchEntries {
    pub throw: usize,
    pub throw_by_token: usize,
    pub resume_unwind: usize,
}

// =============================================================================
// Stub emission
// =============================================================================

struct Stub {
    name: &'static str,
    offset: usize,
    len: usize,
    unwind: UnwindProgram,
}

#[inline]
fn reg_slot(reg: Gpr) -> i32 {
    CpuContext::slot_offset(reg.encoding() as usize)
}

/// Leaf-frame unwind program: CFA = rsp + 8 throughout.
fn leaf_program() -> UnwindProgram {
    let mut b = UnwindProgramBuilder::new();
    b.cfa_register(Gpr::Rsp);
    b.cfa_offset(8);
    b.finish()
}

/// Emit the restore-context stub.
///
/// Every register is loaded from the context except rsp and rip (loaded
/// last, in that order) and the two scratch registers the stub itself
/// needs: r8 carries the context pointer and r11 the target ip, so both
/// stay clobbered. Both are caller-saved in every supported ABI.
fn emit_restore_context(buf: &mut StubBuffer) -> Stub {
    let offset = buf.offset();
    let mut a = Asm::new(buf);

    a.mov_reg_reg(Gpr::R8, ARG1);
    for reg in [
        Gpr::Rax,
        Gpr::Rcx,
        Gpr::Rdx,
        Gpr::Rbx,
        Gpr::Rbp,
        Gpr::Rsi,
        Gpr::Rdi,
        Gpr::R9,
        Gpr::R10,
        Gpr::R12,
        Gpr::R13,
        Gpr::R14,
        Gpr::R15,
    ] {
        a.mov_reg_mem(reg, Gpr::R8, reg_slot(reg));
    }
    a.mov_reg_mem(Gpr::R11, Gpr::R8, CpuContext::slot_offset(RIP_SLOT));
    // The context may live below the target stack pointer, so rsp moves
    // only after every other load has happened.
    a.mov_reg_mem(Gpr::Rsp, Gpr::R8, reg_slot(Gpr::Rsp));
    a.jmp_reg(Gpr::R11);

    Stub {
        name: "stub:restore_context",
        offset,
        len: buf.offset() - offset,
        unwind: leaf_program(),
    }
}

/// Push a callee-saved register and record the matching unwind row.
fn push_saved(
    a: &mut Asm<'_>,
    unwind: &mut UnwindProgramBuilder,
    depth: &mut i32,
    last_off: &mut usize,
    reg: Gpr,
) {
    a.push(reg);
    *depth += 8;
    let now = a.offset();
    unwind.advance((now - *last_off) as u32);
    *last_off = now;
    unwind.cfa_offset(*depth);
    unwind.saved_reg(reg, -*depth);
}

/// Emit the call-filter stub.
///
/// Establishes a fresh native frame, loads the callee-saved registers (and
/// rax, which carries the exception object or null) from the context so
/// the filter/finally body observes the machine state at the fault point,
/// calls the supplied function, restores its own registers and returns the
/// callee's value.
fn emit_call_filter(buf: &mut StubBuffer) -> Stub {
    let offset = buf.offset();

    #[cfg(not(windows))]
    let extra_saved: &[Gpr] = &[];
    #[cfg(windows)]
    let extra_saved: &[Gpr] = &[Gpr::Rsi, Gpr::Rdi];

    #[cfg(not(windows))]
    let stack_adjust: u32 = 8;
    // Win64: 32 bytes of shadow space plus 8 to realign.
    #[cfg(windows)]
    let stack_adjust: u32 = 40;

    let mut unwind = UnwindProgramBuilder::new();
    unwind.cfa_register(Gpr::Rsp);
    unwind.cfa_offset(8);

    let mut a = Asm::new(buf);
    let mut depth: i32 = 8;
    let mut last_off = a.offset();

    push_saved(&mut a, &mut unwind, &mut depth, &mut last_off, Gpr::Rbp);
    a.mov_reg_reg(Gpr::Rbp, Gpr::Rsp);
    push_saved(&mut a, &mut unwind, &mut depth, &mut last_off, Gpr::Rbx);
    for &reg in extra_saved {
        push_saved(&mut a, &mut unwind, &mut depth, &mut last_off, reg);
    }
    for reg in [Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15] {
        push_saved(&mut a, &mut unwind, &mut depth, &mut last_off, reg);
    }
    a.sub_rsp(stack_adjust);
    depth += stack_adjust as i32;
    unwind.advance((a.offset() - last_off) as u32);
    unwind.cfa_offset(depth);

    // Stash the arguments before the context loads clobber the arg
    // registers.
    a.mov_reg_reg(Gpr::R10, ARG1);
    a.mov_reg_reg(Gpr::R11, ARG2);

    a.mov_reg_mem(Gpr::Rax, Gpr::R10, reg_slot(Gpr::Rax));
    for &reg in Gpr::CALLEE_SAVED.iter() {
        a.mov_reg_mem(reg, Gpr::R10, reg_slot(reg));
    }

    a.call_reg(Gpr::R11);

    a.add_rsp(stack_adjust);
    for reg in [Gpr::R15, Gpr::R14, Gpr::R13, Gpr::R12] {
        a.pop(reg);
    }
    for &reg in extra_saved.iter().rev() {
        a.pop(reg);
    }
    a.pop(Gpr::Rbx);
    a.pop(Gpr::Rbp);
    a.ret();

    Stub {
        name: "stub:call_filter",
        offset,
        len: buf.offset() - offset,
        unwind: unwind.finish(),
    }
}

/// Argument shuffle a throw stub performs before calling dispatch.
enum ThrowArgs {
    /// Stub received one value; dispatch gets `(ctx, value, flag)`.
    OneValue { flag: u64 },
    /// Stub received two values; dispatch gets `(ctx, v1, v2)`.
    TwoValues,
    /// Dispatch gets `(ctx)` only.
    CtxOnly,
}

/// Emit one member of the throw family.
///
/// Captures every register into a stack-local context (the recorded rsp
/// and rip are the caller's, read from the stub's own frame), shuffles the
/// stub arguments behind a context pointer, and calls the dispatch entry.
/// Dispatch never returns; the trailing `int3` turns a fall-through into a
/// loud invariant violation.
fn emit_throw_stub(
    buf: &mut StubBuffer,
    name: &'static str,
    target: usize,
    args: ThrowArgs,
) -> Stub {
    let offset = buf.offset();

    let mut unwind = UnwindProgramBuilder::new();
    unwind.cfa_register(Gpr::Rsp);
    unwind.cfa_offset(8);

    let mut a = Asm::new(buf);
    let start = a.offset();
    a.sub_rsp(THROW_FRAME as u32);
    unwind.advance((a.offset() - start) as u32);
    unwind.cfa_offset(THROW_FRAME + 8);

    // Capture all registers. rax goes first so it can serve as scratch for
    // the two synthesized slots.
    for reg in Gpr::ALL {
        if reg != Gpr::Rsp {
            a.mov_mem_reg(Gpr::Rsp, THROW_CTX_OFF + reg_slot(reg), reg);
        }
    }
    // Caller's stack pointer: one word above our return address.
    a.lea(Gpr::Rax, Gpr::Rsp, THROW_FRAME + 8);
    a.mov_mem_reg(Gpr::Rsp, THROW_CTX_OFF + reg_slot(Gpr::Rsp), Gpr::Rax);
    // Return address becomes the recorded ip; dispatch rewinds it to the
    // call site.
    a.mov_reg_mem(Gpr::Rax, Gpr::Rsp, THROW_FRAME);
    a.mov_mem_reg(
        Gpr::Rsp,
        THROW_CTX_OFF + CpuContext::slot_offset(RIP_SLOT),
        Gpr::Rax,
    );

    // Shuffle arguments in read-before-write order, context pointer last.
    match args {
        ThrowArgs::OneValue { flag } => {
            a.mov_reg_imm64(ARG3, flag);
            a.mov_reg_reg(ARG2, ARG1);
            a.lea(ARG1, Gpr::Rsp, THROW_CTX_OFF);
        }
        ThrowArgs::TwoValues => {
            a.mov_reg_reg(ARG3, ARG2);
            a.mov_reg_reg(ARG2, ARG1);
            a.lea(ARG1, Gpr::Rsp, THROW_CTX_OFF);
        }
        ThrowArgs::CtxOnly => {
            a.lea(ARG1, Gpr::Rsp, THROW_CTX_OFF);
        }
    }
    a.mov_reg_imm64(Gpr::R11, target as u64);
    a.call_reg(Gpr::R11);
    a.int3();

    Stub {
        name,
        offset,
        len: buf.offset() - offset,
        unwind: unwind.finish(),
    }
}

// =============================================================================
// Trampolines
// =============================================================================

/// The built trampoline page, offsets resolved, memory execute-only.
pub struct Trampolines {
    buffer: StubBuffer,
    restore_context: Stub,
    call_filter: Stub,
    throw: Stub,
    rethrow: Stub,
    throw_by_token: Stub,
    resume_unwind: Stub,
}

impl Trampolines {
    /// Emit all stubs into a fresh page and flip it executable.
    pub fn build(entries: DispatchEntries) -> Result<Trampolines, TrampolineError> {
        let mut buffer = StubBuffer::new(PAGE_SIZE).ok_or(TrampolineError::AllocationFailed)?;

        let restore_context = emit_restore_context(&mut buffer);
        let call_filter = emit_call_filter(&mut buffer);
        let throw = emit_throw_stub(
            &mut buffer,
            "stub:throw",
            entries.throw,
            ThrowArgs::OneValue { flag: 0 },
        );
        let rethrow = emit_throw_stub(
            &mut buffer,
            "stub:rethrow",
            entries.throw,
            ThrowArgs::OneValue { flag: 1 },
        );
        let throw_by_token = emit_throw_stub(
            &mut buffer,
            "stub:throw_by_token",
            entries.throw_by_token,
            ThrowArgs::TwoValues,
        );
        let resume_unwind = emit_throw_stub(
            &mut buffer,
            "stub:resume_unwind",
            entries.resume_unwind,
            ThrowArgs::CtxOnly,
        );

        if !buffer.make_executable() {
            return Err(TrampolineError::ProtectFailed);
        }

        info!(
            base = buffer.base(),
            bytes = buffer.offset(),
            "trampoline page built"
        );

        Ok(Trampolines {
            buffer,
            restore_context,
            call_filter,
            throw,
            rethrow,
            throw_by_token,
            resume_unwind,
        })
    }

    /// Restore-context entry.
    ///
    /// # Safety
    /// Calling transfers control into the context; the context must
    /// describe a resumable machine state.
    pub fn restore_context(&self) -> unsafe extern "C" fn(*const CpuContext) -> ! {
        unsafe { self.buffer.as_fn_at(self.restore_context.offset) }
    }

    /// Call-filter entry: `(ctx, fn_address) -> fn's return value`.
    pub fn call_filter(&self) -> unsafe extern "C" fn(*const CpuContext, usize) -> usize {
        unsafe { self.buffer.as_fn_at(self.call_filter.offset) }
    }

    /// Address of the throw stub, registered as a compiled-code intrinsic.
    pub fn throw_addr(&self) -> u64 {
        self.buffer.addr_at(self.throw.offset)
    }

    pub fn rethrow_addr(&self) -> u64 {
        self.buffer.addr_at(self.rethrow.offset)
    }

    pub fn throw_by_token_addr(&self) -> u64 {
        self.buffer.addr_at(self.throw_by_token.offset)
    }

    pub fn resume_unwind_addr(&self) -> u64 {
        self.buffer.addr_at(self.resume_unwind.offset)
    }

    /// Register every stub as a trampoline region so the unwinder can
    /// classify stub instruction pointers.
    pub fn register_regions(&self, index: &CodeRegionIndex) -> Result<(), RegionError> {
        for stub in [
            &self.restore_context,
            &self.call_filter,
            &self.throw,
            &self.rethrow,
            &self.throw_by_token,
            &self.resume_unwind,
        ] {
            index.register(CodeRegion {
                start: self.buffer.addr_at(stub.offset),
                size: stub.len,
                kind: RegionKind::Trampoline,
                method_name: stub.name.to_string(),
                unwind: stub.unwind.clone(),
                eh_clauses: Vec::new(),
            })?;
        }
        Ok(())
    }
}

// =============================================================================
// Process-wide cache
// =============================================================================

static TRAMPOLINES: OnceLock<Trampolines> = OnceLock::new();

/// Build the process-wide trampolines, or return the already-built set.
///
/// Safe to race from multiple initializing threads; the first build wins
/// and every caller gets the same page.
pub fn install(entries: DispatchEntries) -> Result<&'static Trampolines, TrampolineError> {
    if let Some(existing) = TRAMPOLINES.get() {
        return Ok(existing);
    }
    let built = Trampolines::build(entries)?;
    Ok(TRAMPOLINES.get_or_init(|| built))
}

/// The process-wide trampolines, if already installed.
pub fn installed() -> Option<&'static Trampolines> {
    TRAMPOLINES.get()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_entries() -> DispatchEntries {
        // Targets are never called by these tests.
        DispatchEntries {
            throw: 0x1000_0000,
            throw_by_token: 0x1000_0100,
            resume_unwind: 0x1000_0200,
        }
    }

    #[test]
    fn test_build_produces_distinct_executable_stubs() {
        let t = Trampolines::build(dummy_entries()).expect("build failed");
        assert!(t.buffer.is_executable());
        let addrs = [
            t.throw_addr(),
            t.rethrow_addr(),
            t.throw_by_token_addr(),
            t.resume_unwind_addr(),
        ];
        for (i, a) in addrs.iter().enumerate() {
            for b in &addrs[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[cfg(not(windows))]
    #[test]
    fn test_restore_context_stub_prologue_bytes() {
        let mut buf = StubBuffer::new(PAGE_SIZE).expect("alloc failed");
        let stub = emit_restore_context(&mut buf);
        let bytes = &buf.as_slice()[stub.offset..stub.offset + stub.len];
        // mov r8, rdi
        assert_eq!(&bytes[..3], &[0x49, 0x89, 0xf8]);
        // mov rax, [r8 + 0]
        assert_eq!(&bytes[3..10], &[0x49, 0x8b, 0x80, 0x00, 0x00, 0x00, 0x00]);
        // Last two instructions: mov rsp, [r8+0x20]; jmp r11.
        let tail = &bytes[bytes.len() - 10..];
        assert_eq!(&tail[..7], &[0x49, 0x8b, 0xa0, 0x20, 0x00, 0x00, 0x00]);
        assert_eq!(&tail[7..], &[0x41, 0xff, 0xe3]);
    }

    #[test]
    fn test_throw_stub_starts_with_frame_setup() {
        let mut buf = StubBuffer::new(PAGE_SIZE).expect("alloc failed");
        let stub = emit_throw_stub(&mut buf, "stub:throw", 0x1234, ThrowArgs::OneValue { flag: 0 });
        let bytes = &buf.as_slice()[stub.offset..stub.offset + stub.len];
        // sub rsp, 184
        assert_eq!(&bytes[..7], &[0x48, 0x81, 0xec, 0xb8, 0x00, 0x00, 0x00]);
        // Ends with call r11; int3.
        assert_eq!(&bytes[bytes.len() - 4..], &[0x41, 0xff, 0xd3, 0xcc]);
    }

    #[test]
    fn test_stub_unwind_programs_replay() {
        let mut buf = StubBuffer::new(PAGE_SIZE).expect("alloc failed");
        let stub = emit_call_filter(&mut buf);
        // Entry rules.
        let rules = stub.unwind.replay(0).unwrap();
        assert_eq!(rules.cfa_offset, 8);
        // Past the prologue every callee-saved register has a slot.
        let rules = stub.unwind.replay(stub.len as u32).unwrap();
        for reg in Gpr::CALLEE_SAVED {
            assert!(rules.saved_slot(0x1000, reg).is_some(), "{reg} not tracked");
        }
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_call_filter_invokes_target_and_returns() {
        extern "C" fn handler_body() -> usize {
            4242
        }

        let t = Trampolines::build(dummy_entries()).expect("build failed");
        let ctx = CpuContext::new();
        let result = unsafe { (t.call_filter())(&ctx, handler_body as usize) };
        assert_eq!(result, 4242);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_call_filter_preserves_caller_state() {
        extern "C" fn clobber_everything() -> usize {
            0
        }

        let t = Trampolines::build(dummy_entries()).expect("build failed");
        // A context full of garbage callee-saved values: the stub loads
        // them for the callee and must restore ours before returning.
        let mut ctx = CpuContext::new();
        for reg in Gpr::CALLEE_SAVED {
            ctx.set(reg, 0x5a5a_0000 + reg.encoding() as u64);
        }
        let canary = vec![0xa5u8; 64];
        let result = unsafe { (t.call_filter())(&ctx, clobber_everything as usize) };
        assert_eq!(result, 0);
        // If the stub failed to restore our frame this is unreachable or
        // the canary is gone.
        assert!(canary.iter().all(|&b| b == 0xa5));
    }

    #[test]
    fn test_register_regions_classifies_stub_ips() {
        let t = Trampolines::build(dummy_entries()).expect("build failed");
        let index = CodeRegionIndex::new();
        t.register_regions(&index).expect("registration failed");
        assert_eq!(index.len(), 6);

        let region = index.find_by_ip(t.throw_addr() + 4).expect("no region");
        assert_eq!(region.kind, RegionKind::Trampoline);
        assert_eq!(region.method_name, "stub:throw");
        assert!(index.find_by_ip(t.rethrow_addr()).is_some());
    }

    #[test]
    fn test_install_is_idempotent() {
        let a = install(dummy_entries()).expect("install failed");
        let b = install(dummy_entries()).expect("install failed");
        assert!(std::ptr::eq(a, b));
        assert!(installed().is_some());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_restore_context_transfers_control() {
        use crate::context::capture_context;
        use std::sync::atomic::{AtomicUsize, Ordering};

        static PASSES: AtomicUsize = AtomicUsize::new(0);

        let t = Trampolines::build(dummy_entries()).expect("build failed");
        // The first pass captures; restoring jumps back into the capture
        // sequence with the captured frame re-established, so execution
        // reaches the counter a second time.
        let ctx = capture_context();
        if PASSES.fetch_add(1, Ordering::SeqCst) == 0 {
            unsafe { (t.restore_context())(&ctx) };
        }
        assert_eq!(PASSES.load(Ordering::SeqCst), 2);
    }
}
