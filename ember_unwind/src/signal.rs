//! Signal / hardware-exception bridge.
//!
//! Translates a hardware trap into a portable [`CpuContext`] plus a
//! [`FaultKind`], then hands off to the dispatch driver. Faults whose
//! instruction pointer does not resolve to managed code are not ours: the
//! handler prints a diagnostic, resets the default disposition and returns,
//! so the re-executed fault terminates the process with the original
//! signal.
//!
//! # Platform Support
//!
//! | Platform | Mechanism |
//! |----------|-----------|
//! | Linux    | SIGSEGV/SIGBUS/SIGILL/SIGFPE via sigaction |
//! | macOS    | same, with the Mach `__ss` register block |
//! | Windows  | VEH (Vectored Exception Handler) |
//!
//! # Delivery strategies
//!
//! *Synchronous*: dispatch runs inside the handler and the mutated context
//! is written back into the hardware record, so returning from the handler
//! resumes at the chosen handler address.
//!
//! *Deferred*: running managed filters with the signal blocked is unsafe,
//! so the handler instead rewrites the saved context to resume in
//! [`fault_redirect`] on the normal thread stack (clear of the red zone,
//! original rip pushed so native unwinders still see the call chain) and
//! parks the fault context in TLS; the redirect then dispatches with
//! signals unblocked.
//!
//! Stack overflows are exempt from deferral: the thread's normal stack is
//! exactly what ran out, so they always dispatch synchronously on the
//! alternate signal stack.

use std::cell::RefCell;
#[cfg(windows)]
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::error;

use crate::context::{CpuContext, Gpr};
use crate::exception::TypeToken;

// =============================================================================
// FaultKind
// =============================================================================

/// Classification of a hardware fault into a managed exception category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    AccessViolation,
    DivideByZero,
    Overflow,
    IllegalInstruction,
    StackOverflow,
}

impl FaultKind {
    /// Exception type raised for this fault.
    pub fn token(self) -> TypeToken {
        match self {
            FaultKind::AccessViolation => TypeToken::ACCESS_VIOLATION,
            FaultKind::DivideByZero => TypeToken::DIVIDE_BY_ZERO,
            FaultKind::Overflow => TypeToken::OVERFLOW,
            FaultKind::IllegalInstruction => TypeToken::ILLEGAL_INSTRUCTION,
            FaultKind::StackOverflow => TypeToken::STACK_OVERFLOW,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            FaultKind::AccessViolation => "access violation",
            FaultKind::DivideByZero => "division by zero",
            FaultKind::Overflow => "arithmetic overflow",
            FaultKind::IllegalInstruction => "illegal instruction",
            FaultKind::StackOverflow => "stack overflow",
        }
    }
}

/// Distance below the stack pointer within which a bad access is treated
/// as a guard-page hit rather than a stray pointer.
const STACK_GUARD_SLACK: u64 = 32 * 4096;

/// Classify a memory fault: an access just below the stack pointer is the
/// guard page, anything else is a stray pointer.
pub fn classify_memory_fault(fault_addr: u64, sp: u64) -> FaultKind {
    let below = sp.wrapping_sub(fault_addr);
    let above = fault_addr.wrapping_sub(sp);
    if fault_addr != 0 && (below < STACK_GUARD_SLACK || above < STACK_GUARD_SLACK) {
        FaultKind::StackOverflow
    } else {
        FaultKind::AccessViolation
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Error types for handler operations.
#[derive(Debug, Clone)]
pub enum HandlerError {
    /// Handlers already installed.
    AlreadyInstalled,
    /// Failed to install a handler.
    InstallFailed(String),
    /// Handlers not installed.
    NotInstalled,
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerError::AlreadyInstalled => write!(f, "signal handlers already installed"),
            HandlerError::InstallFailed(msg) => write!(f, "signal handler install failed: {msg}"),
            HandlerError::NotInstalled => write!(f, "signal handlers not installed"),
        }
    }
}

impl std::error::Error for HandlerError {}

// =============================================================================
// Global handler state
// =============================================================================

/// Whether the handlers are currently installed.
static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);

/// Whether faults are delivered via the deferred redirect.
static DEFERRED_DELIVERY: AtomicBool = AtomicBool::new(false);

/// A fault parked for deferred delivery.
#[derive(Debug, Clone, Copy)]
pub struct PendingFault {
    pub kind: FaultKind,
    pub fault_addr: u64,
    pub ctx: CpuContext,
}

thread_local! {
    /// Fault context saved by the handler for the redirect function.
    static PENDING_FAULT: RefCell<Option<PendingFault>> = const { RefCell::new(None) };

    /// Guard page registered for this thread, re-armed after a
    /// stack-overflow handler has run.
    static THREAD_GUARD: RefCell<Option<(usize, usize)>> = const { RefCell::new(None) };
}

/// Take the fault parked for this thread, if any.
pub fn take_pending_fault() -> Option<PendingFault> {
    PENDING_FAULT.with(|slot| slot.borrow_mut().take())
}

fn park_fault(fault: PendingFault) {
    PENDING_FAULT.with(|slot| {
        *slot.borrow_mut() = Some(fault);
    });
}

/// Register the calling thread's stack guard page so a stack-overflow
/// resume can re-arm it.
pub fn register_thread_guard(addr: usize, len: usize) {
    THREAD_GUARD.with(|slot| {
        *slot.borrow_mut() = Some((addr, len));
    });
}

/// Re-protect the calling thread's guard page. The guard had to be
/// relaxed to let the stack-overflow handler run at all; it must be armed
/// again before managed code resumes.
pub fn rearm_thread_guard() {
    let guard = THREAD_GUARD.with(|slot| *slot.borrow());
    if let Some((addr, len)) = guard {
        #[cfg(unix)]
        unsafe {
            libc::mprotect(addr as *mut _, len, libc::PROT_NONE);
        }
        #[cfg(windows)]
        unsafe {
            let mut old = 0u32;
            windows_sys::Win32::System::Memory::VirtualProtect(
                addr as *mut _,
                len,
                windows_sys::Win32::System::Memory::PAGE_NOACCESS,
                &mut old,
            );
        }
    }
}

// =============================================================================
// Deferred delivery
// =============================================================================

/// x86-64 SysV red zone below the stack pointer; leaf code may be using it.
const RED_ZONE: u64 = 128;

/// Rewrite `ctx` so that resuming it lands in `redirect` on the faulting
/// thread's normal stack. The original rip is pushed where a return
/// address would sit, so native unwinders walking the redirected thread
/// still see the true call chain.
pub fn redirect_context(ctx: &mut CpuContext, redirect: u64) {
    let mut sp = ctx.sp().wrapping_sub(RED_ZONE);
    sp &= !0xf;
    sp = sp.wrapping_sub(8);
    unsafe {
        (sp as *mut u64).write(ctx.ip());
    }
    ctx.set_sp(sp);
    ctx.set_ip(redirect);
}

/// Landing point for deferred fault delivery. Entered by "returning" from
/// the signal handler into the rewritten context; picks the parked fault
/// back up and dispatches with signals unblocked.
pub extern "C" fn fault_redirect() -> ! {
    let Some(fault) = take_pending_fault() else {
        // A redirect with nothing parked means the handler state machine
        // broke; there is nothing to resume into.
        eprintln!("[ember-signal] fault redirect with no pending fault");
        std::process::abort();
    };
    crate::dispatch::handle_hardware_fault(fault.kind, fault.fault_addr, fault.ctx)
}

/// How a fault leaves the signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    /// Dispatch inside the handler, on the alternate stack.
    Synchronous,
    /// Resume into [`fault_redirect`] on the thread's normal stack.
    Deferred,
}

/// Pick the delivery path for one fault. Stack overflows never defer: the
/// redirect frame would be written below the exhausted stack pointer,
/// inside the armed guard page, and the redirect body would then run the
/// dispatcher on a stack with no room left.
fn delivery_for(kind: FaultKind, deferred: bool) -> Delivery {
    if deferred && kind != FaultKind::StackOverflow {
        Delivery::Deferred
    } else {
        Delivery::Synchronous
    }
}

/// Handle one translated fault inside the handler, shared by the Unix and
/// Windows paths. Returns the context to write back into the hardware
/// record, or `None` when the fault is not ours.
fn on_fault(kind: FaultKind, fault_addr: u64, ctx: CpuContext) -> Option<CpuContext> {
    if !crate::dispatch::ip_is_managed(ctx.ip()) {
        error!(
            ip = ctx.ip(),
            fault_addr,
            kind = kind.describe(),
            "hardware fault outside managed code"
        );
        return None;
    }

    match delivery_for(kind, DEFERRED_DELIVERY.load(Ordering::Acquire)) {
        Delivery::Deferred => {
            let mut resumed = ctx;
            park_fault(PendingFault {
                kind,
                fault_addr,
                ctx,
            });
            let redirect: extern "C" fn() -> ! = fault_redirect;
            redirect_context(&mut resumed, redirect as usize as u64);
            Some(resumed)
        }
        Delivery::Synchronous => {
            if kind == FaultKind::StackOverflow {
                rearm_thread_guard();
            }
            Some(crate::dispatch::dispatch_hardware_fault(
                kind, fault_addr, ctx,
            ))
        }
    }
}

// =============================================================================
// Unix installation
// =============================================================================

#[cfg(unix)]
const MANAGED_SIGNALS: [libc::c_int; 4] =
    [libc::SIGSEGV, libc::SIGBUS, libc::SIGILL, libc::SIGFPE];

/// Size of the alternate signal stack installed per thread.
#[cfg(unix)]
pub const ALT_STACK_SIZE: usize = 16 * 4096;

/// Install the fault handlers process-wide.
#[cfg(unix)]
pub fn install_handlers(deferred: bool) -> Result<(), HandlerError> {
    if HANDLERS_INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(HandlerError::AlreadyInstalled);
    }
    DEFERRED_DELIVERY.store(deferred, Ordering::Release);

    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = fault_handler as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;

        for sig in MANAGED_SIGNALS {
            if libc::sigaction(sig, &action, std::ptr::null_mut()) != 0 {
                HANDLERS_INSTALLED.store(false, Ordering::Release);
                return Err(HandlerError::InstallFailed(
                    std::io::Error::last_os_error().to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Restore the default disposition for every managed signal.
#[cfg(unix)]
pub fn uninstall_handlers() -> Result<(), HandlerError> {
    if !HANDLERS_INSTALLED.swap(false, Ordering::AcqRel) {
        return Err(HandlerError::NotInstalled);
    }
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        for sig in MANAGED_SIGNALS {
            libc::sigaction(sig, &action, std::ptr::null_mut());
        }
    }
    Ok(())
}

/// Install an alternate signal stack for the calling thread so the
/// stack-overflow handler has room to run.
#[cfg(unix)]
pub fn setup_alt_stack() -> Result<(), HandlerError> {
    unsafe {
        let base = libc::mmap(
            std::ptr::null_mut(),
            ALT_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if base == libc::MAP_FAILED {
            return Err(HandlerError::InstallFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
        let stack = libc::stack_t {
            ss_sp: base,
            ss_flags: 0,
            ss_size: ALT_STACK_SIZE,
        };
        if libc::sigaltstack(&stack, std::ptr::null_mut()) != 0 {
            return Err(HandlerError::InstallFailed(
                std::io::Error::last_os_error().to_string(),
            ));
        }
    }
    Ok(())
}

// =============================================================================
// Unix signal handler
// =============================================================================

// `si_code` value for integer overflow on SIGFPE (asm-generic/siginfo.h);
// not exported by the `libc` crate on Linux.
#[cfg(unix)]
const FPE_INTOVF: libc::c_int = 2;

#[cfg(unix)]
extern "C" fn fault_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    unsafe {
        let uc = context as *mut libc::ucontext_t;
        let ctx = context_from_ucontext(uc);

        #[cfg(target_os = "linux")]
        let fault_addr = (*info).si_addr() as u64;
        #[cfg(not(target_os = "linux"))]
        let fault_addr = (*info).si_addr as u64;

        let kind = match sig {
            libc::SIGSEGV | libc::SIGBUS => classify_memory_fault(fault_addr, ctx.sp()),
            libc::SIGILL => FaultKind::IllegalInstruction,
            libc::SIGFPE => match (*info).si_code {
                FPE_INTOVF => FaultKind::Overflow,
                _ => FaultKind::DivideByZero,
            },
            _ => FaultKind::IllegalInstruction,
        };

        match on_fault(kind, fault_addr, ctx) {
            Some(resumed) => write_context_to_ucontext(&resumed, uc),
            None => {
                // Not ours: reset the default disposition and return so the
                // re-executed fault terminates with the original signal.
                eprintln!(
                    "[ember-signal] fatal {} at ip={:#x} addr={:#x}",
                    kind.describe(),
                    ctx.ip(),
                    fault_addr
                );
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = libc::SIG_DFL;
                libc::sigaction(sig, &action, std::ptr::null_mut());
            }
        }
    }
}

// =============================================================================
// ucontext mapping
// =============================================================================

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn context_from_ucontext(uc: *const libc::ucontext_t) -> CpuContext {
    let gregs = &(*uc).uc_mcontext.gregs;
    let mut ctx = CpuContext::new();
    for (reg, idx) in LINUX_GREG_MAP {
        ctx.set(reg, gregs[idx as usize] as u64);
    }
    ctx.set_ip(gregs[libc::REG_RIP as usize] as u64);
    ctx
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn write_context_to_ucontext(ctx: &CpuContext, uc: *mut libc::ucontext_t) {
    let gregs = &mut (*uc).uc_mcontext.gregs;
    for (reg, idx) in LINUX_GREG_MAP {
        gregs[idx as usize] = ctx.get(reg) as i64;
    }
    gregs[libc::REG_RIP as usize] = ctx.ip() as i64;
}

/// Register ↔ `gregs` index map for linux-gnu x86-64.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
const LINUX_GREG_MAP: [(Gpr, i32); 16] = [
    (Gpr::Rax, libc::REG_RAX),
    (Gpr::Rcx, libc::REG_RCX),
    (Gpr::Rdx, libc::REG_RDX),
    (Gpr::Rbx, libc::REG_RBX),
    (Gpr::Rsp, libc::REG_RSP),
    (Gpr::Rbp, libc::REG_RBP),
    (Gpr::Rsi, libc::REG_RSI),
    (Gpr::Rdi, libc::REG_RDI),
    (Gpr::R8, libc::REG_R8),
    (Gpr::R9, libc::REG_R9),
    (Gpr::R10, libc::REG_R10),
    (Gpr::R11, libc::REG_R11),
    (Gpr::R12, libc::REG_R12),
    (Gpr::R13, libc::REG_R13),
    (Gpr::R14, libc::REG_R14),
    (Gpr::R15, libc::REG_R15),
];

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn context_from_ucontext(uc: *const libc::ucontext_t) -> CpuContext {
    let ss = &(*(*uc).uc_mcontext).__ss;
    let mut ctx = CpuContext::new();
    ctx.set(Gpr::Rax, ss.__rax);
    ctx.set(Gpr::Rcx, ss.__rcx);
    ctx.set(Gpr::Rdx, ss.__rdx);
    ctx.set(Gpr::Rbx, ss.__rbx);
    ctx.set(Gpr::Rsp, ss.__rsp);
    ctx.set(Gpr::Rbp, ss.__rbp);
    ctx.set(Gpr::Rsi, ss.__rsi);
    ctx.set(Gpr::Rdi, ss.__rdi);
    ctx.set(Gpr::R8, ss.__r8);
    ctx.set(Gpr::R9, ss.__r9);
    ctx.set(Gpr::R10, ss.__r10);
    ctx.set(Gpr::R11, ss.__r11);
    ctx.set(Gpr::R12, ss.__r12);
    ctx.set(Gpr::R13, ss.__r13);
    ctx.set(Gpr::R14, ss.__r14);
    ctx.set(Gpr::R15, ss.__r15);
    ctx.set_ip(ss.__rip);
    ctx
}

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
unsafe fn write_context_to_ucontext(ctx: &CpuContext, uc: *mut libc::ucontext_t) {
    let ss = &mut (*(*uc).uc_mcontext).__ss;
    ss.__rax = ctx.get(Gpr::Rax);
    ss.__rcx = ctx.get(Gpr::Rcx);
    ss.__rdx = ctx.get(Gpr::Rdx);
    ss.__rbx = ctx.get(Gpr::Rbx);
    ss.__rsp = ctx.get(Gpr::Rsp);
    ss.__rbp = ctx.get(Gpr::Rbp);
    ss.__rsi = ctx.get(Gpr::Rsi);
    ss.__rdi = ctx.get(Gpr::Rdi);
    ss.__r8 = ctx.get(Gpr::R8);
    ss.__r9 = ctx.get(Gpr::R9);
    ss.__r10 = ctx.get(Gpr::R10);
    ss.__r11 = ctx.get(Gpr::R11);
    ss.__r12 = ctx.get(Gpr::R12);
    ss.__r13 = ctx.get(Gpr::R13);
    ss.__r14 = ctx.get(Gpr::R14);
    ss.__r15 = ctx.get(Gpr::R15);
    ss.__rip = ctx.ip();
}

// =============================================================================
// Windows Vectored Exception Handler
// =============================================================================

#[cfg(windows)]
#[allow(non_camel_case_types)]
type PVECTORED_EXCEPTION_HANDLER =
    Option<unsafe extern "system" fn(*mut EXCEPTION_POINTERS) -> i32>;

#[cfg(windows)]
#[link(name = "kernel32")]
extern "system" {
    fn AddVectoredExceptionHandler(
        first: u32,
        handler: PVECTORED_EXCEPTION_HANDLER,
    ) -> *mut std::ffi::c_void;
    fn RemoveVectoredExceptionHandler(handle: *mut std::ffi::c_void) -> u32;
}

#[cfg(windows)]
#[repr(C)]
#[allow(non_snake_case)]
struct EXCEPTION_POINTERS {
    ExceptionRecord: *mut EXCEPTION_RECORD,
    ContextRecord: *mut CONTEXT,
}

#[cfg(windows)]
#[repr(C)]
#[allow(non_snake_case)]
struct EXCEPTION_RECORD {
    ExceptionCode: i32, // NTSTATUS is signed
    ExceptionFlags: u32,
    ExceptionRecord: *mut EXCEPTION_RECORD,
    ExceptionAddress: *mut std::ffi::c_void,
    NumberParameters: u32,
    ExceptionInformation: [usize; 15],
}

#[cfg(windows)]
#[repr(C)]
#[allow(non_snake_case)]
struct CONTEXT {
    // Minimal x64 CONTEXT structure - only fields we need
    _padding1: [u8; 0x78], // Offset to Rax
    Rax: u64,
    Rcx: u64,
    Rdx: u64,
    Rbx: u64,
    Rsp: u64,
    Rbp: u64,
    Rsi: u64,
    Rdi: u64,
    R8: u64,
    R9: u64,
    R10: u64,
    R11: u64,
    R12: u64,
    R13: u64,
    R14: u64,
    R15: u64,
    Rip: u64,
    _remainder: [u8; 0x200], // Rest of the structure
}

#[cfg(windows)]
static VEH_HANDLE: AtomicUsize = AtomicUsize::new(0);

#[cfg(windows)]
pub fn install_handlers(deferred: bool) -> Result<(), HandlerError> {
    if HANDLERS_INSTALLED.swap(true, Ordering::AcqRel) {
        return Err(HandlerError::AlreadyInstalled);
    }
    DEFERRED_DELIVERY.store(deferred, Ordering::Release);

    unsafe {
        let handle = AddVectoredExceptionHandler(1, Some(vectored_fault_handler));
        if handle.is_null() {
            HANDLERS_INSTALLED.store(false, Ordering::Release);
            return Err(HandlerError::InstallFailed(
                "AddVectoredExceptionHandler failed".to_string(),
            ));
        }
        VEH_HANDLE.store(handle as usize, Ordering::Release);
    }

    Ok(())
}

#[cfg(windows)]
pub fn uninstall_handlers() -> Result<(), HandlerError> {
    if !HANDLERS_INSTALLED.swap(false, Ordering::AcqRel) {
        return Err(HandlerError::NotInstalled);
    }
    let handle = VEH_HANDLE.swap(0, Ordering::AcqRel);
    if handle != 0 {
        unsafe {
            RemoveVectoredExceptionHandler(handle as *mut _);
        }
    }
    Ok(())
}

/// No alternate stack on Windows; guard-page growth is kernel-managed.
#[cfg(windows)]
pub fn setup_alt_stack() -> Result<(), HandlerError> {
    Ok(())
}

#[cfg(windows)]
unsafe extern "system" fn vectored_fault_handler(exception_info: *mut EXCEPTION_POINTERS) -> i32 {
    const EXCEPTION_ACCESS_VIOLATION: i32 = 0xC0000005u32 as i32;
    const EXCEPTION_ILLEGAL_INSTRUCTION: i32 = 0xC000001Du32 as i32;
    const EXCEPTION_PRIV_INSTRUCTION: i32 = 0xC0000096u32 as i32;
    const EXCEPTION_FLT_DIVIDE_BY_ZERO: i32 = 0xC000008Eu32 as i32;
    const EXCEPTION_INT_DIVIDE_BY_ZERO: i32 = 0xC0000094u32 as i32;
    const EXCEPTION_INT_OVERFLOW: i32 = 0xC0000095u32 as i32;
    const EXCEPTION_STACK_OVERFLOW: i32 = 0xC00000FDu32 as i32;
    const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
    const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

    let record = (*exception_info).ExceptionRecord;
    let context = (*exception_info).ContextRecord;

    let kind = match (*record).ExceptionCode {
        EXCEPTION_ACCESS_VIOLATION => {
            let fault_addr = (*record).ExceptionInformation[1] as u64;
            classify_memory_fault(fault_addr, (*context).Rsp)
        }
        EXCEPTION_STACK_OVERFLOW => FaultKind::StackOverflow,
        EXCEPTION_ILLEGAL_INSTRUCTION | EXCEPTION_PRIV_INSTRUCTION => {
            FaultKind::IllegalInstruction
        }
        EXCEPTION_INT_DIVIDE_BY_ZERO | EXCEPTION_FLT_DIVIDE_BY_ZERO => FaultKind::DivideByZero,
        EXCEPTION_INT_OVERFLOW => FaultKind::Overflow,
        _ => return EXCEPTION_CONTINUE_SEARCH,
    };

    let fault_addr = if (*record).NumberParameters >= 2 {
        (*record).ExceptionInformation[1] as u64
    } else {
        (*record).ExceptionAddress as u64
    };

    let ctx = context_from_winctx(&*context);
    match on_fault(kind, fault_addr, ctx) {
        Some(resumed) => {
            write_context_to_winctx(&resumed, &mut *context);
            EXCEPTION_CONTINUE_EXECUTION
        }
        None => EXCEPTION_CONTINUE_SEARCH,
    }
}

#[cfg(windows)]
fn context_from_winctx(c: &CONTEXT) -> CpuContext {
    let mut ctx = CpuContext::new();
    ctx.set(Gpr::Rax, c.Rax);
    ctx.set(Gpr::Rcx, c.Rcx);
    ctx.set(Gpr::Rdx, c.Rdx);
    ctx.set(Gpr::Rbx, c.Rbx);
    ctx.set(Gpr::Rsp, c.Rsp);
    ctx.set(Gpr::Rbp, c.Rbp);
    ctx.set(Gpr::Rsi, c.Rsi);
    ctx.set(Gpr::Rdi, c.Rdi);
    ctx.set(Gpr::R8, c.R8);
    ctx.set(Gpr::R9, c.R9);
    ctx.set(Gpr::R10, c.R10);
    ctx.set(Gpr::R11, c.R11);
    ctx.set(Gpr::R12, c.R12);
    ctx.set(Gpr::R13, c.R13);
    ctx.set(Gpr::R14, c.R14);
    ctx.set(Gpr::R15, c.R15);
    ctx.set_ip(c.Rip);
    ctx
}

#[cfg(windows)]
fn write_context_to_winctx(ctx: &CpuContext, c: &mut CONTEXT) {
    c.Rax = ctx.get(Gpr::Rax);
    c.Rcx = ctx.get(Gpr::Rcx);
    c.Rdx = ctx.get(Gpr::Rdx);
    c.Rbx = ctx.get(Gpr::Rbx);
    c.Rsp = ctx.get(Gpr::Rsp);
    c.Rbp = ctx.get(Gpr::Rbp);
    c.Rsi = ctx.get(Gpr::Rsi);
    c.Rdi = ctx.get(Gpr::Rdi);
    c.R8 = ctx.get(Gpr::R8);
    c.R9 = ctx.get(Gpr::R9);
    c.R10 = ctx.get(Gpr::R10);
    c.R11 = ctx.get(Gpr::R11);
    c.R12 = ctx.get(Gpr::R12);
    c.R13 = ctx.get(Gpr::R13);
    c.R14 = ctx.get(Gpr::R14);
    c.R15 = ctx.get(Gpr::R15);
    c.Rip = ctx.ip();
}

// =============================================================================
// Tests
// =============================================================================
