//! Executable memory and the small x64 emitter the trampolines need.
//!
//! This is not a general assembler: the trampoline builders need exactly
//! the handful of move/push/call forms emitted here, always with 64-bit
//! operands and 32-bit displacements. The buffer follows a W^X model:
//! writable while stubs are emitted, flipped to execute-only once, never
//! written again.

use std::ptr::NonNull;

use crate::context::Gpr;

// =============================================================================
// Platform-specific allocation
// =============================================================================

#[cfg(windows)]
mod platform {
    use std::ptr;
    use windows_sys::Win32::System::Memory::{
        MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READWRITE, VirtualAlloc,
        VirtualFree, VirtualProtect,
    };

    pub const PAGE_SIZE: usize = 4096;

    /// Allocate memory with read-write permissions.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        VirtualAlloc(ptr::null(), size, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE) as *mut u8
    }

    /// Free allocated memory.
    pub unsafe fn free(ptr: *mut u8, _size: usize) {
        VirtualFree(ptr as *mut _, 0, MEM_RELEASE);
    }

    /// Make memory executable (and read-only).
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        let mut old_protect = 0;
        VirtualProtect(ptr as *mut _, size, PAGE_EXECUTE_READ, &mut old_protect) != 0
    }
}

#[cfg(unix)]
mod platform {
    use std::ptr;

    pub const PAGE_SIZE: usize = 4096;

    /// Allocate memory with read-write permissions.
    pub unsafe fn alloc_rw(size: usize) -> *mut u8 {
        let ptr = libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            ptr::null_mut()
        } else {
            ptr as *mut u8
        }
    }

    /// Free allocated memory.
    pub unsafe fn free(ptr: *mut u8, size: usize) {
        libc::munmap(ptr as *mut _, size);
    }

    /// Make memory executable (and read-only).
    pub unsafe fn make_executable(ptr: *mut u8, size: usize) -> bool {
        libc::mprotect(ptr as *mut _, size, libc::PROT_READ | libc::PROT_EXEC) == 0
    }
}

pub use platform::PAGE_SIZE;

// =============================================================================
// StubBuffer
// =============================================================================

/// A page-aligned buffer of runtime-emitted stub code.
pub struct StubBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    len: usize,
    is_executable: bool,
}

impl StubBuffer {
    /// Allocate a writable buffer of at least `min_capacity` bytes, rounded
    /// up to a page.
    pub fn new(min_capacity: usize) -> Option<Self> {
        let capacity = (min_capacity.max(PAGE_SIZE) + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let ptr = unsafe { platform::alloc_rw(capacity) };
        let ptr = NonNull::new(ptr)?;
        Some(StubBuffer {
            ptr,
            capacity,
            len: 0,
            is_executable: false,
        })
    }

    /// Current write position; the entry offset of the next stub.
    #[inline]
    pub fn offset(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.is_executable
    }

    /// Base address of the buffer.
    #[inline]
    pub fn base(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Absolute address of a stub entry offset.
    #[inline]
    pub fn addr_at(&self, offset: usize) -> u64 {
        debug_assert!(offset < self.len);
        self.base() + offset as u64
    }

    /// Bytes written so far.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Write a single byte.
    ///
    /// # Panics
    /// Panics if the buffer is executable or full.
    #[inline]
    pub fn emit_u8(&mut self, byte: u8) {
        assert!(!self.is_executable, "Cannot write to executable buffer");
        assert!(self.len < self.capacity, "Buffer overflow");
        unsafe {
            self.ptr.as_ptr().add(self.len).write(byte);
        }
        self.len += 1;
    }

    /// Write a slice of bytes.
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        assert!(!self.is_executable, "Cannot write to executable buffer");
        assert!(self.len + bytes.len() <= self.capacity, "Buffer overflow");
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(self.len),
                bytes.len(),
            );
        }
        self.len += bytes.len();
    }

    /// Write a little-endian u32.
    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.emit_bytes(&val.to_le_bytes());
    }

    /// Write a little-endian u64.
    #[inline]
    pub fn emit_u64(&mut self, val: u64) {
        self.emit_bytes(&val.to_le_bytes());
    }

    /// Flip the buffer to execute-only. The stubs are immutable afterwards.
    pub fn make_executable(&mut self) -> bool {
        if self.is_executable {
            return true;
        }
        let success = unsafe { platform::make_executable(self.ptr.as_ptr(), self.capacity) };
        if success {
            self.is_executable = true;
        }
        success
    }

    /// Get a function pointer to a stub entry offset.
    ///
    /// # Safety
    /// - The buffer must be executable.
    /// - The code at `offset` must be valid for the signature `F`.
    #[inline]
    pub unsafe fn as_fn_at<F>(&self, offset: usize) -> F
    where
        F: Copy,
    {
        debug_assert!(self.is_executable, "Buffer must be executable");
        debug_assert!(offset < self.len, "Offset out of bounds");
        let ptr = self.ptr.as_ptr().add(offset);
        std::mem::transmute_copy(&ptr)
    }
}

impl Drop for StubBuffer {
    fn drop(&mut self) {
        unsafe {
            platform::free(self.ptr.as_ptr(), self.capacity);
        }
    }
}

// StubBuffer is Send + Sync: after finalization the memory is immutable
// code; during emission it is exclusively owned by the builder.
unsafe impl Send for StubBuffer {}
unsafe impl Sync for StubBuffer {}

// =============================================================================
// x64 emitter
// =============================================================================

/// Fixed-purpose x64 instruction emitter over a [`StubBuffer`].
///
/// Memory forms always use `mod=10` (32-bit displacement) so the encoding
/// is uniform; stub size is irrelevant at this scale.
pub struct Asm<'a> {
    buf: &'a mut StubBuffer,
}

impl<'a> Asm<'a> {
    pub fn new(buf: &'a mut StubBuffer) -> Self {
        Asm { buf }
    }

    /// Current emission offset, for size bookkeeping alongside emission.
    #[inline]
    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    #[inline]
    fn rex(&mut self, w: bool, r: bool, b: bool) {
        let byte = 0x40 | (w as u8) << 3 | (r as u8) << 2 | (b as u8);
        self.buf.emit_u8(byte);
    }

    #[inline]
    fn modrm(&mut self, md: u8, reg: u8, rm: u8) {
        self.buf.emit_u8(md << 6 | reg << 3 | rm);
    }

    /// ModRM + SIB + disp32 for a `[base + disp]` operand.
    fn mem_operand(&mut self, reg_field: u8, base: Gpr, disp: i32) {
        self.modrm(0b10, reg_field, base.low_bits());
        if base.low_bits() == 0b100 {
            // rsp/r12 base needs a SIB byte.
            self.buf.emit_u8(0x24);
        }
        self.buf.emit_u32(disp as u32);
    }

    /// `mov dst, src`
    pub fn mov_reg_reg(&mut self, dst: Gpr, src: Gpr) {
        self.rex(true, src.needs_rex(), dst.needs_rex());
        self.buf.emit_u8(0x89);
        self.modrm(0b11, src.low_bits(), dst.low_bits());
    }

    /// `mov dst, [base + disp]`
    pub fn mov_reg_mem(&mut self, dst: Gpr, base: Gpr, disp: i32) {
        self.rex(true, dst.needs_rex(), base.needs_rex());
        self.buf.emit_u8(0x8b);
        self.mem_operand(dst.low_bits(), base, disp);
    }

    /// `mov [base + disp], src`
    pub fn mov_mem_reg(&mut self, base: Gpr, disp: i32, src: Gpr) {
        self.rex(true, src.needs_rex(), base.needs_rex());
        self.buf.emit_u8(0x89);
        self.mem_operand(src.low_bits(), base, disp);
    }

    /// `mov dst, imm64`
    pub fn mov_reg_imm64(&mut self, dst: Gpr, imm: u64) {
        self.rex(true, false, dst.needs_rex());
        self.buf.emit_u8(0xb8 + dst.low_bits());
        self.buf.emit_u64(imm);
    }

    /// `lea dst, [base + disp]`
    pub fn lea(&mut self, dst: Gpr, base: Gpr, disp: i32) {
        self.rex(true, dst.needs_rex(), base.needs_rex());
        self.buf.emit_u8(0x8d);
        self.mem_operand(dst.low_bits(), base, disp);
    }

    /// `push reg`
    pub fn push(&mut self, reg: Gpr) {
        if reg.needs_rex() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x50 + reg.low_bits());
    }

    /// `pop reg`
    pub fn pop(&mut self, reg: Gpr) {
        if reg.needs_rex() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0x58 + reg.low_bits());
    }

    /// `sub rsp, imm32`
    pub fn sub_rsp(&mut self, imm: u32) {
        self.buf.emit_bytes(&[0x48, 0x81, 0xec]);
        self.buf.emit_u32(imm);
    }

    /// `add rsp, imm32`
    pub fn add_rsp(&mut self, imm: u32) {
        self.buf.emit_bytes(&[0x48, 0x81, 0xc4]);
        self.buf.emit_u32(imm);
    }

    /// `call reg`
    pub fn call_reg(&mut self, reg: Gpr) {
        if reg.needs_rex() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xff);
        self.modrm(0b11, 2, reg.low_bits());
    }

    /// `jmp reg`
    pub fn jmp_reg(&mut self, reg: Gpr) {
        if reg.needs_rex() {
            self.buf.emit_u8(0x41);
        }
        self.buf.emit_u8(0xff);
        self.modrm(0b11, 4, reg.low_bits());
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xc3);
    }

    /// `int3` (reaching one in a stub is a fatal invariant violation)
    pub fn int3(&mut self) {
        self.buf.emit_u8(0xcc);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn emitted(emit: impl FnOnce(&mut Asm<'_>)) -> Vec<u8> {
        let mut buf = StubBuffer::new(PAGE_SIZE).expect("alloc failed");
        emit(&mut Asm::new(&mut buf));
        buf.as_slice().to_vec()
    }

    #[test]
    fn test_mov_reg_reg_encodings() {
        assert_eq!(
            emitted(|a| a.mov_reg_reg(Gpr::R11, Gpr::Rdi)),
            vec![0x49, 0x89, 0xfb]
        );
        assert_eq!(
            emitted(|a| a.mov_reg_reg(Gpr::Rbp, Gpr::Rsp)),
            vec![0x48, 0x89, 0xe5]
        );
        assert_eq!(
            emitted(|a| a.mov_reg_reg(Gpr::Rsp, Gpr::R8)),
            vec![0x4c, 0x89, 0xc4]
        );
    }

    #[test]
    fn test_mov_mem_encodings() {
        // mov rbp, [rdi + 0x28]
        assert_eq!(
            emitted(|a| a.mov_reg_mem(Gpr::Rbp, Gpr::Rdi, 0x28)),
            vec![0x48, 0x8b, 0xaf, 0x28, 0x00, 0x00, 0x00]
        );
        // mov [rsp + 0x30], rax: rsp base takes a SIB byte
        assert_eq!(
            emitted(|a| a.mov_mem_reg(Gpr::Rsp, 0x30, Gpr::Rax)),
            vec![0x48, 0x89, 0x84, 0x24, 0x30, 0x00, 0x00, 0x00]
        );
        // mov r12, [r8 + 8]
        assert_eq!(
            emitted(|a| a.mov_reg_mem(Gpr::R12, Gpr::R8, 8)),
            vec![0x4d, 0x8b, 0xa0, 0x08, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_imm_lea_stack_encodings() {
        let bytes = emitted(|a| a.mov_reg_imm64(Gpr::R11, 0x1122334455667788));
        assert_eq!(&bytes[..2], &[0x49, 0xbb]);
        assert_eq!(&bytes[2..], &0x1122334455667788u64.to_le_bytes());

        // lea rdi, [rsp + 0x30]
        assert_eq!(
            emitted(|a| a.lea(Gpr::Rdi, Gpr::Rsp, 0x30)),
            vec![0x48, 0x8d, 0xbc, 0x24, 0x30, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            emitted(|a| a.sub_rsp(0xb8)),
            vec![0x48, 0x81, 0xec, 0xb8, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_push_pop_call_jmp() {
        assert_eq!(emitted(|a| a.push(Gpr::Rbp)), vec![0x55]);
        assert_eq!(emitted(|a| a.push(Gpr::R15)), vec![0x41, 0x57]);
        assert_eq!(emitted(|a| a.pop(Gpr::Rbx)), vec![0x5b]);
        assert_eq!(emitted(|a| a.call_reg(Gpr::R11)), vec![0x41, 0xff, 0xd3]);
        assert_eq!(emitted(|a| a.jmp_reg(Gpr::R11)), vec![0x41, 0xff, 0xe3]);
        assert_eq!(emitted(|a| a.ret()), vec![0xc3]);
        assert_eq!(emitted(|a| a.int3()), vec![0xcc]);
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn test_emitted_code_executes() {
        let mut buf = StubBuffer::new(PAGE_SIZE).expect("alloc failed");
        // mov eax, 42; ret
        buf.emit_bytes(&[0xb8, 0x2a, 0x00, 0x00, 0x00, 0xc3]);
        assert!(buf.make_executable());

        type Fn = unsafe extern "C" fn() -> i32;
        let f: Fn = unsafe { buf.as_fn_at(0) };
        assert_eq!(unsafe { f() }, 42);
    }

    #[test]
    fn test_buffer_rejects_write_after_finalize() {
        let mut buf = StubBuffer::new(PAGE_SIZE).expect("alloc failed");
        buf.emit_u8(0xc3);
        assert!(buf.make_executable());
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            buf.emit_u8(0x90);
        }));
        assert!(result.is_err());
    }
}
