//! Byte-program unwind metadata for compiled code regions.
//!
//! The JIT records, while emitting a method's prologue, how to get back to
//! the caller's frame from any instruction offset: which register the
//! canonical frame address (CFA) is computed from, its offset, and where
//! each callee-saved register was spilled relative to the CFA. The record
//! is a compact byte program of rows; replaying the rows up to a given
//! instruction offset yields the rules in effect at that offset.
//!
//! Replay is pure: it produces a [`FrameRules`] value describing *where*
//! registers live. Reading the actual stack memory is the unwinder's job.
//!
//! # Program encoding
//!
//! ```text
//! 0x01 <u32 delta>          advance instruction offset
//! 0x02 <u8 reg>             CFA base register
//! 0x03 <i32 offset>         CFA offset from base register
//! 0x04 <u8 reg> <i32 off>   register saved at [CFA + off]
//! 0x05 <u8 reg>             register unchanged in this frame
//! ```
//!
//! All multi-byte fields are little-endian.

use smallvec::SmallVec;

use crate::context::Gpr;

// =============================================================================
// Opcodes
// =============================================================================

const OP_ADVANCE: u8 = 0x01;
const OP_CFA_REGISTER: u8 = 0x02;
const OP_CFA_OFFSET: u8 = 0x03;
const OP_SAVED_REG: u8 = 0x04;
const OP_SAME_VALUE: u8 = 0x05;

/// Return address slot relative to the CFA: the word the `call` pushed.
pub const RETURN_ADDRESS_OFFSET: i64 = -8;

// =============================================================================
// Errors
// =============================================================================

/// Failure while decoding an unwind program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    /// The program ended in the middle of an instruction.
    Truncated,
    /// An opcode byte outside the known set.
    UnknownOpcode(u8),
    /// Replay reached the target offset without a CFA rule being
    /// established. Indicates a malformed or empty prologue description.
    MissingCfaRule,
}

impl std::fmt::Display for ProgramError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgramError::Truncated => write!(f, "unwind program truncated mid-instruction"),
            ProgramError::UnknownOpcode(op) => {
                write!(f, "unknown unwind opcode {op:#04x}")
            }
            ProgramError::MissingCfaRule => {
                write!(f, "unwind program establishes no CFA rule")
            }
        }
    }
}

impl std::error::Error for ProgramError {}

// =============================================================================
// FrameRules
// =============================================================================

/// Recovery rules in effect at one instruction offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRules {
    /// Register the CFA is computed from.
    pub cfa_register: Gpr,
    /// CFA = value of `cfa_register` + this offset.
    pub cfa_offset: i64,
    /// Callee-saved registers spilled in this frame: `(reg, offset)` means
    /// the caller's value lives at `[CFA + offset]`.
    pub saved: SmallVec<[(Gpr, i64); 8]>,
}

impl FrameRules {
    /// Compute the CFA given the current value of the base register.
    #[inline]
    pub fn cfa(&self, base_value: u64) -> u64 {
        base_value.wrapping_add(self.cfa_offset as u64)
    }

    /// Saved-slot address for a register, if this frame spilled it.
    pub fn saved_slot(&self, cfa: u64, reg: Gpr) -> Option<u64> {
        self.saved
            .iter()
            .find(|(r, _)| *r == reg)
            .map(|(_, off)| cfa.wrapping_add(*off as u64))
    }

    /// Address of the return-address slot.
    #[inline]
    pub fn return_address_slot(cfa: u64) -> u64 {
        cfa.wrapping_add(RETURN_ADDRESS_OFFSET as u64)
    }
}

// =============================================================================
// UnwindProgram
// =============================================================================

/// Serialized unwind metadata for one compiled region. Immutable once the
/// region's code is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindProgram {
    bytes: Box<[u8]>,
}

impl UnwindProgram {
    /// Wrap raw program bytes, e.g. loaded from a code-info record.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        UnwindProgram {
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// Raw program bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Replay rows up to (and including) the row covering `ip_offset`,
    /// returning the recovery rules in effect there.
    ///
    /// Rows are cumulative: a register spilled at offset 4 stays spilled for
    /// the rest of the region unless a later `same_value` row retracts it.
    pub fn replay(&self, ip_offset: u32) -> Result<FrameRules, ProgramError> {
        let mut cfa_register: Option<Gpr> = None;
        let mut cfa_offset: i64 = 0;
        let mut saved: SmallVec<[(Gpr, i64); 8]> = SmallVec::new();
        let mut current_offset: u32 = 0;

        let bytes = &self.bytes;
        let mut pos = 0usize;

        while pos < bytes.len() {
            let op = bytes[pos];
            pos += 1;
            match op {
                OP_ADVANCE => {
                    let delta = read_u32(bytes, &mut pos)?;
                    current_offset = current_offset.saturating_add(delta);
                    // Rows past the target offset describe later code.
                    if current_offset > ip_offset {
                        break;
                    }
                }
                OP_CFA_REGISTER => {
                    let reg = read_reg(bytes, &mut pos)?;
                    cfa_register = Some(reg);
                }
                OP_CFA_OFFSET => {
                    cfa_offset = read_i32(bytes, &mut pos)? as i64;
                }
                OP_SAVED_REG => {
                    let reg = read_reg(bytes, &mut pos)?;
                    let off = read_i32(bytes, &mut pos)? as i64;
                    match saved.iter_mut().find(|(r, _)| *r == reg) {
                        Some(entry) => entry.1 = off,
                        None => saved.push((reg, off)),
                    }
                }
                OP_SAME_VALUE => {
                    let reg = read_reg(bytes, &mut pos)?;
                    saved.retain(|(r, _)| *r != reg);
                }
                other => return Err(ProgramError::UnknownOpcode(other)),
            }
        }

        match cfa_register {
            Some(cfa_register) => Ok(FrameRules {
                cfa_register,
                cfa_offset,
                saved,
            }),
            None => Err(ProgramError::MissingCfaRule),
        }
    }
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32, ProgramError> {
    let end = pos.checked_add(4).ok_or(ProgramError::Truncated)?;
    let slice = bytes.get(*pos..end).ok_or(ProgramError::Truncated)?;
    *pos = end;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_i32(bytes: &[u8], pos: &mut usize) -> Result<i32, ProgramError> {
    read_u32(bytes, pos).map(|v| v as i32)
}

fn read_reg(bytes: &[u8], pos: &mut usize) -> Result<Gpr, ProgramError> {
    let byte = *bytes.get(*pos).ok_or(ProgramError::Truncated)?;
    *pos += 1;
    Ok(Gpr::from_encoding(byte))
}

// =============================================================================
// UnwindProgramBuilder
// =============================================================================

/// Incremental builder the JIT drives while emitting a prologue.
///
/// ```
/// use ember_unwind::context::Gpr;
/// use ember_unwind::unwind_info::UnwindProgramBuilder;
///
/// let mut b = UnwindProgramBuilder::new();
/// b.cfa_register(Gpr::Rsp);
/// b.cfa_offset(8); // after the call, before the prologue
/// b.advance(1); // push rbp
/// b.cfa_offset(16);
/// b.saved_reg(Gpr::Rbp, -16);
/// b.advance(3); // mov rbp, rsp
/// b.cfa_register(Gpr::Rbp);
/// let program = b.finish();
/// assert!(program.replay(4).is_ok());
/// ```
#[derive(Debug, Default)]
pub struct UnwindProgramBuilder {
    bytes: Vec<u8>,
    code_offset: u32,
}

impl UnwindProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current instruction offset the next row applies to.
    #[inline]
    pub fn code_offset(&self) -> u32 {
        self.code_offset
    }

    /// Move the row cursor forward by `delta` code bytes.
    pub fn advance(&mut self, delta: u32) -> &mut Self {
        if delta > 0 {
            self.bytes.push(OP_ADVANCE);
            self.bytes.extend_from_slice(&delta.to_le_bytes());
            self.code_offset += delta;
        }
        self
    }

    /// Set the register the CFA is computed from.
    pub fn cfa_register(&mut self, reg: Gpr) -> &mut Self {
        self.bytes.push(OP_CFA_REGISTER);
        self.bytes.push(reg.encoding());
        self
    }

    /// Set the CFA offset from the base register.
    pub fn cfa_offset(&mut self, offset: i32) -> &mut Self {
        self.bytes.push(OP_CFA_OFFSET);
        self.bytes.extend_from_slice(&offset.to_le_bytes());
        self
    }

    /// Record that `reg` was spilled to `[CFA + offset]`.
    pub fn saved_reg(&mut self, reg: Gpr, offset: i32) -> &mut Self {
        self.bytes.push(OP_SAVED_REG);
        self.bytes.push(reg.encoding());
        self.bytes.extend_from_slice(&offset.to_le_bytes());
        self
    }

    /// Record that `reg` holds its caller value again (spill retracted).
    pub fn same_value(&mut self, reg: Gpr) -> &mut Self {
        self.bytes.push(OP_SAME_VALUE);
        self.bytes.push(reg.encoding());
        self
    }

    /// Serialize into an immutable program.
    pub fn finish(self) -> UnwindProgram {
        UnwindProgram {
            bytes: self.bytes.into_boxed_slice(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Standard frame prologue: push rbp; mov rbp, rsp; push rbx.
    fn standard_frame_program() -> UnwindProgram {
        let mut b = UnwindProgramBuilder::new();
        b.cfa_register(Gpr::Rsp);
        b.cfa_offset(8);
        b.advance(1); // after push rbp
        b.cfa_offset(16);
        b.saved_reg(Gpr::Rbp, -16);
        b.advance(3); // after mov rbp, rsp
        b.cfa_register(Gpr::Rbp);
        b.cfa_offset(16);
        b.advance(1); // after push rbx
        b.saved_reg(Gpr::Rbx, -24);
        b.finish()
    }

    #[test]
    fn test_replay_at_function_entry() {
        let program = standard_frame_program();
        let rules = program.replay(0).unwrap();
        assert_eq!(rules.cfa_register, Gpr::Rsp);
        assert_eq!(rules.cfa_offset, 8);
        assert!(rules.saved.is_empty());
    }

    #[test]
    fn test_replay_mid_prologue() {
        let program = standard_frame_program();
        // After push rbp but before mov rbp, rsp.
        let rules = program.replay(1).unwrap();
        assert_eq!(rules.cfa_register, Gpr::Rsp);
        assert_eq!(rules.cfa_offset, 16);
        assert_eq!(rules.saved.as_slice(), &[(Gpr::Rbp, -16)]);
    }

    #[test]
    fn test_replay_in_body() {
        let program = standard_frame_program();
        let rules = program.replay(100).unwrap();
        assert_eq!(rules.cfa_register, Gpr::Rbp);
        assert_eq!(rules.cfa_offset, 16);
        assert_eq!(rules.saved_slot(0x1000, Gpr::Rbp), Some(0x1000 - 16));
        assert_eq!(rules.saved_slot(0x1000, Gpr::Rbx), Some(0x1000 - 24));
        assert_eq!(rules.saved_slot(0x1000, Gpr::R12), None);
    }

    #[test]
    fn test_cfa_and_return_address_math() {
        let rules = FrameRules {
            cfa_register: Gpr::Rbp,
            cfa_offset: 16,
            saved: SmallVec::new(),
        };
        let cfa = rules.cfa(0x7fff_1000);
        assert_eq!(cfa, 0x7fff_1010);
        assert_eq!(FrameRules::return_address_slot(cfa), 0x7fff_1008);
    }

    #[test]
    fn test_same_value_retracts_spill() {
        let mut b = UnwindProgramBuilder::new();
        b.cfa_register(Gpr::Rsp);
        b.cfa_offset(8);
        b.saved_reg(Gpr::R12, -16);
        b.advance(10);
        b.same_value(Gpr::R12);
        let program = b.finish();

        assert_eq!(program.replay(5).unwrap().saved.len(), 1);
        assert!(program.replay(10).unwrap().saved.is_empty());
    }

    #[test]
    fn test_missing_cfa_is_rejected() {
        let mut b = UnwindProgramBuilder::new();
        b.saved_reg(Gpr::Rbx, -8);
        let program = b.finish();
        assert_eq!(program.replay(0), Err(ProgramError::MissingCfaRule));
    }

    #[test]
    fn test_truncated_program_is_rejected() {
        let program = UnwindProgram::from_bytes(vec![OP_ADVANCE, 0x01]);
        assert_eq!(program.replay(0), Err(ProgramError::Truncated));
    }

    #[test]
    fn test_unknown_opcode_is_rejected() {
        let program = UnwindProgram::from_bytes(vec![0x7f]);
        assert_eq!(program.replay(0), Err(ProgramError::UnknownOpcode(0x7f)));
    }
}
