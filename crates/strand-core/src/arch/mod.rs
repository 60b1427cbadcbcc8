//! # Architecture
//!
//! Instruction decoding and stack unwinding for the stepping engine. An
//! [`Architecture`] answers four kinds of questions about machine code:
//!
//! - Which bytes form a software breakpoint
//! - Whether an instruction is a call, a jump through a table, or a return
//! - Whether a call lands in a runtime trampoline, and for which method
//! - How to recover the caller's frame from a callee's frame
//!
//! All memory reads go through [`TargetMemoryAccess`], so the engine can hand
//! in a view with inserted breakpoints masked out.

pub mod x86_64;

use crate::error::StrandResult;
use crate::inferior::TargetMemoryAccess;
use crate::types::{AddressDomain, FrameStatus, Registers, StackFrame, TargetAddress, ThreadId};

pub use x86_64::X86_64Architecture;

/// Decoded destination of a call or indirect jump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTarget
{
    /// Where control goes. `None` when the instruction was recognized but its
    /// operand could not be evaluated (unknown register, unreadable slot).
    pub target: Option<TargetAddress>,
    /// Length of the call/jump instruction, so `address + size` is the return
    /// address.
    pub instruction_size: usize,
}

/// Machine specific decoding and unwinding.
pub trait Architecture: Send + Sync
{
    fn name(&self) -> &'static str;

    /// Bytes written over an instruction to trap when it is reached.
    fn breakpoint_instruction(&self) -> &'static [u8];

    /// Bytes to rewind the pc by after a software breakpoint trapped.
    fn breakpoint_pc_adjustment(&self) -> u64
    {
        self.breakpoint_instruction().len() as u64
    }

    fn is_return_instruction(&self, memory: &dyn TargetMemoryAccess, address: TargetAddress) -> StrandResult<bool>;

    /// Decode a call at `address`. `None` if the instruction is not a call.
    fn call_target(&self, memory: &dyn TargetMemoryAccess, address: TargetAddress) -> StrandResult<Option<CallTarget>>;

    /// Decode an indirect jump through a table slot at `address`.
    fn jump_target(&self, memory: &dyn TargetMemoryAccess, address: TargetAddress) -> StrandResult<Option<CallTarget>>;

    /// If the code at `call_target` is a stub that jumps into the runtime
    /// trampoline at `trampoline`, return the method-info word it pushes.
    fn trampoline_target(
        &self,
        memory: &dyn TargetMemoryAccess,
        call_target: TargetAddress,
        trampoline: TargetAddress,
    ) -> StrandResult<Option<TargetAddress>>;

    /// Upper bound on prologue bytes the unwinder wants to see.
    fn max_prologue_size(&self) -> usize;

    fn register_names(&self) -> &'static [&'static str];

    fn register_sizes(&self) -> &'static [usize];

    fn register_count(&self) -> usize
    {
        self.register_names().len()
    }

    fn pc_index(&self) -> usize;

    fn sp_index(&self) -> usize;

    fn fp_index(&self) -> usize;

    /// Innermost frame of `thread` from its live registers.
    fn frame_from_registers(&self, thread: ThreadId, registers: Registers, domain: AddressDomain) -> StackFrame
    {
        let pc = registers.value(self.pc_index()).unwrap_or_default();
        let sp = registers.value(self.sp_index()).unwrap_or_default();
        let fp = registers.value(self.fp_index()).unwrap_or_default();
        StackFrame {
            thread,
            level: 0,
            pc: TargetAddress::global(pc),
            sp: TargetAddress::new(domain, sp),
            fp: TargetAddress::new(domain, fp),
            registers,
            symbol: None,
            location: None,
            status: FrameStatus::Live,
        }
    }

    /// Recover the caller of `frame`.
    ///
    /// `code` holds the first bytes of the method `frame` is executing and
    /// `offset` is the distance of `frame.pc` from the method start. Without
    /// code the unwinder falls back to the frame pointer chain.
    ///
    /// ## Errors
    ///
    /// Memory errors while reading saved registers.
    fn unwind_stack(
        &self,
        frame: &StackFrame,
        memory: &dyn TargetMemoryAccess,
        code: Option<&[u8]>,
        offset: usize,
    ) -> StrandResult<Option<StackFrame>>;

    /// Unwind through frames the normal rules do not cover, such as the
    /// kernel's signal return trampoline.
    fn try_special_unwind(&self, frame: &StackFrame, memory: &dyn TargetMemoryAccess)
        -> StrandResult<Option<StackFrame>>;
}
