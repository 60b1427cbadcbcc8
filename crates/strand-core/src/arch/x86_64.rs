//! # x86-64
//!
//! Register layout, call decoding, and prologue based unwinding for x86-64.
//!
//! ## Register Layout
//!
//! Register indices follow the Linux `user_regs_struct` field order so a
//! `PTRACE_GETREGS` block maps onto [`Registers`] one to one.
//!
//! ## Unwinding
//!
//! Frames are recovered by decoding the standard frame-pointer prologue:
//!
//! ```text
//! push %rbp            55
//! mov  %rsp,%rbp       48 89 e5   (or 48 8b ec)
//! push %rbx ...        53 / 41 54 ...
//! ```
//!
//! Depending on how much of the prologue has executed, the return address is
//! at `[rsp]`, `[rsp + 8]`, or `[rbp + 8]`.

use tracing::trace;

use super::{Architecture, CallTarget};
use crate::error::StrandResult;
use crate::inferior::TargetMemoryAccess;
use crate::types::{FrameStatus, Register, Registers, StackFrame, TargetAddress};

/// x86-64 register index, in `user_regs_struct` order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum X86_64Register
{
    R15 = 0,
    R14,
    R13,
    R12,
    Rbp,
    Rbx,
    R11,
    R10,
    R9,
    R8,
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    OrigRax,
    Rip,
    Cs,
    Eflags,
    Rsp,
    Ss,
    FsBase,
    GsBase,
    Ds,
    Es,
    Fs,
    Gs,
}

impl X86_64Register
{
    pub const COUNT: usize = 27;

    #[must_use]
    pub const fn index(self) -> usize
    {
        self as usize
    }
}

const REGISTER_NAMES: [&str; X86_64Register::COUNT] = [
    "r15", "r14", "r13", "r12", "rbp", "rbx", "r11", "r10", "r9", "r8", "rax", "rcx", "rdx", "rsi", "rdi", "orig_rax",
    "rip", "cs", "eflags", "rsp", "ss", "fs_base", "gs_base", "ds", "es", "fs", "gs",
];

const REGISTER_SIZES: [usize; X86_64Register::COUNT] = [8; X86_64Register::COUNT];

/// Registers a callee may clobber; unknown in a caller frame.
const CALLER_SAVED: [X86_64Register; 11] = [
    X86_64Register::Rax,
    X86_64Register::Rcx,
    X86_64Register::Rdx,
    X86_64Register::Rsi,
    X86_64Register::Rdi,
    X86_64Register::R8,
    X86_64Register::R9,
    X86_64Register::R10,
    X86_64Register::R11,
    X86_64Register::OrigRax,
    X86_64Register::Eflags,
];

/// General purpose registers in encoding order: ModRM/SIB fields and
/// `push` opcodes 0x50..=0x57, plus 8 with `REX.B`/`REX.X` or a 0x41 prefix.
const GENERAL: [X86_64Register; 16] = [
    X86_64Register::Rax,
    X86_64Register::Rcx,
    X86_64Register::Rdx,
    X86_64Register::Rbx,
    X86_64Register::Rsp,
    X86_64Register::Rbp,
    X86_64Register::Rsi,
    X86_64Register::Rdi,
    X86_64Register::R8,
    X86_64Register::R9,
    X86_64Register::R10,
    X86_64Register::R11,
    X86_64Register::R12,
    X86_64Register::R13,
    X86_64Register::R14,
    X86_64Register::R15,
];

/// `mov $15, %rax; syscall`, the kernel's `rt_sigreturn` restorer.
const SIGRETURN_CODE: [u8; 9] = [0x48, 0xc7, 0xc0, 0x0f, 0x00, 0x00, 0x00, 0x0f, 0x05];

/// Offset of the saved machine context from `rsp` in a signal frame.
const SIGCONTEXT_OFFSET: u64 = 0x28;

/// Order of the general registers inside the saved signal context.
const SIGCONTEXT_LAYOUT: [X86_64Register; 18] = [
    X86_64Register::R8,
    X86_64Register::R9,
    X86_64Register::R10,
    X86_64Register::R11,
    X86_64Register::R12,
    X86_64Register::R13,
    X86_64Register::R14,
    X86_64Register::R15,
    X86_64Register::Rdi,
    X86_64Register::Rsi,
    X86_64Register::Rbp,
    X86_64Register::Rbx,
    X86_64Register::Rdx,
    X86_64Register::Rax,
    X86_64Register::Rcx,
    X86_64Register::Rsp,
    X86_64Register::Rip,
    X86_64Register::Eflags,
];

/// Length of a runtime method stub: 9 bytes of preamble, `push imm32`, `jmp rel32`.
const TRAMPOLINE_STUB_SIZE: usize = 19;

const MAX_PROLOGUE_SIZE: usize = 50;

/// x86-64 (AMD64, System V) architecture support.
#[derive(Debug, Clone, Copy, Default)]
pub struct X86_64Architecture;

impl X86_64Architecture
{
    #[must_use]
    pub const fn new() -> Self
    {
        Self
    }

    /// Registers of the caller, starting from the callee's with caller-saved
    /// registers invalidated.
    fn caller_registers(frame: &StackFrame) -> Registers
    {
        let mut registers = frame.registers.derive();
        for reg in CALLER_SAVED {
            registers.invalidate(reg.index());
        }
        registers
    }

    /// Caller of a frame whose `push %rbp` has not executed yet.
    fn unwind_at_entry(frame: &StackFrame, memory: &dyn TargetMemoryAccess) -> StrandResult<StackFrame>
    {
        let rip = memory.read_global_address(frame.sp)?;
        let rsp = frame.sp + 8u64;

        let mut registers = Self::caller_registers(frame);
        registers.set(X86_64Register::Rip.index(), Register::saved(rip.value(), frame.sp));
        registers.set_value(X86_64Register::Rsp.index(), rsp.value());

        Ok(frame.caller(rip, rsp, frame.fp, registers, FrameStatus::Prologue))
    }

    /// Caller of a frame that pushed `%rbp` but has not set up its own yet.
    fn unwind_after_push(frame: &StackFrame, memory: &dyn TargetMemoryAccess) -> StrandResult<StackFrame>
    {
        let rbp_slot = frame.sp;
        let rip_slot = frame.sp + 8u64;
        let rbp = memory.read_local_address(rbp_slot)?;
        let rip = memory.read_global_address(rip_slot)?;
        let rsp = frame.sp + 16u64;

        let mut registers = Self::caller_registers(frame);
        registers.set(X86_64Register::Rbp.index(), Register::saved(rbp.value(), rbp_slot));
        registers.set(X86_64Register::Rip.index(), Register::saved(rip.value(), rip_slot));
        registers.set_value(X86_64Register::Rsp.index(), rsp.value());

        Ok(frame.caller(rip, rsp, rbp, registers, FrameStatus::Prologue))
    }

    /// Caller of a frame with an established frame pointer. `code[pos..]` are
    /// the instructions right after `mov %rsp,%rbp`; callee-saved pushes among
    /// them that already executed are restored from their stack slots.
    fn unwind_method(
        frame: &StackFrame,
        memory: &dyn TargetMemoryAccess,
        code: Option<(&[u8], usize, usize)>,
        status: FrameStatus,
    ) -> StrandResult<Option<StackFrame>>
    {
        let rbp = frame.fp;
        if rbp.is_null() {
            return Ok(None);
        }

        let mut registers = Self::caller_registers(frame);

        if let Some((code, mut pos, offset)) = code {
            let executed = code.len().min(offset);
            let mut slot = rbp;
            while pos < executed {
                let (reg, len) = match code[pos] {
                    op @ 0x50..=0x57 => (GENERAL[usize::from(op - 0x50)], 1),
                    0x41 if matches!(code.get(pos + 1), Some(0x50..=0x57)) => {
                        (GENERAL[8 + usize::from(code[pos + 1] - 0x50)], 2)
                    }
                    _ => break,
                };
                slot = slot - 8u64;
                let value = memory.read_u64(slot)?;
                registers.set(reg.index(), Register::saved(value, slot));
                pos += len;
            }
        }

        let rip_slot = rbp + 8u64;
        let saved_rbp = memory.read_local_address(rbp)?;
        let rip = memory.read_global_address(rip_slot)?;
        let rsp = rbp + 16u64;

        registers.set(X86_64Register::Rbp.index(), Register::saved(saved_rbp.value(), rbp));
        registers.set(X86_64Register::Rip.index(), Register::saved(rip.value(), rip_slot));
        registers.set_value(X86_64Register::Rsp.index(), rsp.value());

        Ok(Some(frame.caller(rip, rsp, saved_rbp, registers, status)))
    }

    fn read_prologue(
        frame: &StackFrame,
        memory: &dyn TargetMemoryAccess,
        code: &[u8],
        offset: usize,
    ) -> StrandResult<Option<StackFrame>>
    {
        let length = code.len();
        let mut pos = 0;

        // Alignment padding and inserted breakpoints before the method body.
        while pos < length && (code[pos] == 0x90 || code[pos] == 0xcc) {
            pos += 1;
        }

        if pos >= offset {
            return Self::unwind_at_entry(frame, memory).map(Some);
        }

        if code.get(pos) != Some(&0x55) {
            trace!(pc = %frame.pc, "no push %rbp in prologue");
            return Ok(None);
        }
        pos += 1;

        let mov_rbp_rsp = matches!(code.get(pos..pos + 3), Some([0x48, 0x89, 0xe5] | [0x48, 0x8b, 0xec]));
        if !mov_rbp_rsp {
            // Only valid while still right after the push.
            return if pos >= offset {
                Self::unwind_after_push(frame, memory).map(Some)
            } else {
                Ok(None)
            };
        }

        if offset < pos + 3 {
            return Self::unwind_after_push(frame, memory).map(Some);
        }
        pos += 3;

        Self::unwind_method(frame, memory, Some((code, pos, offset)), FrameStatus::Prologue)
    }

    /// Decode the ModRM operand whose addressing bytes (SIB, displacement)
    /// start at `at`. Returns the operand and the number of those bytes.
    fn decode_operand(memory: &dyn TargetMemoryAccess, at: TargetAddress, rex: u8, modrm: u8)
        -> StrandResult<(Operand, u64)>
    {
        let mode = modrm >> 6;
        let rm = usize::from(modrm & 7);
        let rex_b = if rex & 0x1 == 0 { 0 } else { 8 };
        let rex_x = if rex & 0x2 == 0 { 0 } else { 8 };

        if mode == 3 {
            return Ok((Operand::Register(GENERAL[rm + rex_b]), 0));
        }
        if mode == 0 && rm == 5 {
            let disp = memory.read_u32(at)? as i32;
            return Ok((Operand::RipRelative(i64::from(disp)), 4));
        }

        let mut len = 0u64;
        let (base, index) = if rm == 4 {
            let sib = memory.read_u8(at)?;
            len = 1;
            let index = usize::from((sib >> 3) & 7) + rex_x;
            let scale = 1u64 << (sib >> 6);
            let base = usize::from(sib & 7);
            (
                (mode != 0 || base != 5).then_some(GENERAL[base + rex_b]),
                (index != 4).then_some((GENERAL[index], scale)),
            )
        } else {
            (Some(GENERAL[rm + rex_b]), None)
        };

        let disp = match mode {
            1 => {
                len += 1;
                i64::from(memory.read_u8(at + (len - 1))? as i8)
            }
            2 => {
                len += 4;
                i64::from(memory.read_u32(at + (len - 4))? as i32)
            }
            // Mode 0 with a SIB base of 5 has a disp32 and no base.
            _ if base.is_none() => {
                len += 4;
                i64::from(memory.read_u32(at + (len - 4))? as i32)
            }
            _ => 0,
        };

        Ok((Operand::Memory { base, index, disp }, len))
    }

    /// Value of a memory operand's effective address, if every register it
    /// uses is known.
    fn effective_address(
        registers: &Registers,
        base: Option<X86_64Register>,
        index: Option<(X86_64Register, u64)>,
        disp: i64,
    ) -> Option<u64>
    {
        let base = match base {
            Some(reg) => registers.value(reg.index())?,
            None => 0,
        };
        let index = match index {
            Some((reg, scale)) => registers.value(reg.index())?.wrapping_mul(scale),
            None => 0,
        };
        Some(base.wrapping_add(index).wrapping_add_signed(disp))
    }
}

/// Operand of a ModRM encoded instruction.
#[derive(Debug, Clone, Copy)]
enum Operand
{
    Register(X86_64Register),
    /// `[base + index * scale + disp]`
    Memory
    {
        base: Option<X86_64Register>,
        index: Option<(X86_64Register, u64)>,
        disp: i64,
    },
    /// `[rip + disp]`, relative to the end of the instruction.
    RipRelative(i64),
}

impl Architecture for X86_64Architecture
{
    fn name(&self) -> &'static str
    {
        "x86_64"
    }

    fn breakpoint_instruction(&self) -> &'static [u8]
    {
        &[0xcc]
    }

    fn is_return_instruction(&self, memory: &dyn TargetMemoryAccess, address: TargetAddress) -> StrandResult<bool>
    {
        Ok(memory.read_u8(address)? == 0xc3)
    }

    fn call_target(&self, memory: &dyn TargetMemoryAccess, address: TargetAddress) -> StrandResult<Option<CallTarget>>
    {
        let first = memory.read_u8(address)?;
        let (rex, pos) = if (0x40..=0x4f).contains(&first) { (first, 1u64) } else { (0, 0) };
        let opcode = if pos == 0 { first } else { memory.read_u8(address + pos)? };

        if opcode == 0xe8 {
            let disp = memory.read_u32(address + (pos + 1))? as i32;
            let size = pos + 5;
            return Ok(Some(CallTarget {
                target: Some(address + size + i64::from(disp)),
                instruction_size: size as usize,
            }));
        }

        if opcode != 0xff {
            return Ok(None);
        }

        let modrm = memory.read_u8(address + (pos + 1))?;
        // ff /2 is `call r/m64`.
        if modrm & 0x38 != 0x10 {
            return Ok(None);
        }

        let (operand, operand_len) = Self::decode_operand(memory, address + (pos + 2), rex, modrm)?;
        let size = pos + 2 + operand_len;

        let slot = match operand {
            Operand::Register(reg) => {
                let target = memory.registers()?.value(reg.index()).map(TargetAddress::global);
                return Ok(Some(CallTarget {
                    target,
                    instruction_size: size as usize,
                }));
            }
            Operand::RipRelative(disp) => Some(address + size + disp),
            Operand::Memory { base, index, disp } => {
                Self::effective_address(&memory.registers()?, base, index, disp).map(TargetAddress::global)
            }
        };

        let target = slot.and_then(|slot| memory.read_global_address(slot).ok());
        if target.is_none() {
            trace!(%address, "call through an unresolvable slot");
        }
        Ok(Some(CallTarget {
            target,
            instruction_size: size as usize,
        }))
    }

    fn jump_target(&self, memory: &dyn TargetMemoryAccess, address: TargetAddress) -> StrandResult<Option<CallTarget>>
    {
        if memory.read_u8(address)? != 0xff {
            return Ok(None);
        }

        let slot = match memory.read_u8(address + 1u64)? {
            // jmp *disp32(%rip)
            0x25 => {
                let disp = memory.read_u32(address + 2u64)? as i32;
                address + 6u64 + i64::from(disp)
            }
            // jmp *disp32(%rbx)
            0xa3 => {
                let disp = memory.read_u32(address + 2u64)? as i32;
                let Some(rbx) = memory.registers()?.value(X86_64Register::Rbx.index()) else {
                    return Ok(None);
                };
                TargetAddress::global(rbx) + i64::from(disp)
            }
            _ => return Ok(None),
        };

        Ok(Some(CallTarget {
            target: Some(memory.read_global_address(slot)?),
            instruction_size: 6,
        }))
    }

    fn trampoline_target(
        &self,
        memory: &dyn TargetMemoryAccess,
        call_target: TargetAddress,
        trampoline: TargetAddress,
    ) -> StrandResult<Option<TargetAddress>>
    {
        let Ok(code) = memory.read_memory(call_target, TRAMPOLINE_STUB_SIZE) else {
            return Ok(None);
        };
        if code.len() < TRAMPOLINE_STUB_SIZE || code[9] != 0x68 || code[14] != 0xe9 {
            return Ok(None);
        }

        let method_info = u32::from_le_bytes([code[10], code[11], code[12], code[13]]);
        let disp = i32::from_le_bytes([code[15], code[16], code[17], code[18]]);

        if call_target + TRAMPOLINE_STUB_SIZE as u64 + i64::from(disp) != trampoline {
            return Ok(None);
        }

        Ok(Some(TargetAddress::global(u64::from(method_info))))
    }

    fn max_prologue_size(&self) -> usize
    {
        MAX_PROLOGUE_SIZE
    }

    fn register_names(&self) -> &'static [&'static str]
    {
        &REGISTER_NAMES
    }

    fn register_sizes(&self) -> &'static [usize]
    {
        &REGISTER_SIZES
    }

    fn pc_index(&self) -> usize
    {
        X86_64Register::Rip.index()
    }

    fn sp_index(&self) -> usize
    {
        X86_64Register::Rsp.index()
    }

    fn fp_index(&self) -> usize
    {
        X86_64Register::Rbp.index()
    }

    fn unwind_stack(
        &self,
        frame: &StackFrame,
        memory: &dyn TargetMemoryAccess,
        code: Option<&[u8]>,
        offset: usize,
    ) -> StrandResult<Option<StackFrame>>
    {
        if let Some(code) = code {
            if let Some(caller) = Self::read_prologue(frame, memory, code, offset)? {
                return Ok(Some(caller));
            }
        }
        Self::unwind_method(frame, memory, None, FrameStatus::FramePointer)
    }

    fn try_special_unwind(&self, frame: &StackFrame, memory: &dyn TargetMemoryAccess)
        -> StrandResult<Option<StackFrame>>
    {
        let Ok(code) = memory.read_memory(frame.pc, SIGRETURN_CODE.len()) else {
            return Ok(None);
        };
        if code != SIGRETURN_CODE {
            return Ok(None);
        }

        let context = frame.sp + SIGCONTEXT_OFFSET;
        let mut registers = frame.registers.derive();
        for (index, reg) in SIGCONTEXT_LAYOUT.iter().enumerate() {
            let slot = context + (index as u64) * 8;
            let value = memory.read_u64(slot)?;
            registers.set(reg.index(), Register::saved(value, slot));
        }

        let pc = TargetAddress::global(registers.value(X86_64Register::Rip.index()).unwrap_or_default());
        let domain = frame.sp.domain();
        let sp = TargetAddress::new(domain, registers.value(X86_64Register::Rsp.index()).unwrap_or_default());
        let fp = TargetAddress::new(domain, registers.value(X86_64Register::Rbp.index()).unwrap_or_default());

        Ok(Some(frame.caller(pc, sp, fp, registers, FrameStatus::SignalContext)))
    }
}

#[cfg(test)]
mod tests
{
    use std::collections::HashMap;

    use super::*;
    use crate::error::StrandError;
    use crate::types::{AddressDomain, ThreadId};

    const THREAD: ThreadId = ThreadId(11);

    struct FakeMemory
    {
        bytes: HashMap<u64, u8>,
        registers: Registers,
    }

    impl FakeMemory
    {
        fn new() -> Self
        {
            Self {
                bytes: HashMap::new(),
                registers: Registers::new(X86_64Register::COUNT),
            }
        }

        fn put(&mut self, address: u64, data: &[u8])
        {
            for (i, byte) in data.iter().enumerate() {
                self.bytes.insert(address + i as u64, *byte);
            }
        }

        fn put_u64(&mut self, address: u64, value: u64)
        {
            self.put(address, &value.to_le_bytes());
        }
    }

    impl TargetMemoryAccess for FakeMemory
    {
        fn read_memory(&self, address: TargetAddress, len: usize) -> StrandResult<Vec<u8>>
        {
            (0..len as u64)
                .map(|i| {
                    self.bytes
                        .get(&(address.value() + i))
                        .copied()
                        .ok_or_else(|| StrandError::memory(address.value() + i, "unmapped"))
                })
                .collect()
        }

        fn write_memory(&mut self, address: TargetAddress, data: &[u8]) -> StrandResult<()>
        {
            self.put(address.value(), data);
            Ok(())
        }

        fn registers(&self) -> StrandResult<Registers>
        {
            Ok(self.registers.clone())
        }

        fn local_domain(&self) -> AddressDomain
        {
            AddressDomain::ThreadLocal(THREAD)
        }
    }

    fn frame(pc: u64, sp: u64, fp: u64) -> StackFrame
    {
        let mut registers = Registers::new(X86_64Register::COUNT);
        registers.set_value(X86_64Register::Rip.index(), pc);
        registers.set_value(X86_64Register::Rsp.index(), sp);
        registers.set_value(X86_64Register::Rbp.index(), fp);
        registers.set_value(X86_64Register::Rbx.index(), 0xb0b);
        registers.set_value(X86_64Register::Rax.index(), 0xa0a);
        X86_64Architecture.frame_from_registers(THREAD, registers, AddressDomain::ThreadLocal(THREAD))
    }

    const PROLOGUE: [u8; 8] = [0x55, 0x48, 0x89, 0xe5, 0x53, 0x90, 0x5b, 0xc3];

    #[test]
    fn unwind_after_push_rbp_matches_hand_computed_frame()
    {
        let mut memory = FakeMemory::new();
        memory.put_u64(0x7000, 0x7100); // saved rbp
        memory.put_u64(0x7008, 0x4005); // return address

        // pc is one byte into the method: push %rbp executed, mov not yet.
        let callee = frame(0x4101, 0x7000, 0x6ff0);
        let caller = X86_64Architecture
            .unwind_stack(&callee, &memory, Some(&PROLOGUE), 1)
            .unwrap()
            .unwrap();

        assert_eq!(caller.level, 1);
        assert_eq!(caller.pc, TargetAddress::global(0x4005));
        assert_eq!(caller.fp, TargetAddress::thread_local(THREAD, 0x7100));
        assert_eq!(caller.sp, TargetAddress::thread_local(THREAD, 0x7010));
        assert_eq!(caller.registers.value(X86_64Register::Rbx.index()), Some(0xb0b));
        assert_eq!(caller.registers.value(X86_64Register::Rax.index()), None);
        assert_eq!(
            caller.registers.get(X86_64Register::Rbp.index()).and_then(|r| r.location),
            Some(TargetAddress::thread_local(THREAD, 0x7000))
        );
    }

    #[test]
    fn unwind_at_entry_reads_return_address_from_stack_top()
    {
        let mut memory = FakeMemory::new();
        memory.put_u64(0x7000, 0x4005);

        let callee = frame(0x4100, 0x7000, 0x7100);
        let caller = X86_64Architecture
            .unwind_stack(&callee, &memory, Some(&PROLOGUE), 0)
            .unwrap()
            .unwrap();

        assert_eq!(caller.pc, TargetAddress::global(0x4005));
        assert_eq!(caller.sp, TargetAddress::thread_local(THREAD, 0x7008));
        assert_eq!(caller.fp, callee.fp);
    }

    #[test]
    fn unwind_in_body_restores_callee_saved_push()
    {
        let mut memory = FakeMemory::new();
        // Frame set up: rbp = 0x7000, rbx pushed at 0x6ff8.
        memory.put_u64(0x7000, 0x7200);
        memory.put_u64(0x7008, 0x4005);
        memory.put_u64(0x6ff8, 0x1234);

        let callee = frame(0x4105, 0x6ff8, 0x7000);
        let caller = X86_64Architecture
            .unwind_stack(&callee, &memory, Some(&PROLOGUE), 5)
            .unwrap()
            .unwrap();

        assert_eq!(caller.pc, TargetAddress::global(0x4005));
        assert_eq!(caller.fp, TargetAddress::thread_local(THREAD, 0x7200));
        assert_eq!(caller.sp, TargetAddress::thread_local(THREAD, 0x7010));
        assert_eq!(caller.registers.value(X86_64Register::Rbx.index()), Some(0x1234));
        assert_eq!(caller.status, FrameStatus::Prologue);
    }

    #[test]
    fn unwind_without_code_follows_frame_pointer()
    {
        let mut memory = FakeMemory::new();
        memory.put_u64(0x7000, 0x7200);
        memory.put_u64(0x7008, 0x4005);

        let callee = frame(0x9999, 0x6f00, 0x7000);
        let caller = X86_64Architecture.unwind_stack(&callee, &memory, None, 0).unwrap().unwrap();

        assert_eq!(caller.pc, TargetAddress::global(0x4005));
        assert_eq!(caller.status, FrameStatus::FramePointer);
        assert!(X86_64Architecture
            .unwind_stack(&frame(0x9999, 0x6f00, 0), &memory, None, 0)
            .unwrap()
            .is_none());
    }

    #[test]
    fn decodes_relative_call()
    {
        let mut memory = FakeMemory::new();
        // call +0x10
        memory.put(0x1000, &[0xe8, 0x10, 0x00, 0x00, 0x00]);
        let call = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(call.target, Some(TargetAddress::global(0x1015)));
        assert_eq!(call.instruction_size, 5);

        // call -0x20
        memory.put(0x2000, &(-0x20i32).to_le_bytes());
        memory.put(0x1fff, &[0xe8]);
        let back = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1fff))
            .unwrap()
            .unwrap();
        assert_eq!(back.target, Some(TargetAddress::global(0x1fe4)));
    }

    #[test]
    fn decodes_register_indirect_calls()
    {
        let mut memory = FakeMemory::new();
        memory.registers.set_value(X86_64Register::Rax.index(), 0x5000);
        memory.registers.set_value(X86_64Register::R11.index(), 0x6000);
        memory.put_u64(0x5008, 0x7777);

        // call *%rax
        memory.put(0x1000, &[0xff, 0xd0]);
        let direct = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(direct.target, Some(TargetAddress::global(0x5000)));
        assert_eq!(direct.instruction_size, 2);

        // call *0x8(%rax)
        memory.put(0x1100, &[0xff, 0x50, 0x08]);
        let indirect = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1100))
            .unwrap()
            .unwrap();
        assert_eq!(indirect.target, Some(TargetAddress::global(0x7777)));
        assert_eq!(indirect.instruction_size, 3);

        // call *%r11
        memory.put(0x1200, &[0x49, 0xff, 0xd3]);
        let high = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1200))
            .unwrap()
            .unwrap();
        assert_eq!(high.target, Some(TargetAddress::global(0x6000)));
        assert_eq!(high.instruction_size, 3);

        // jmp *%rax is not a call
        memory.put(0x1300, &[0xff, 0xe0]);
        assert!(X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1300))
            .unwrap()
            .is_none());
    }

    #[test]
    fn decodes_pic_and_extended_register_calls()
    {
        let mut memory = FakeMemory::new();
        memory.registers.set_value(X86_64Register::R12.index(), 0x6100);
        memory.registers.set_value(X86_64Register::Rax.index(), 2);

        // call *0x1000(%rip): GOT slot at 0x1006 + 0x1000
        memory.put(0x1000, &[0xff, 0x15, 0x00, 0x10, 0x00, 0x00]);
        memory.put_u64(0x2006, 0x4444);
        let got = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(got.target, Some(TargetAddress::global(0x4444)));
        assert_eq!(got.instruction_size, 6);

        // call *%r12
        memory.put(0x1100, &[0x41, 0xff, 0xd4]);
        let r12 = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1100))
            .unwrap()
            .unwrap();
        assert_eq!(r12.target, Some(TargetAddress::global(0x6100)));
        assert_eq!(r12.instruction_size, 3);

        // call *0x3000(,%rax,8)
        memory.put(0x1200, &[0xff, 0x14, 0xc5, 0x00, 0x30, 0x00, 0x00]);
        memory.put_u64(0x3010, 0x5555);
        let table = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1200))
            .unwrap()
            .unwrap();
        assert_eq!(table.target, Some(TargetAddress::global(0x5555)));
        assert_eq!(table.instruction_size, 7);
    }

    #[test]
    fn unresolvable_calls_still_report_their_length()
    {
        let mut memory = FakeMemory::new();

        // call *%rcx with rcx unknown
        memory.put(0x1000, &[0xff, 0xd1]);
        let unknown = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1000))
            .unwrap()
            .unwrap();
        assert_eq!(unknown.target, None);
        assert_eq!(unknown.instruction_size, 2);

        // call *0x10(%rip) through an unmapped slot
        memory.put(0x1100, &[0xff, 0x15, 0x10, 0x00, 0x00, 0x00]);
        let unmapped = X86_64Architecture
            .call_target(&memory, TargetAddress::global(0x1100))
            .unwrap()
            .unwrap();
        assert_eq!(unmapped.target, None);
        assert_eq!(unmapped.instruction_size, 6);
    }

    #[test]
    fn decodes_returns_and_table_jumps()
    {
        let mut memory = FakeMemory::new();
        memory.put(0x1000, &[0xc3, 0x90]);
        assert!(X86_64Architecture
            .is_return_instruction(&memory, TargetAddress::global(0x1000))
            .unwrap());
        assert!(!X86_64Architecture
            .is_return_instruction(&memory, TargetAddress::global(0x1001))
            .unwrap());

        // jmp *0x20(%rip), a PLT entry
        memory.put(0x1100, &[0xff, 0x25, 0x20, 0x00, 0x00, 0x00]);
        memory.put_u64(0x1126, 0x8888);
        let plt = X86_64Architecture
            .jump_target(&memory, TargetAddress::global(0x1100))
            .unwrap()
            .unwrap();
        assert_eq!(plt.target, Some(TargetAddress::global(0x8888)));
        assert_eq!(plt.instruction_size, 6);

        // a call is not a jump
        memory.put(0x1200, &[0xff, 0x15, 0x00, 0x00, 0x00, 0x00]);
        assert!(X86_64Architecture
            .jump_target(&memory, TargetAddress::global(0x1200))
            .unwrap()
            .is_none());
    }

    #[test]
    fn recognizes_trampoline_stub()
    {
        let mut memory = FakeMemory::new();
        let stub = 0x3000u64;
        let trampoline = 0x9000u64;
        let mut code = vec![0x90; 9];
        code.push(0x68);
        code.extend_from_slice(&0xabcdu32.to_le_bytes());
        code.push(0xe9);
        let disp = (trampoline - (stub + 19)) as i32;
        code.extend_from_slice(&disp.to_le_bytes());
        memory.put(stub, &code);

        let info = X86_64Architecture
            .trampoline_target(&memory, TargetAddress::global(stub), TargetAddress::global(trampoline))
            .unwrap();
        assert_eq!(info, Some(TargetAddress::global(0xabcd)));

        let other = X86_64Architecture
            .trampoline_target(&memory, TargetAddress::global(stub), TargetAddress::global(0x9100))
            .unwrap();
        assert_eq!(other, None);
    }

    #[test]
    fn sigreturn_frame_restores_saved_context()
    {
        let mut memory = FakeMemory::new();
        memory.put(0x2000, &SIGRETURN_CODE);
        let context = 0x7000 + SIGCONTEXT_OFFSET;
        for (index, _) in SIGCONTEXT_LAYOUT.iter().enumerate() {
            memory.put_u64(context + index as u64 * 8, 0x100 + index as u64);
        }

        let callee = frame(0x2000, 0x7000, 0);
        let caller = X86_64Architecture.try_special_unwind(&callee, &memory).unwrap().unwrap();

        // rip is the 17th entry, rsp the 16th, rbp the 11th.
        assert_eq!(caller.pc, TargetAddress::global(0x110));
        assert_eq!(caller.sp, TargetAddress::thread_local(THREAD, 0x10f));
        assert_eq!(caller.fp, TargetAddress::thread_local(THREAD, 0x10a));
        assert_eq!(caller.status, FrameStatus::SignalContext);
    }

    #[test]
    fn register_tables_are_consistent()
    {
        let arch = X86_64Architecture;
        assert_eq!(arch.register_count(), X86_64Register::COUNT);
        assert_eq!(arch.register_names()[arch.pc_index()], "rip");
        assert_eq!(arch.register_names()[arch.sp_index()], "rsp");
        assert_eq!(arch.register_names()[arch.fp_index()], "rbp");
        assert!(arch.register_sizes().iter().all(|size| *size == 8));
    }
}
