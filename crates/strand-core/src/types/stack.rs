//! Stack frame types.

use std::fmt;

use super::symbols::{SourceLocation, Symbol};
use super::{Registers, TargetAddress, ThreadId};

/// How a frame was reconstructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus
{
    /// Innermost frame, built from live registers.
    Live,
    /// Caller recovered by decoding the callee's prologue.
    Prologue,
    /// Caller recovered by following the saved frame pointer.
    FramePointer,
    /// Caller recovered from a kernel signal frame.
    SignalContext,
}

/// One frame of a thread's call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame
{
    /// Owning thread.
    pub thread: ThreadId,
    /// 0 for the innermost frame.
    pub level: usize,
    /// Program counter (global domain).
    pub pc: TargetAddress,
    /// Stack pointer (thread-local domain).
    pub sp: TargetAddress,
    /// Frame/base pointer (thread-local domain).
    pub fp: TargetAddress,
    pub registers: Registers,
    pub symbol: Option<Symbol>,
    pub location: Option<SourceLocation>,
    pub status: FrameStatus,
}

impl StackFrame
{
    /// Build the frame one level further out, sharing the callee's registers.
    #[must_use]
    pub fn caller(
        &self,
        pc: TargetAddress,
        sp: TargetAddress,
        fp: TargetAddress,
        registers: Registers,
        status: FrameStatus,
    ) -> Self
    {
        Self {
            thread: self.thread,
            level: self.level + 1,
            pc,
            sp,
            fp,
            registers,
            symbol: None,
            location: None,
            status,
        }
    }
}

impl fmt::Display for StackFrame
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{} {}", self.level, self.pc)?;
        if let Some(symbol) = &self.symbol {
            write!(f, " in {symbol}")?;
            if let Ok(offset) = self.pc.offset_from(symbol.address) {
                if offset > 0 {
                    write!(f, "+0x{offset:x}")?;
                }
            }
        }
        if let Some(location) = &self.location {
            write!(f, " at {location}")?;
        }
        Ok(())
    }
}

/// Frames of one thread, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Backtrace
{
    pub frames: Vec<StackFrame>,
}

impl Backtrace
{
    #[must_use]
    pub fn len(&self) -> usize
    {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.frames.is_empty()
    }

    #[must_use]
    pub fn innermost(&self) -> Option<&StackFrame>
    {
        self.frames.first()
    }
}

impl fmt::Display for Backtrace
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        for frame in &self.frames {
            writeln!(f, "{frame}")?;
        }
        Ok(())
    }
}
