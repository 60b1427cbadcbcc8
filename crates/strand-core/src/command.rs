//! Commands routed to a thread's stepping engine and their results.

use std::fmt;

use crate::breakpoints::{BreakpointHandle, BreakpointInfo, BreakpointScope};
use crate::engine::{EngineState, Operation};
use crate::error::{StrandError, StrandResult};
use crate::types::{Backtrace, Registers, StackFrame, TargetAddress, ThreadId};

/// A request that completes immediately on the engine thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query
{
    /// Engine state, valid for running threads too.
    State,
    /// Innermost frame.
    Frame,
    Backtrace
    {
        max_frames: usize
    },
    Registers,
    ReadMemory
    {
        address: TargetAddress,
        len: usize,
    },
    WriteMemory
    {
        address: TargetAddress,
        data: Vec<u8>,
    },
    InsertBreakpoint
    {
        address: TargetAddress,
        scope: BreakpointScope,
    },
    RemoveBreakpoint(BreakpointHandle),
    ListBreakpoints,
    /// Stop a running thread; the stop is reported as an event.
    Stop,
    Kill,
    Detach,
    /// Take one level of the global thread lock for this thread.
    AcquireThreadLock,
    ReleaseThreadLock,
}

/// What a command asks the engine to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind
{
    Immediate(Query),
    /// A stepping operation; its completion is reported as an event.
    Operation(Operation),
}

/// A command addressed to one thread's engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command
{
    pub thread: ThreadId,
    pub kind: CommandKind,
}

impl Command
{
    #[must_use]
    pub fn query(thread: ThreadId, query: Query) -> Self
    {
        Self {
            thread,
            kind: CommandKind::Immediate(query),
        }
    }

    #[must_use]
    pub fn operation(thread: ThreadId, operation: Operation) -> Self
    {
        Self {
            thread,
            kind: CommandKind::Operation(operation),
        }
    }
}

impl fmt::Display for Command
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match &self.kind {
            CommandKind::Immediate(query) => write!(f, "{query:?} on thread {}", self.thread),
            CommandKind::Operation(op) => write!(f, "{op:?} on thread {}", self.thread),
        }
    }
}

/// Value produced by a successful command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandValue
{
    None,
    State(EngineState),
    Frame(StackFrame),
    Backtrace(Backtrace),
    Registers(Registers),
    Memory(Vec<u8>),
    Breakpoint(BreakpointHandle),
    Breakpoints(Vec<BreakpointInfo>),
}

/// Outcome of a command submitted to the thread manager.
#[derive(Debug)]
pub enum CommandResult
{
    Ok(CommandValue),
    Error(StrandError),
    /// Another command holds the command mutex; nothing was queued.
    Busy,
    /// The command was dropped by a user interrupt before it ran.
    Interrupted,
}

impl CommandResult
{
    #[must_use]
    pub fn is_ok(&self) -> bool
    {
        matches!(self, Self::Ok(_))
    }

    #[must_use]
    pub fn is_busy(&self) -> bool
    {
        matches!(self, Self::Busy)
    }

    /// Collapse into a `Result`, mapping `Busy` and `Interrupted` onto the
    /// matching error variants.
    ///
    /// ## Errors
    ///
    /// Every non-`Ok` outcome.
    pub fn into_result(self) -> StrandResult<CommandValue>
    {
        match self {
            Self::Ok(value) => Ok(value),
            Self::Error(error) => Err(error),
            Self::Busy => Err(StrandError::Busy),
            Self::Interrupted => Err(StrandError::Interrupted),
        }
    }
}

impl From<StrandResult<CommandValue>> for CommandResult
{
    fn from(result: StrandResult<CommandValue>) -> Self
    {
        match result {
            Ok(value) => Self::Ok(value),
            Err(StrandError::Busy) => Self::Busy,
            Err(StrandError::Interrupted) => Self::Interrupted,
            Err(error) => Self::Error(error),
        }
    }
}

/// Proof that the caller holds the command mutex on behalf of `thread`.
///
/// Obtained from [`crate::ThreadManager::acquire_command_mutex`] and consumed
/// by [`crate::ThreadManager::send_async_command`]. The engine releases the
/// mutex when the operation completes. Dropping an unused permit releases it
/// too.
pub struct CommandPermit
{
    pub(crate) thread: ThreadId,
    pub(crate) release: Option<Box<dyn FnOnce() + Send>>,
}

impl CommandPermit
{
    #[must_use]
    pub fn thread(&self) -> ThreadId
    {
        self.thread
    }

    /// Hand ownership of the mutex to the engine.
    pub(crate) fn disarm(mut self)
    {
        self.release = None;
    }
}

impl Drop for CommandPermit
{
    fn drop(&mut self)
    {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for CommandPermit
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("CommandPermit")
            .field("thread", &self.thread)
            .field("armed", &self.release.is_some())
            .finish()
    }
}
