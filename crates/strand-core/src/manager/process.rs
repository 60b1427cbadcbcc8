//! Front-end handle for one debugged thread.

use std::fmt;
use std::sync::{Arc, Weak};

use super::session::Session;
use crate::breakpoints::{BreakpointHandle, BreakpointInfo, BreakpointScope};
use crate::command::{Command, CommandResult, CommandValue, Query};
use crate::engine::{EngineState, Operation};
use crate::error::{StrandError, StrandResult};
use crate::types::{Backtrace, Registers, StackFrame, TargetAddress, ThreadId};

/// Handle to one thread of the target.
///
/// Handles are cheap to clone and stay valid after the thread exits; commands
/// then fail with [`StrandError::UnknownThread`]. Every method can be called
/// from any thread, including from inside an event observer.
///
/// ## Example
///
/// ```rust,no_run
/// # fn demo(main: strand_core::ProcessHandle) -> strand_core::StrandResult<()> {
/// let frame = main.current_frame()?;
/// println!("stopped at {}", frame.pc);
/// main.step_over()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProcessHandle
{
    thread: ThreadId,
    is_main: bool,
    session: Weak<Session>,
}

impl ProcessHandle
{
    pub(crate) fn new(thread: ThreadId, is_main: bool, session: Weak<Session>) -> Self
    {
        Self {
            thread,
            is_main,
            session,
        }
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId
    {
        self.thread
    }

    #[must_use]
    pub fn is_main(&self) -> bool
    {
        self.is_main
    }

    fn session(&self) -> StrandResult<Arc<Session>>
    {
        self.session.upgrade().ok_or(StrandError::SessionClosed)
    }

    fn query(&self, query: Query) -> StrandResult<CommandValue>
    {
        self.session()?
            .send_sync_command(Command::query(self.thread, query))
            .into_result()
    }

    /// Last state reported by the thread's engine. Never blocks, and works
    /// while another command holds the command mutex.
    ///
    /// ## Errors
    ///
    /// [`StrandError::UnknownThread`] once the thread is gone.
    pub fn state(&self) -> StrandResult<EngineState>
    {
        self.session()?.thread_state(self.thread)
    }

    /// Innermost frame of a stopped thread.
    ///
    /// ## Errors
    ///
    /// [`StrandError::NotStopped`] if the thread runs, [`StrandError::Busy`]
    /// while another command is in flight.
    pub fn current_frame(&self) -> StrandResult<StackFrame>
    {
        match self.query(Query::Frame)? {
            CommandValue::Frame(frame) => Ok(frame),
            other => Err(unexpected("frame", &other)),
        }
    }

    /// Backtrace limited to the session's configured depth.
    ///
    /// ## Errors
    ///
    /// Same as [`ProcessHandle::current_frame`].
    pub fn backtrace(&self) -> StrandResult<Backtrace>
    {
        let max_frames = self.session()?.backtrace_limit();
        self.backtrace_with_limit(max_frames)
    }

    pub fn backtrace_with_limit(&self, max_frames: usize) -> StrandResult<Backtrace>
    {
        match self.query(Query::Backtrace { max_frames })? {
            CommandValue::Backtrace(backtrace) => Ok(backtrace),
            other => Err(unexpected("backtrace", &other)),
        }
    }

    pub fn registers(&self) -> StrandResult<Registers>
    {
        match self.query(Query::Registers)? {
            CommandValue::Registers(registers) => Ok(registers),
            other => Err(unexpected("registers", &other)),
        }
    }

    /// Read target memory. Inserted breakpoints are masked out.
    ///
    /// ## Errors
    ///
    /// [`StrandError::MemoryAccess`] for unreadable ranges.
    pub fn read_memory(&self, address: TargetAddress, len: usize) -> StrandResult<Vec<u8>>
    {
        match self.query(Query::ReadMemory { address, len })? {
            CommandValue::Memory(bytes) => Ok(bytes),
            other => Err(unexpected("memory", &other)),
        }
    }

    pub fn write_memory(&self, address: TargetAddress, data: &[u8]) -> StrandResult<()>
    {
        self.query(Query::WriteMemory {
            address,
            data: data.to_vec(),
        })
        .map(|_| ())
    }

    /// Insert a breakpoint that stops every thread.
    pub fn insert_breakpoint(&self, address: TargetAddress) -> StrandResult<BreakpointHandle>
    {
        self.insert_scoped_breakpoint(address, BreakpointScope::Global)
    }

    /// Insert a breakpoint that only stops this thread.
    pub fn insert_thread_breakpoint(&self, address: TargetAddress) -> StrandResult<BreakpointHandle>
    {
        self.insert_scoped_breakpoint(address, BreakpointScope::Thread(self.thread))
    }

    fn insert_scoped_breakpoint(&self, address: TargetAddress, scope: BreakpointScope) -> StrandResult<BreakpointHandle>
    {
        match self.query(Query::InsertBreakpoint { address, scope })? {
            CommandValue::Breakpoint(handle) => Ok(handle),
            other => Err(unexpected("breakpoint", &other)),
        }
    }

    pub fn remove_breakpoint(&self, handle: BreakpointHandle) -> StrandResult<()>
    {
        self.query(Query::RemoveBreakpoint(handle)).map(|_| ())
    }

    pub fn breakpoints(&self) -> StrandResult<Vec<BreakpointInfo>>
    {
        match self.query(Query::ListBreakpoints)? {
            CommandValue::Breakpoints(list) => Ok(list),
            other => Err(unexpected("breakpoint list", &other)),
        }
    }

    /// Start a stepping operation. Returns once the engine accepted it; the
    /// stop is reported as a [`crate::DebuggerEvent::TargetEvent`].
    ///
    /// ## Errors
    ///
    /// [`StrandError::Busy`] if another command holds the command mutex.
    pub fn step(&self, operation: Operation) -> StrandResult<()>
    {
        let session = self.session()?;
        let permit = session.acquire_command_mutex(self.thread)?;
        session.send_async_command(permit, Command::operation(self.thread, operation))
    }

    pub fn step_instruction(&self) -> StrandResult<()>
    {
        self.step(Operation::StepInstruction)
    }

    pub fn next_instruction(&self) -> StrandResult<()>
    {
        self.step(Operation::NextInstruction)
    }

    pub fn step_into(&self) -> StrandResult<()>
    {
        self.step(Operation::StepInto)
    }

    pub fn step_over(&self) -> StrandResult<()>
    {
        self.step(Operation::StepOver)
    }

    pub fn step_out(&self) -> StrandResult<()>
    {
        self.step(Operation::StepOut)
    }

    pub fn run_to(&self, address: TargetAddress) -> StrandResult<()>
    {
        self.step(Operation::RunTo(address))
    }

    pub fn continue_execution(&self) -> StrandResult<()>
    {
        self.step(Operation::Continue)
    }

    /// Stop the thread. When a stepping operation owns the command mutex the
    /// request is delivered as an interrupt instead.
    pub fn stop(&self) -> StrandResult<()>
    {
        let session = self.session()?;
        match session.send_sync_command(Command::query(self.thread, Query::Stop)) {
            CommandResult::Busy => {
                session.interrupt();
                Ok(())
            }
            result => result.into_result().map(|_| ()),
        }
    }

    pub fn kill(&self) -> StrandResult<()>
    {
        self.query(Query::Kill).map(|_| ())
    }

    /// Detach from the thread; the main thread also restores every breakpoint.
    pub fn detach(&self) -> StrandResult<()>
    {
        self.query(Query::Detach).map(|_| ())
    }
}

impl fmt::Debug for ProcessHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ProcessHandle")
            .field("thread", &self.thread)
            .field("is_main", &self.is_main)
            .finish()
    }
}

impl PartialEq for ProcessHandle
{
    fn eq(&self, other: &Self) -> bool
    {
        self.thread == other.thread && self.session.ptr_eq(&other.session)
    }
}

impl Eq for ProcessHandle {}

fn unexpected(what: &str, value: &CommandValue) -> StrandError
{
    StrandError::Internal(format!("expected {what}, engine returned {value:?}"))
}
