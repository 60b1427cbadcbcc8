//! Stepping operations and their in-flight progress.

use std::fmt;

use crate::breakpoints::BreakpointHandle;
use crate::events::StopReason;
use crate::types::{SourceLine, TargetAddress};

/// A stepping request for one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation
{
    /// Execute one machine instruction, entering calls.
    StepInstruction,
    /// Execute one machine instruction, running calls to completion.
    NextInstruction,
    /// Run to the next source line, entering calls into code with line info.
    StepInto,
    /// Run to the next source line in this method, running calls to completion.
    StepOver,
    /// Run until the current method returns to its caller.
    StepOut,
    /// Run until `address` is reached.
    RunTo(TargetAddress),
    /// Run until a breakpoint or signal.
    Continue,
}

/// What a thread's engine is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState
{
    Running,
    Stopped,
    SteppingInstruction,
    SteppingLine,
    SteppingOut,
    /// A stop has been requested (or peers must stop) and has not arrived.
    WaitingForSignal,
    Exited,
}

impl fmt::Display for EngineState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let text = match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::SteppingInstruction => "stepping instruction",
            Self::SteppingLine => "stepping line",
            Self::SteppingOut => "stepping out",
            Self::WaitingForSignal => "waiting for signal",
            Self::Exited => "exited",
        };
        f.write_str(text)
    }
}

/// How the inferior was last resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeMode
{
    Continue,
    Step,
}

/// Internal operation kinds. Startup is driven like a run-to but reports to
/// the session bootstrap instead of the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind
{
    Startup(TargetAddress),
    User(Operation),
}

/// Progress of the operation the engine is executing.
#[derive(Debug)]
pub(crate) struct ActiveOperation
{
    pub kind: OperationKind,
    pub started: bool,
    /// Temporary breakpoint owned by this operation.
    pub temporary: Option<BreakpointHandle>,
    /// Number of times the operation was re-planned.
    pub iterations: usize,
    /// Line being stepped.
    pub line: Option<SourceLine>,
    /// Stack pointer of the frame the operation started in.
    pub frame_sp: Option<TargetAddress>,
    /// Return address of the frame being stepped out of.
    pub return_address: Option<TargetAddress>,
    /// Set after single-stepping into a call; holds the call's return address.
    pub entered_call: Option<TargetAddress>,
}

impl ActiveOperation
{
    pub fn new(kind: OperationKind) -> Self
    {
        Self {
            kind,
            started: false,
            temporary: None,
            iterations: 0,
            line: None,
            frame_sp: None,
            return_address: None,
            entered_call: None,
        }
    }

    pub fn is_startup(&self) -> bool
    {
        matches!(self.kind, OperationKind::Startup(_))
    }

    /// State an engine running this operation reports.
    pub fn state(&self) -> EngineState
    {
        match self.kind {
            OperationKind::User(Operation::StepInstruction | Operation::NextInstruction) => {
                EngineState::SteppingInstruction
            }
            OperationKind::User(Operation::StepInto | Operation::StepOver) => EngineState::SteppingLine,
            OperationKind::User(Operation::StepOut) => EngineState::SteppingOut,
            OperationKind::User(Operation::RunTo(_) | Operation::Continue) | OperationKind::Startup(_) => {
                EngineState::Running
            }
        }
    }
}

/// Next action of an operation after the thread stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan
{
    Done(StopReason),
    Step,
    Continue,
    /// Insert a temporary breakpoint and continue.
    RunTo(TargetAddress),
}
