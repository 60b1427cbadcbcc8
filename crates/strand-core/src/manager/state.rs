//! Shared loop state guarded by the session mutex.
//!
//! The slot holds at most one unit of work: either the current event from the
//! wait thread, or the current command from a caller. Installing into an
//! occupied slot is an invariant breach.

use std::fmt;

use crate::command::{Command, CommandResult};
use crate::error::{StrandError, StrandResult};
use crate::inferior::WaitEvent;
use crate::types::ThreadId;

/// What the engine loop is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState
{
    Idle,
    /// Dispatching an event from the wait thread.
    AwaitingEvent,
    /// Executing a blocking command; its caller is parked.
    ServicingSyncCommand,
    /// Handing a stepping operation to an engine.
    ServicingAsyncCommand,
    /// Teardown was requested.
    Aborting,
}

impl fmt::Display for ManagerState
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let text = match self {
            Self::Idle => "idle",
            Self::AwaitingEvent => "awaiting event",
            Self::ServicingSyncCommand => "servicing sync command",
            Self::ServicingAsyncCommand => "servicing async command",
            Self::Aborting => "aborting",
        };
        f.write_str(text)
    }
}

/// Content of the depth-one work queue.
#[derive(Debug)]
pub(crate) enum Work
{
    Event(WaitEvent),
    Command
    {
        command: Command, sync: bool
    },
}

/// Holder of the command mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandOwner
{
    /// A synchronous caller, until its result is posted.
    Sync,
    /// An engine running an asynchronous operation, until it completes.
    Engine(ThreadId),
}

/// Next thing the engine loop services, in priority order.
#[derive(Debug)]
pub(crate) enum Next
{
    Fatal(StrandError),
    Event(WaitEvent),
    /// Interrupt with a not-yet-started command dropped from the slot.
    Interrupt
    {
        dropped: Option<Command>,
        owner: Option<CommandOwner>,
    },
    Abort,
    Kill,
    Command
    {
        command: Command, sync: bool
    },
}

#[derive(Debug)]
pub(crate) struct LoopState
{
    slot: Option<Work>,
    pub phase: ManagerState,
    pub command_owner: Option<CommandOwner>,
    pub command_result: Option<CommandResult>,
    pub interrupt: bool,
    pub kill: bool,
    pub abort: bool,
    pub disposed: bool,
    /// The wait thread may call `global_wait` once more.
    pub wait_armed: bool,
    pub fatal: Option<StrandError>,
}

impl LoopState
{
    pub fn new() -> Self
    {
        Self {
            slot: None,
            phase: ManagerState::Idle,
            command_owner: None,
            command_result: None,
            interrupt: false,
            kill: false,
            abort: false,
            disposed: false,
            wait_armed: false,
            fatal: None,
        }
    }

    pub fn has_event(&self) -> bool
    {
        matches!(self.slot, Some(Work::Event(_)))
    }

    pub fn has_command(&self) -> bool
    {
        matches!(self.slot, Some(Work::Command { .. }))
    }

    /// Install an event from the wait thread.
    ///
    /// ## Errors
    ///
    /// [`StrandError::Internal`] if the slot is occupied.
    pub fn install_event(&mut self, event: WaitEvent) -> StrandResult<()>
    {
        match &self.slot {
            None => {
                self.slot = Some(Work::Event(event));
                Ok(())
            }
            Some(Work::Event(current)) => Err(StrandError::Internal(format!(
                "event {} for thread {} arrived while event {} for thread {} is still pending",
                event.event, event.thread, current.event, current.thread
            ))),
            Some(Work::Command { command, .. }) => Err(StrandError::Internal(format!(
                "event {} for thread {} arrived while command {command} is pending",
                event.event, event.thread
            ))),
        }
    }

    /// Install a command. The caller must have waited for the slot to drain.
    ///
    /// ## Errors
    ///
    /// [`StrandError::Internal`] if the slot is occupied.
    pub fn install_command(&mut self, command: Command, sync: bool) -> StrandResult<()>
    {
        if let Some(current) = &self.slot {
            return Err(StrandError::Internal(format!(
                "command {command} installed while {current:?} is pending"
            )));
        }
        self.slot = Some(Work::Command { command, sync });
        Ok(())
    }

    /// Take the highest-priority pending item: fatal error, event, interrupt,
    /// abort, kill, command.
    pub fn next(&mut self) -> Option<Next>
    {
        if let Some(error) = self.fatal.take() {
            return Some(Next::Fatal(error));
        }
        if self.has_event() {
            if let Some(Work::Event(event)) = self.slot.take() {
                self.phase = ManagerState::AwaitingEvent;
                return Some(Next::Event(event));
            }
        }
        if self.interrupt {
            self.interrupt = false;
            let dropped = match self.slot.take() {
                Some(Work::Command { command, .. }) => Some(command),
                other => {
                    self.slot = other;
                    None
                }
            };
            // A sync caller still draining the slot has nothing installed yet;
            // post its result now so it never installs.
            if dropped.is_none()
                && self.command_owner == Some(CommandOwner::Sync)
                && self.command_result.is_none()
            {
                self.command_result = Some(CommandResult::Interrupted);
            }
            return Some(Next::Interrupt {
                dropped,
                owner: self.command_owner,
            });
        }
        if self.abort {
            self.phase = ManagerState::Aborting;
            return Some(Next::Abort);
        }
        if self.kill {
            self.kill = false;
            return Some(Next::Kill);
        }
        match self.slot.take() {
            Some(Work::Command { command, sync }) => {
                self.phase = if sync {
                    ManagerState::ServicingSyncCommand
                } else {
                    ManagerState::ServicingAsyncCommand
                };
                Some(Next::Command { command, sync })
            }
            other => {
                self.slot = other;
                None
            }
        }
    }

    /// Give up the command mutex if `thread`'s engine holds it.
    pub fn release_engine_owner(&mut self, thread: ThreadId) -> bool
    {
        if self.command_owner == Some(CommandOwner::Engine(thread)) {
            self.command_owner = None;
            true
        } else {
            false
        }
    }
}
