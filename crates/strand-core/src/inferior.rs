//! # Inferior
//!
//! The boundary between the stepping engine and whatever actually controls the
//! target. A transport launches or attaches to the target and produces one
//! [`InferiorConnection`] per native thread. The thread manager pulls
//! [`WaitEvent`]s out of [`InferiorTransport::global_wait`] on its wait thread
//! and routes them to the engine that owns the reporting thread.
//!
//! ## Thread affinity
//!
//! Connections are created on, and only ever driven from, the engine thread.
//! ptrace requires every request to come from the thread that became the
//! tracer, so `spawn` and `attach` are called there as well. Only
//! `global_wait` and `wake` run on the wait thread.

use std::fmt;
use std::io::Read;

use crate::config::SpawnSpec;
use crate::error::{StrandError, StrandResult};
use crate::types::{AddressDomain, ProcessId, Registers, TargetAddress, ThreadId};

/// Request understood by an inferior server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand
{
    /// Read the current program counter.
    GetPc,
    /// Stop tracing this thread and let it run freely.
    Detach,
    /// Detach and release all transport resources for this thread.
    Shutdown,
    /// Terminate the whole target process.
    Kill,
    /// Resume until the next event.
    Continue,
    /// Execute a single machine instruction.
    Step,
}

/// Reply to a [`ServerCommand`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerReply
{
    Done,
    Pc(u64),
}

/// Asynchronous notification raised by a managed runtime inside the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind
{
    /// The runtime finished its own initialization.
    RuntimeInitialized,
    /// A method was compiled; the argument is its code address.
    MethodCompiled,
    /// A class was loaded; the argument is a runtime handle.
    ClassLoaded,
    Other(u32),
}

impl From<u32> for NotificationKind
{
    fn from(raw: u32) -> Self
    {
        match raw {
            1 => Self::RuntimeInitialized,
            2 => Self::MethodCompiled,
            3 => Self::ClassLoaded,
            other => Self::Other(other),
        }
    }
}

/// Decoded wait status of one native thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent
{
    /// Spurious wakeup, nothing to report. The thread is resumed as it was.
    None,
    /// The thread stopped with `signal`. Signal 0 is the synthetic initial stop.
    Stopped
    {
        signal: i32
    },
    /// The thread exited normally.
    Exited
    {
        code: i32
    },
    /// The thread was terminated by `signal`.
    Signaled
    {
        signal: i32
    },
    /// The reporting thread created `thread`. Both are stopped.
    CreatedThread
    {
        thread: ThreadId
    },
    /// The runtime inside the target raised a notification.
    Notification
    {
        kind: NotificationKind,
        argument: u64,
    },
}

impl ChildEvent
{
    /// Whether the reporting thread is gone after this event.
    #[must_use]
    pub const fn is_exit(&self) -> bool
    {
        matches!(self, Self::Exited { .. } | Self::Signaled { .. })
    }
}

impl fmt::Display for ChildEvent
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::None => write!(f, "no event"),
            Self::Stopped { signal } => write!(f, "stopped (signal {signal})"),
            Self::Exited { code } => write!(f, "exited with code {code}"),
            Self::Signaled { signal } => write!(f, "killed by signal {signal}"),
            Self::CreatedThread { thread } => write!(f, "created thread {thread}"),
            Self::Notification { kind, argument } => write!(f, "runtime notification {kind:?} (0x{argument:x})"),
        }
    }
}

/// An event together with the thread that reported it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitEvent
{
    pub thread: ThreadId,
    pub event: ChildEvent,
}

/// Result of one blocking [`InferiorTransport::global_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome
{
    Event(WaitEvent),
    /// No traced threads are left.
    NoChildren,
    /// [`InferiorTransport::wake`] was called.
    Woken,
}

/// Read (and write) access to target memory and registers
///
/// Architecture decoding and unwinding only need this trait, never the full
/// connection.
pub trait TargetMemoryAccess
{
    /// Read `len` bytes starting at `address`.
    ///
    /// ## Errors
    ///
    /// [`StrandError::MemoryAccess`] if any byte of the range is unreadable.
    fn read_memory(&self, address: TargetAddress, len: usize) -> StrandResult<Vec<u8>>;

    /// Write `data` starting at `address`.
    ///
    /// ## Errors
    ///
    /// [`StrandError::MemoryAccess`] if the range is not writable.
    fn write_memory(&mut self, address: TargetAddress, data: &[u8]) -> StrandResult<()>;

    /// Live registers of the thread this access belongs to.
    ///
    /// ## Errors
    ///
    /// Fails if the thread is running or gone.
    fn registers(&self) -> StrandResult<Registers>;

    /// Domain used for stack addresses read through this access.
    fn local_domain(&self) -> AddressDomain;

    fn target_address_size(&self) -> usize
    {
        8
    }

    fn read_u8(&self, address: TargetAddress) -> StrandResult<u8>
    {
        let bytes = self.read_memory(address, 1)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| StrandError::memory(address.value(), "short read"))
    }

    fn read_u32(&self, address: TargetAddress) -> StrandResult<u32>
    {
        let bytes = self.read_memory(address, 4)?;
        let raw: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StrandError::memory(address.value(), "short read"))?;
        Ok(u32::from_le_bytes(raw))
    }

    fn read_u64(&self, address: TargetAddress) -> StrandResult<u64>
    {
        let bytes = self.read_memory(address, 8)?;
        let raw: [u8; 8] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| StrandError::memory(address.value(), "short read"))?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a pointer and tag it as a global (code or heap) address.
    fn read_global_address(&self, address: TargetAddress) -> StrandResult<TargetAddress>
    {
        Ok(TargetAddress::global(self.read_u64(address)?))
    }

    /// Read a pointer and tag it as a stack address of this thread.
    fn read_local_address(&self, address: TargetAddress) -> StrandResult<TargetAddress>
    {
        Ok(TargetAddress::new(self.local_domain(), self.read_u64(address)?))
    }
}

/// Control connection to one native thread of the target.
pub trait InferiorConnection: TargetMemoryAccess + Send
{
    fn thread_id(&self) -> ThreadId;

    fn process_id(&self) -> ProcessId;

    /// Execute a server command.
    ///
    /// ## Errors
    ///
    /// - [`StrandError::NotStopped`] if the command needs a stopped thread
    /// - [`StrandError::UnknownCommand`] if the server does not implement it
    fn send_command(&mut self, command: ServerCommand) -> StrandResult<ServerReply>;

    fn current_pc(&mut self) -> StrandResult<TargetAddress>
    {
        match self.send_command(ServerCommand::GetPc)? {
            ServerReply::Pc(value) => Ok(TargetAddress::global(value)),
            ServerReply::Done => Err(StrandError::UnknownCommand("GetPc returned no value".to_string())),
        }
    }

    fn set_pc(&mut self, pc: TargetAddress) -> StrandResult<()>;

    /// Signal to deliver on the next resume, `None` to suppress.
    fn set_signal(&mut self, signal: Option<i32>) -> StrandResult<()>;

    /// Ask a running thread to stop. The stop is reported later through
    /// `global_wait` as `Stopped { signal: SIGSTOP }`.
    fn stop(&mut self) -> StrandResult<()>;

    /// Open a connection to a thread this one just created.
    fn create_thread(&self, thread: ThreadId) -> StrandResult<Box<dyn InferiorConnection>>;

    /// Program entry point, if the transport can find it.
    fn entry_address(&self) -> StrandResult<Option<TargetAddress>>;
}

/// A freshly launched (or attached) target.
pub struct SpawnedInferior
{
    pub inferior: Box<dyn InferiorConnection>,
    /// Target stdout, when captured.
    pub stdout: Option<Box<dyn Read + Send>>,
    /// Target stderr, when captured.
    pub stderr: Option<Box<dyn Read + Send>>,
}

impl fmt::Debug for SpawnedInferior
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("SpawnedInferior")
            .field("thread", &self.inferior.thread_id())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Launches targets and multiplexes their wait statuses.
pub trait InferiorTransport: Send + Sync
{
    /// Launch a new target. The first event reported for it afterwards must be
    /// `Stopped { signal: 0 }` on the returned thread.
    fn spawn(&self, spec: &SpawnSpec) -> StrandResult<SpawnedInferior>;

    /// Attach to a running process. Same initial-event contract as `spawn`.
    fn attach(&self, pid: ProcessId) -> StrandResult<SpawnedInferior>;

    /// Block until any traced thread changes state.
    fn global_wait(&self) -> StrandResult<WaitOutcome>;

    /// Make a blocked `global_wait` return [`WaitOutcome::Woken`].
    fn wake(&self);
}
