//! # Error Types
//!
//! General error handling for the stepping engine, the thread manager, and the
//! inferior transports.
//!
//! We use `thiserror` to automatically generate `Error` trait implementations
//! and nice error messages.

use thiserror::Error;

use crate::breakpoints::BreakpointHandle;
use crate::types::ThreadId;

/// Main error type for debugger operations
///
/// Each variant corresponds to a specific failure class. The classes matter to
/// callers: some are fatal for the whole session (see [`StrandError::is_fatal`]),
/// the rest are reported back for one command and the session continues.
///
/// ## Error Categories
///
/// 1. **Startup errors**: Startup
/// 2. **Protocol errors**: ProtocolViolation, Internal
/// 3. **State errors**: NotStopped, UnknownThread, UnknownBreakpoint
/// 4. **Command errors**: Busy, Interrupted, UnknownCommand, InvalidArgument
/// 5. **Memory errors**: MemoryAccess, AddressDomainMismatch
/// 6. **Platform errors**: Transport, Nix (Linux), Io
#[derive(Error, Debug)]
pub enum StrandError
{
    /// The target could not be launched or stopped at an unexpected address
    /// while bootstrapping.
    #[error("Failed to start target: {0}")]
    Startup(String),

    /// An event arrived that is not valid in the current session state
    ///
    /// Example: the very first event of a new session must be the initial stop
    /// with signal 0. Anything else means the transport and the engine disagree
    /// about the state of the target.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invariant violated inside the debugger itself
    ///
    /// Examples:
    /// - The wait thread found an event already pending in the work slot
    /// - An event was reported for a thread no engine is registered for
    #[error("Internal error: {0}")]
    Internal(String),

    /// Operation requires the thread to be stopped
    #[error("Thread {0} is not stopped")]
    NotStopped(ThreadId),

    /// Reading or writing target memory failed
    #[error("Cannot access target memory at 0x{address:x}: {reason}")]
    MemoryAccess
    {
        /// Raw address that could not be accessed.
        address: u64,
        /// Human readable reason.
        reason: String,
    },

    /// The inferior server rejected a command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// No engine is registered for this thread
    #[error("Unknown thread: {0}")]
    UnknownThread(ThreadId),

    /// No breakpoint is registered under this handle
    #[error("Unknown breakpoint: {0}")]
    UnknownBreakpoint(BreakpointHandle),

    /// Two addresses from different address domains were compared or subtracted
    #[error("Address domain mismatch: {0}")]
    AddressDomainMismatch(String),

    /// Another command currently owns the command mutex
    #[error("Another command is already running")]
    Busy,

    /// The command was aborted by a user interrupt before it ran
    #[error("Command interrupted")]
    Interrupted,

    /// The session has been disposed or its engine thread is gone
    #[error("Debugger session is closed")]
    SessionClosed,

    /// Invalid argument passed to a debugger function
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure inside the platform transport that is not covered elsewhere
    #[error("Transport error: {0}")]
    Transport(String),

    /// ptrace/waitpid failure (Linux)
    #[cfg(target_os = "linux")]
    #[error("System call failed: {0}")]
    Nix(#[from] nix::Error),

    /// I/O error (for `/proc` access, pipes, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrandError
{
    /// Whether this error ends the whole session.
    ///
    /// Fatal errors are produced by the event machinery itself (a corrupt event
    /// stream or a broken transport). Per-command failures are not fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool
    {
        matches!(self, Self::Internal(_) | Self::ProtocolViolation(_) | Self::Transport(_))
    }

    /// Convenience constructor for [`StrandError::MemoryAccess`].
    pub fn memory(address: u64, reason: impl Into<String>) -> Self
    {
        Self::MemoryAccess {
            address,
            reason: reason.into(),
        }
    }
}

/// Result type alias for debugger operations
pub type StrandResult<T> = std::result::Result<T, StrandError>;
