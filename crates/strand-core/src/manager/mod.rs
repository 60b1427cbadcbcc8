//! # Thread Manager
//!
//! The coordinator of a debugging session. It serializes three streams into a
//! single loop on the engine thread:
//!
//! - target events reported by the transport's global wait (wait thread)
//! - synchronous commands from callers, which block until completed
//! - asynchronous stepping operations, whose completion arrives as events
//!
//! A single slot holds the current event or the current command, and events
//! always win over commands. A command mutex (try-acquire, never blocking)
//! guarantees only one command is in flight.
//!
//! ## Example
//!
//! ```rust,no_run
//! # #[cfg(target_os = "linux")]
//! # fn demo() -> strand_core::StrandResult<()> {
//! use std::sync::Arc;
//!
//! use strand_core::{LaunchTarget, NoSymbols, SessionConfig, SpawnSpec, ThreadManager, X86_64Architecture};
//! use strand_core::platform::linux::PtraceTransport;
//!
//! let manager = ThreadManager::new(
//!     Arc::new(PtraceTransport::new()),
//!     Arc::new(X86_64Architecture),
//!     Arc::new(NoSymbols),
//!     SessionConfig::default(),
//! );
//! let events = manager.subscribe();
//! let main = manager.start_session(LaunchTarget::Spawn(SpawnSpec::new("/bin/true")))?;
//! main.continue_execution()?;
//! for event in events {
//!     println!("{}", event.describe());
//! }
//! # Ok(())
//! # }
//! ```

mod process;
mod session;
mod state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use process::ProcessHandle;
use session::Session;
pub use state::ManagerState;

use crate::arch::Architecture;
use crate::command::{Command, CommandPermit, CommandResult, Query};
use crate::config::{LaunchTarget, SessionConfig};
use crate::error::StrandResult;
use crate::events::{DebuggerEventReceiver, EventObserver, ObserverId};
use crate::inferior::InferiorTransport;
use crate::symbols::SymbolProvider;
use crate::types::ThreadId;

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owner of one debugging session.
///
/// Dropping the manager disposes the session: the target is killed (or
/// detached, see [`SessionConfig::detach_on_dispose`]) and both background
/// threads are joined.
pub struct ThreadManager
{
    session: Arc<Session>,
}

impl ThreadManager
{
    /// Create a manager. Nothing runs until [`ThreadManager::start_session`].
    #[must_use]
    pub fn new(
        transport: Arc<dyn InferiorTransport>,
        architecture: Arc<dyn Architecture>,
        symbols: Arc<dyn SymbolProvider>,
        config: SessionConfig,
    ) -> Self
    {
        Self {
            session: Session::new(transport, architecture, symbols, config),
        }
    }

    /// Launch or attach to the target and block until it reached its
    /// initialization checkpoint: the program's main method when
    /// [`SessionConfig::stop_at_main`] is set, the initial stop otherwise.
    ///
    /// ## Errors
    ///
    /// [`crate::StrandError::Startup`] if the target cannot be created or
    /// stops somewhere unexpected while starting up, plus protocol errors from
    /// a misbehaving transport.
    pub fn start_session(&self, target: LaunchTarget) -> StrandResult<ProcessHandle>
    {
        self.session.start(target)
    }

    /// Run an immediate command and wait for its result.
    ///
    /// Returns [`CommandResult::Busy`] at once if another command holds the
    /// command mutex. Called from the engine thread (an event observer), the
    /// command runs in-line.
    pub fn send_sync_command(&self, command: Command) -> CommandResult
    {
        self.session.send_sync_command(command)
    }

    /// Try to take the command mutex for an asynchronous operation on `thread`.
    ///
    /// ## Errors
    ///
    /// [`crate::StrandError::Busy`] if it is held.
    pub fn acquire_command_mutex(&self, thread: ThreadId) -> StrandResult<CommandPermit>
    {
        self.session.acquire_command_mutex(thread)
    }

    /// Hand a stepping operation to its engine without waiting. The mutex
    /// stays held until the operation reports its stop.
    ///
    /// ## Errors
    ///
    /// [`crate::StrandError::InvalidArgument`] if the permit belongs to another
    /// thread or the command is not an operation.
    pub fn send_async_command(&self, permit: CommandPermit, command: Command) -> StrandResult<()>
    {
        self.session.send_async_command(permit, command)
    }

    /// Take one level of the global thread lock on behalf of `thread`.
    pub fn acquire_global_thread_lock(&self, thread: ThreadId) -> StrandResult<()>
    {
        self.send_sync_command(Command::query(thread, Query::AcquireThreadLock))
            .into_result()
            .map(|_| ())
    }

    pub fn release_global_thread_lock(&self, thread: ThreadId) -> StrandResult<()>
    {
        self.send_sync_command(Command::query(thread, Query::ReleaseThreadLock))
            .into_result()
            .map(|_| ())
    }

    /// Interrupt whatever is in flight: a queued synchronous command fails
    /// with `Interrupted`, a running operation stops.
    pub fn interrupt(&self)
    {
        self.session.interrupt();
    }

    /// Kill the target. Exit events follow.
    pub fn kill(&self)
    {
        self.session.kill();
    }

    /// Tear the session down. Idempotent.
    pub fn dispose(&self)
    {
        self.session.dispose();
    }

    pub fn observe(&self, observer: EventObserver) -> ObserverId
    {
        self.session.hub.observe(observer)
    }

    pub fn unobserve(&self, id: ObserverId) -> bool
    {
        self.session.hub.unobserve(id)
    }

    #[must_use]
    pub fn subscribe(&self) -> DebuggerEventReceiver
    {
        self.session.hub.subscribe()
    }

    /// Every live thread, ordered by id.
    #[must_use]
    pub fn threads(&self) -> Vec<ProcessHandle>
    {
        self.session.threads()
    }

    #[must_use]
    pub fn main_thread(&self) -> Option<ProcessHandle>
    {
        self.session.main_thread()
    }

    #[must_use]
    pub fn state(&self) -> ManagerState
    {
        self.session.manager_state()
    }
}

impl Drop for ThreadManager
{
    fn drop(&mut self)
    {
        self.session.dispose();
    }
}

impl std::fmt::Debug for ThreadManager
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("ThreadManager")
            .field("state", &self.state())
            .field("threads", &self.threads().len())
            .finish()
    }
}
