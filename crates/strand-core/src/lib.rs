//! # strand-core
//!
//! Stepping engine and inferior-event coordination for a multi-threaded
//! process debugger.
//!
//! This crate provides:
//! - One [`engine::SteppingEngine`] per target thread, running stepping
//!   operations (instruction step, step into/over/out, run to, continue)
//! - A [`ThreadManager`] that serializes target events, synchronous commands
//!   and asynchronous operations on a dedicated engine thread
//! - A global thread lock that stops every thread while one of them steps over
//!   a breakpoint or handles a runtime notification
//! - Breakpoint management with masked memory reads
//! - Frame unwinding on x86-64
//!
//! ## Platform Support
//!
//! - **Linux**: `ptrace` transport in [`platform::linux`]
//! - **Other platforms**: the core compiles without a transport; any
//!   [`InferiorTransport`] implementation can drive a session
//!
//! ## Why unsafe code is needed
//!
//! Spawning a traced child needs `pre_exec`, and stopping a single thread
//! needs the raw `tgkill` syscall. Both are wrapped in safe functions of the
//! Linux transport; nothing else in the crate uses `unsafe`.

#![allow(unsafe_code)] // Required for pre_exec and tgkill in the ptrace transport

pub mod arch;
pub mod breakpoints;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod inferior;
pub mod manager;
pub mod platform;
pub mod prelude;
pub mod symbols;
pub mod thread_lock;
pub mod types;

// Re-export commonly used types
pub use arch::{Architecture, X86_64Architecture};
pub use breakpoints::{BreakpointHandle, BreakpointInfo, BreakpointScope};
pub use command::{Command, CommandPermit, CommandResult, CommandValue, Query};
pub use config::{LaunchTarget, SessionConfig, SpawnSpec};
pub use engine::{EngineState, Operation};
pub use error::{StrandError, StrandResult};
pub use events::{DebuggerEvent, DebuggerEventReceiver, EventObserver, ObserverId, StopReason, TargetEvent};
pub use inferior::{ChildEvent, InferiorConnection, InferiorTransport, TargetMemoryAccess, WaitEvent, WaitOutcome};
pub use manager::{ManagerState, ProcessHandle, ThreadManager};
#[cfg(target_os = "linux")]
pub use platform::linux::PtraceTransport;
pub use symbols::{NoSymbols, SymbolProvider};
pub use types::{Backtrace, ProcessId, Registers, StackFrame, TargetAddress, ThreadId};
