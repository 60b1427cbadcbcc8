//! Common module for library exports

pub use crate::arch::{Architecture, X86_64Architecture};
pub use crate::breakpoints::{BreakpointHandle, BreakpointScope};
pub use crate::config::{LaunchTarget, SessionConfig, SpawnSpec};
pub use crate::engine::{EngineState, Operation};
pub use crate::error::{StrandError, StrandResult};
pub use crate::events::{DebuggerEvent, StopReason, TargetEvent};
pub use crate::manager::{ManagerState, ProcessHandle, ThreadManager};
#[cfg(target_os = "linux")]
pub use crate::platform::linux::PtraceTransport;
pub use crate::symbols::{NoSymbols, SymbolProvider};
pub use crate::types::{AddressDomain, Backtrace, ProcessId, StackFrame, TargetAddress, ThreadId};
