//! # Types
//!
//! Platform-agnostic types used throughout the debugger.
//!
//! These types abstract away transport details, allowing the stepping engine
//! and the thread manager to work with concepts like "thread", "stack frame",
//! and "address domain" without knowing how the target is controlled.

pub mod address;
pub mod process;
pub mod registers;
pub mod stack;
pub mod symbols;

// Re-export all public types
pub use address::{AddressDomain, TargetAddress};
pub use process::{ProcessId, ThreadId};
pub use registers::{Register, Registers};
pub use stack::{Backtrace, FrameStatus, StackFrame};
pub use symbols::{MethodInfo, SourceLine, SourceLocation, Symbol};
