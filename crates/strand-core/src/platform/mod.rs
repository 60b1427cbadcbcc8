//! # Platform-Specific Implementations
//!
//! Transports that implement [`crate::InferiorTransport`] on top of a native
//! debugging API.
//!
//! - **Linux**: `ptrace` for control, `waitpid(-1, __WALL)` as the global
//!   wait, `/proc/<pid>/mem` for memory
//!   - See: [ptrace(2) man page](https://man7.org/linux/man-pages/man2/ptrace.2.html)
//!
//! Other platforms compile the core without a transport; sessions can still be
//! driven by any other [`crate::InferiorTransport`] implementation.

#[cfg(target_os = "linux")]
pub mod linux;
