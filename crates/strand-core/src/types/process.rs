//! Process and thread identifiers.

use std::fmt;

/// Process identifier (PID)
///
/// A PID is a unique number assigned to each running process by the operating
/// system. On Linux the main thread's TID equals the PID.
///
/// ## Example
///
/// ```rust
/// use strand_core::types::ProcessId;
///
/// let pid = ProcessId::from(12345);
/// assert_eq!(u32::from(pid), 12345);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId
{
    fn from(pid: u32) -> Self
    {
        ProcessId(pid)
    }
}

impl From<ProcessId> for u32
{
    fn from(pid: ProcessId) -> Self
    {
        pid.0
    }
}

impl fmt::Display for ProcessId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Native thread identifier
///
/// On Linux this is the kernel TID reported by `waitpid`. Every engine owned by
/// the thread manager is keyed by one of these.
///
/// ## Example
///
/// ```rust
/// use strand_core::types::ThreadId;
///
/// let thread = ThreadId::from(4242);
/// assert_eq!(thread.raw(), 4242);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u64);

impl ThreadId
{
    /// Get the raw `u64` representation of the thread identifier
    #[must_use]
    pub fn raw(&self) -> u64
    {
        self.0
    }
}

impl From<u64> for ThreadId
{
    fn from(value: u64) -> Self
    {
        Self(value)
    }
}

impl From<ProcessId> for ThreadId
{
    fn from(pid: ProcessId) -> Self
    {
        Self(u64::from(pid.0))
    }
}

impl fmt::Display for ThreadId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}
