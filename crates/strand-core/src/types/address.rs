//! Target addresses tagged with the address domain they belong to.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Sub};

use super::ThreadId;
use crate::error::{StrandError, StrandResult};

/// The address space an address lives in
///
/// Code and heap addresses are shared by every thread of the target and live in
/// the [`AddressDomain::Global`] domain. Stack addresses only make sense
/// relative to the thread that owns the stack, so they are tagged with
/// [`AddressDomain::ThreadLocal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressDomain
{
    /// Shared by all threads (code, heap, globals).
    Global,
    /// Private to one thread's stack.
    ThreadLocal(ThreadId),
}

impl fmt::Display for AddressDomain
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::Global => write!(f, "global"),
            Self::ThreadLocal(thread) => write!(f, "thread {}", thread.raw()),
        }
    }
}

/// Strongly typed target address
///
/// A `(domain, value)` pair. Two addresses can only be ordered or subtracted
/// when they share a domain; [`PartialOrd`] answers `None` across domains and
/// [`TargetAddress::offset_from`] / [`TargetAddress::try_cmp`] return
/// [`StrandError::AddressDomainMismatch`].
///
/// ## Example
///
/// ```rust
/// use strand_core::types::TargetAddress;
///
/// let addr = TargetAddress::global(0x1000);
/// let next = addr + 0x10u64;
/// assert_eq!(next.value(), 0x1010);
/// assert_eq!(next.offset_from(addr).unwrap(), 0x10);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetAddress
{
    domain: AddressDomain,
    value: u64,
}

impl TargetAddress
{
    /// Create an address in the given domain.
    #[must_use]
    pub const fn new(domain: AddressDomain, value: u64) -> Self
    {
        Self { domain, value }
    }

    /// Create an address in the global domain.
    #[must_use]
    pub const fn global(value: u64) -> Self
    {
        Self::new(AddressDomain::Global, value)
    }

    /// Create an address on the stack of `thread`.
    #[must_use]
    pub const fn thread_local(thread: ThreadId, value: u64) -> Self
    {
        Self::new(AddressDomain::ThreadLocal(thread), value)
    }

    #[must_use]
    pub const fn value(self) -> u64
    {
        self.value
    }

    #[must_use]
    pub const fn domain(self) -> AddressDomain
    {
        self.domain
    }

    #[must_use]
    pub const fn is_null(self) -> bool
    {
        self.value == 0
    }

    /// Same numeric value, re-tagged into another domain.
    #[must_use]
    pub const fn with_domain(self, domain: AddressDomain) -> Self
    {
        Self::new(domain, self.value)
    }

    /// Signed distance `self - other`.
    ///
    /// ## Errors
    ///
    /// [`StrandError::AddressDomainMismatch`] if the domains differ.
    pub fn offset_from(self, other: Self) -> StrandResult<i64>
    {
        self.check_domain(other)?;
        Ok(self.value.wrapping_sub(other.value) as i64)
    }

    /// Total comparison within one domain.
    ///
    /// ## Errors
    ///
    /// [`StrandError::AddressDomainMismatch`] if the domains differ.
    pub fn try_cmp(self, other: Self) -> StrandResult<Ordering>
    {
        self.check_domain(other)?;
        Ok(self.value.cmp(&other.value))
    }

    /// `start <= self < end`, false when any domain differs.
    #[must_use]
    pub fn is_within(self, start: Self, end: Self) -> bool
    {
        self.domain == start.domain && self.domain == end.domain && start.value <= self.value && self.value < end.value
    }

    fn check_domain(self, other: Self) -> StrandResult<()>
    {
        if self.domain == other.domain {
            Ok(())
        } else {
            Err(StrandError::AddressDomainMismatch(format!("{self} and {other}")))
        }
    }
}

impl PartialOrd for TargetAddress
{
    fn partial_cmp(&self, other: &Self) -> Option<Ordering>
    {
        (self.domain == other.domain).then(|| self.value.cmp(&other.value))
    }
}

impl fmt::Display for TargetAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self.domain {
            AddressDomain::Global => write!(f, "0x{:x}", self.value),
            AddressDomain::ThreadLocal(thread) => write!(f, "0x{:x}@{}", self.value, thread.raw()),
        }
    }
}

impl fmt::LowerHex for TargetAddress
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.value, f)
    }
}

impl Add<u64> for TargetAddress
{
    type Output = Self;

    fn add(self, offset: u64) -> Self::Output
    {
        Self::new(self.domain, self.value.wrapping_add(offset))
    }
}

impl Add<i64> for TargetAddress
{
    type Output = Self;

    fn add(self, offset: i64) -> Self::Output
    {
        Self::new(self.domain, self.value.wrapping_add_signed(offset))
    }
}

impl Sub<u64> for TargetAddress
{
    type Output = Self;

    fn sub(self, offset: u64) -> Self::Output
    {
        Self::new(self.domain, self.value.wrapping_sub(offset))
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn ordering_is_undefined_across_domains()
    {
        let code = TargetAddress::global(0x1000);
        let stack = TargetAddress::thread_local(ThreadId(7), 0x1000);

        assert_eq!(code.partial_cmp(&stack), None);
        assert!(!(code < stack) && !(code > stack));
        assert!(matches!(code.try_cmp(stack), Err(StrandError::AddressDomainMismatch(_))));
        assert!(matches!(stack.offset_from(code), Err(StrandError::AddressDomainMismatch(_))));
    }

    #[test]
    fn arithmetic_keeps_domain()
    {
        let sp = TargetAddress::thread_local(ThreadId(3), 0x7ff0);
        let up = sp + 16u64;
        assert_eq!(up.domain(), sp.domain());
        assert_eq!(up.offset_from(sp).unwrap(), 16);
        assert_eq!(sp.offset_from(up).unwrap(), -16);
        assert!(sp < up);
    }

    #[test]
    fn is_within_rejects_foreign_domain()
    {
        let start = TargetAddress::global(0x10);
        let end = TargetAddress::global(0x20);
        assert!(TargetAddress::global(0x18).is_within(start, end));
        assert!(!TargetAddress::global(0x20).is_within(start, end));
        assert!(!TargetAddress::thread_local(ThreadId(1), 0x18).is_within(start, end));
    }

    #[test]
    fn display_marks_thread_local()
    {
        assert_eq!(TargetAddress::global(0xabc).to_string(), "0xabc");
        assert_eq!(TargetAddress::thread_local(ThreadId(9), 0x10).to_string(), "0x10@9");
    }
}
