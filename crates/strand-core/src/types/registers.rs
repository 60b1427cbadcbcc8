//! Register snapshots with copy-on-write sharing between frames.

use std::sync::Arc;

use smallvec::SmallVec;

use super::TargetAddress;

/// One register slot in a snapshot
///
/// `valid` is false when the value is unknown for this frame (a caller-saved
/// register after unwinding, for example). `location` records the stack slot
/// the value was restored from, if any, so writes can be routed back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Register
{
    pub valid: bool,
    pub value: u64,
    pub location: Option<TargetAddress>,
}

impl Register
{
    #[must_use]
    pub const fn live(value: u64) -> Self
    {
        Self {
            valid: true,
            value,
            location: None,
        }
    }

    #[must_use]
    pub const fn saved(value: u64, location: TargetAddress) -> Self
    {
        Self {
            valid: true,
            value,
            location: Some(location),
        }
    }
}

/// Register set of one stack frame
///
/// Indexed by the architecture's register numbering (see
/// [`crate::arch::Architecture::register_names`]). Deriving a caller frame's
/// registers from a callee's shares the storage until one side writes, so a
/// deep backtrace does not copy the full set per frame.
///
/// ## Example
///
/// ```rust
/// use strand_core::types::Registers;
///
/// let mut callee = Registers::from_values(&[1, 2, 3]);
/// let caller = callee.derive();
/// callee.set_value(0, 42);
///
/// assert_eq!(callee.value(0), Some(42));
/// assert_eq!(caller.value(0), Some(1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Registers
{
    slots: Arc<SmallVec<[Register; 32]>>,
}

impl Registers
{
    /// A snapshot of `count` registers, all invalid.
    #[must_use]
    pub fn new(count: usize) -> Self
    {
        Self {
            slots: Arc::new(SmallVec::from_elem(Register::default(), count)),
        }
    }

    /// A snapshot where every register is live with the given value.
    #[must_use]
    pub fn from_values(values: &[u64]) -> Self
    {
        Self {
            slots: Arc::new(values.iter().copied().map(Register::live).collect()),
        }
    }

    /// Share this snapshot as the starting point for a caller frame.
    #[must_use]
    pub fn derive(&self) -> Self
    {
        self.clone()
    }

    /// Whether `self` and `other` still point at the same storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool
    {
        Arc::ptr_eq(&self.slots, &other.slots)
    }

    #[must_use]
    pub fn len(&self) -> usize
    {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool
    {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Register>
    {
        self.slots.get(index)
    }

    /// Value of a register, `None` when out of range or invalid.
    #[must_use]
    pub fn value(&self, index: usize) -> Option<u64>
    {
        self.slots.get(index).filter(|reg| reg.valid).map(|reg| reg.value)
    }

    /// Overwrite one slot. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize, register: Register)
    {
        if index < self.slots.len() {
            Arc::make_mut(&mut self.slots)[index] = register;
        }
    }

    pub fn set_value(&mut self, index: usize, value: u64)
    {
        self.set(index, Register::live(value));
    }

    pub fn invalidate(&mut self, index: usize)
    {
        if let Some(reg) = self.slots.get(index) {
            if reg.valid {
                self.set(index, Register::default());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Register>
    {
        self.slots.iter()
    }
}
