//! Software breakpoint bookkeeping.
//!
//! All threads of a target share one address space, so breakpoints are tracked
//! per address ("site"), not per thread. A site is patched when the first
//! breakpoint at that address is inserted and restored when the last one is
//! removed. Each inserted breakpoint gets its own [`BreakpointHandle`], carries
//! a scope (every thread, or just one), and a kind (user breakpoint, or a
//! temporary one owned by a stepping operation).
//!
//! The manager never holds a connection itself; callers pass in the memory
//! access of whichever engine is doing the work.

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::{StrandError, StrandResult};
use crate::inferior::TargetMemoryAccess;
use crate::types::{AddressDomain, Registers, TargetAddress, ThreadId};

/// Unique identifier for a breakpoint managed by the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointHandle(u64);

impl BreakpointHandle
{
    /// Create a new identifier from a raw value.
    #[must_use]
    pub const fn from_raw(value: u64) -> Self
    {
        Self(value)
    }

    /// Get the raw numeric representation (useful for logging / errors).
    #[must_use]
    pub const fn raw(self) -> u64
    {
        self.0
    }
}

impl fmt::Display for BreakpointHandle
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "#{}", self.0)
    }
}

/// Which threads a breakpoint stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointScope
{
    Global,
    Thread(ThreadId),
}

impl BreakpointScope
{
    #[must_use]
    pub fn applies_to(self, thread: ThreadId) -> bool
    {
        match self {
            Self::Global => true,
            Self::Thread(owner) => owner == thread,
        }
    }
}

/// Who a breakpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind
{
    /// Inserted by the user; hits are reported.
    User,
    /// Inserted by a stepping operation and removed when it completes.
    Temporary,
}

/// Public information about a breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointInfo
{
    pub handle: BreakpointHandle,
    pub address: TargetAddress,
    pub scope: BreakpointScope,
    pub kind: BreakpointKind,
    /// Number of times this breakpoint has been hit.
    pub hit_count: u64,
    /// Timestamp when the breakpoint was inserted.
    pub inserted_at: SystemTime,
}

/// A patched address.
#[derive(Debug)]
struct Site
{
    /// Bytes the trap instruction replaced.
    original: Vec<u8>,
    /// Trap written at this address.
    instruction: Vec<u8>,
    /// Every breakpoint sharing this address; the reference count.
    handles: SmallVec<[BreakpointHandle; 2]>,
    /// Original bytes temporarily written back to step over the site.
    lifted: bool,
}

/// Tracks inserted breakpoints and the bytes they replaced.
#[derive(Debug)]
pub struct BreakpointManager
{
    instruction: Vec<u8>,
    next_handle: u64,
    breakpoints: HashMap<BreakpointHandle, BreakpointInfo>,
    sites: HashMap<u64, Site>,
}

impl BreakpointManager
{
    /// Create a manager that patches sites with `instruction`.
    #[must_use]
    pub fn new(instruction: &[u8]) -> Self
    {
        Self {
            instruction: instruction.to_vec(),
            next_handle: 1,
            breakpoints: HashMap::new(),
            sites: HashMap::new(),
        }
    }

    /// Insert a breakpoint at `address`.
    ///
    /// Only the first breakpoint at an address patches memory; later ones
    /// share the site and bump its reference count.
    ///
    /// ## Errors
    ///
    /// - [`StrandError::AddressDomainMismatch`] for a thread-local address
    /// - [`StrandError::MemoryAccess`] if the site cannot be read or patched
    pub fn insert<M>(
        &mut self,
        memory: &mut M,
        address: TargetAddress,
        scope: BreakpointScope,
        kind: BreakpointKind,
    ) -> StrandResult<BreakpointHandle>
    where
        M: TargetMemoryAccess + ?Sized,
    {
        let instruction = self.instruction.clone();
        self.insert_with_instruction(memory, address, scope, kind, &instruction)
    }

    /// Like [`BreakpointManager::insert`] with an explicit trap encoding.
    ///
    /// ## Errors
    ///
    /// Additionally fails with [`StrandError::MemoryAccess`] when the address
    /// is already patched with an instruction of a different size.
    pub fn insert_with_instruction<M>(
        &mut self,
        memory: &mut M,
        address: TargetAddress,
        scope: BreakpointScope,
        kind: BreakpointKind,
        instruction: &[u8],
    ) -> StrandResult<BreakpointHandle>
    where
        M: TargetMemoryAccess + ?Sized,
    {
        if address.domain() != AddressDomain::Global {
            return Err(StrandError::AddressDomainMismatch(format!(
                "breakpoint at {address} is not a code address"
            )));
        }

        let key = address.value();
        if let Some(site) = self.sites.get(&key) {
            if site.original.len() != instruction.len() {
                return Err(StrandError::memory(
                    key,
                    format!(
                        "already patched with a {}-byte instruction, cannot insert a {}-byte one",
                        site.original.len(),
                        instruction.len()
                    ),
                ));
            }
        } else {
            let original = memory.read_memory(address, instruction.len())?;
            memory.write_memory(address, instruction)?;
            debug!(%address, "patched breakpoint site");
            self.sites.insert(
                key,
                Site {
                    original,
                    instruction: instruction.to_vec(),
                    handles: SmallVec::new(),
                    lifted: false,
                },
            );
        }

        let handle = BreakpointHandle::from_raw(self.next_handle);
        self.next_handle += 1;

        if let Some(site) = self.sites.get_mut(&key) {
            site.handles.push(handle);
        }
        self.breakpoints.insert(
            handle,
            BreakpointInfo {
                handle,
                address,
                scope,
                kind,
                hit_count: 0,
                inserted_at: SystemTime::now(),
            },
        );
        trace!(%handle, %address, ?scope, ?kind, "breakpoint inserted");
        Ok(handle)
    }

    /// Remove one breakpoint. Memory is restored when no other breakpoint
    /// shares the site.
    ///
    /// The breakpoint stays registered if the original bytes cannot be
    /// written back, so its trap is still recognized.
    ///
    /// ## Errors
    ///
    /// - [`StrandError::UnknownBreakpoint`] if `handle` is not registered
    /// - [`StrandError::MemoryAccess`] if the original bytes cannot be restored
    pub fn remove<M>(&mut self, memory: &mut M, handle: BreakpointHandle) -> StrandResult<BreakpointInfo>
    where
        M: TargetMemoryAccess + ?Sized,
    {
        let address = self
            .breakpoints
            .get(&handle)
            .map(|info| info.address)
            .ok_or(StrandError::UnknownBreakpoint(handle))?;

        let key = address.value();
        if let Some(site) = self.sites.get(&key) {
            let last = site.handles.iter().all(|h| *h == handle);
            if last && !site.lifted {
                memory.write_memory(address, &site.original)?;
            }
        }

        if let Some(site) = self.sites.get_mut(&key) {
            site.handles.retain(|h| *h != handle);
            if site.handles.is_empty() {
                self.sites.remove(&key);
                debug!(%address, "restored breakpoint site");
            }
        }

        trace!(%handle, "breakpoint removed");
        self.breakpoints
            .remove(&handle)
            .ok_or(StrandError::UnknownBreakpoint(handle))
    }

    /// Remove every breakpoint scoped to `thread`. Used when the thread exits.
    pub fn remove_thread_breakpoints<M>(&mut self, memory: &mut M, thread: ThreadId) -> StrandResult<()>
    where
        M: TargetMemoryAccess + ?Sized,
    {
        let handles: Vec<_> = self
            .breakpoints
            .values()
            .filter(|info| info.scope == BreakpointScope::Thread(thread))
            .map(|info| info.handle)
            .collect();
        for handle in handles {
            self.remove(memory, handle)?;
        }
        Ok(())
    }

    /// Restore every patched site and forget all breakpoints. Used before
    /// detaching so the target keeps running unpatched code.
    ///
    /// ## Errors
    ///
    /// [`StrandError::MemoryAccess`] for the first site that cannot be restored.
    pub fn clear<M>(&mut self, memory: &mut M) -> StrandResult<()>
    where
        M: TargetMemoryAccess + ?Sized,
    {
        for (address, site) in &self.sites {
            if !site.lifted {
                memory.write_memory(TargetAddress::global(*address), &site.original)?;
            }
        }
        self.sites.clear();
        self.breakpoints.clear();
        debug!("all breakpoints cleared");
        Ok(())
    }

    /// Whether any breakpoint is inserted at `address`.
    #[must_use]
    pub fn is_breakpoint(&self, address: TargetAddress) -> bool
    {
        address.domain() == AddressDomain::Global && self.sites.contains_key(&address.value())
    }

    /// First breakpoint inserted at `address`.
    #[must_use]
    pub fn owner_of(&self, address: TargetAddress) -> Option<BreakpointHandle>
    {
        self.sites
            .get(&address.value())
            .filter(|_| address.domain() == AddressDomain::Global)
            .and_then(|site| site.handles.first().copied())
    }

    /// The breakpoint at `address` that should stop `thread`, if any.
    ///
    /// Temporary breakpoints owned by the thread win over user breakpoints so a
    /// stepping operation sees its own trap first.
    #[must_use]
    pub fn lookup(&self, address: TargetAddress, thread: ThreadId) -> Option<&BreakpointInfo>
    {
        let site = self.sites.get(&address.value())?;
        let candidates = site
            .handles
            .iter()
            .filter_map(|h| self.breakpoints.get(h))
            .filter(|info| info.scope.applies_to(thread));

        let mut best: Option<&BreakpointInfo> = None;
        for info in candidates {
            match best {
                Some(current) if current.kind == BreakpointKind::Temporary => {}
                _ if info.kind == BreakpointKind::Temporary => best = Some(info),
                None => best = Some(info),
                Some(_) => {}
            }
        }
        best
    }

    #[must_use]
    pub fn get(&self, handle: BreakpointHandle) -> Option<&BreakpointInfo>
    {
        self.breakpoints.get(&handle)
    }

    /// Count a hit on `handle`.
    pub fn record_hit(&mut self, handle: BreakpointHandle) -> Option<u64>
    {
        let info = self.breakpoints.get_mut(&handle)?;
        info.hit_count += 1;
        Some(info.hit_count)
    }

    /// All breakpoints, ordered by handle.
    #[must_use]
    pub fn list(&self) -> Vec<BreakpointInfo>
    {
        let mut all: Vec<_> = self.breakpoints.values().cloned().collect();
        all.sort_by_key(|info| info.handle);
        all
    }

    /// Write the original bytes back at `address` without forgetting the site,
    /// so the thread can execute the real instruction once.
    ///
    /// ## Errors
    ///
    /// [`StrandError::MemoryAccess`] if memory cannot be written.
    pub fn lift<M>(&mut self, memory: &mut M, address: TargetAddress) -> StrandResult<bool>
    where
        M: TargetMemoryAccess + ?Sized,
    {
        let Some(site) = self.sites.get_mut(&address.value()) else {
            return Ok(false);
        };
        if !site.lifted {
            memory.write_memory(address, &site.original)?;
            site.lifted = true;
        }
        Ok(true)
    }

    /// Re-patch a site previously [lifted](BreakpointManager::lift).
    ///
    /// ## Errors
    ///
    /// [`StrandError::MemoryAccess`] if memory cannot be written.
    pub fn replant<M>(&mut self, memory: &mut M, address: TargetAddress) -> StrandResult<()>
    where
        M: TargetMemoryAccess + ?Sized,
    {
        if let Some(site) = self.sites.get_mut(&address.value()) {
            if site.lifted {
                memory.write_memory(address, &site.instruction)?;
                site.lifted = false;
            }
        }
        Ok(())
    }

    /// Write `data` at `address` without clobbering inserted traps.
    ///
    /// Bytes that land on a patched site become that site's saved original
    /// and the trap stays in memory.
    ///
    /// ## Errors
    ///
    /// [`StrandError::MemoryAccess`] if memory cannot be written.
    pub fn write_through<M>(&mut self, memory: &mut M, address: TargetAddress, data: &[u8]) -> StrandResult<()>
    where
        M: TargetMemoryAccess + ?Sized,
    {
        let mut bytes = data.to_vec();
        if address.domain() == AddressDomain::Global {
            let start = address.value();
            let end = start.saturating_add(data.len() as u64);
            for (site_address, site) in &mut self.sites {
                for (i, original) in site.original.iter_mut().enumerate() {
                    let at = site_address + i as u64;
                    if at < start || at >= end {
                        continue;
                    }
                    let offset = (at - start) as usize;
                    *original = data[offset];
                    if !site.lifted {
                        if let Some(trap) = site.instruction.get(i) {
                            bytes[offset] = *trap;
                        }
                    }
                }
            }
        }
        memory.write_memory(address, &bytes)
    }

    /// Replace patched bytes in a buffer read from `address` with the original
    /// bytes, so callers never see trap instructions.
    pub fn mask(&self, address: TargetAddress, buffer: &mut [u8])
    {
        if address.domain() != AddressDomain::Global || self.sites.is_empty() {
            return;
        }
        let start = address.value();
        let end = start.saturating_add(buffer.len() as u64);
        for (site_address, site) in &self.sites {
            if site.lifted {
                continue;
            }
            for (i, byte) in site.original.iter().enumerate() {
                let at = site_address + i as u64;
                if at >= start && at < end {
                    buffer[(at - start) as usize] = *byte;
                }
            }
        }
    }
}

/// Read-only view of a thread's memory with inserted breakpoints masked out.
pub struct MaskedMemory<'a, M: ?Sized>
{
    inner: &'a M,
    breakpoints: &'a BreakpointManager,
}

impl<'a, M> MaskedMemory<'a, M>
where
    M: TargetMemoryAccess + ?Sized,
{
    pub fn new(inner: &'a M, breakpoints: &'a BreakpointManager) -> Self
    {
        Self { inner, breakpoints }
    }
}

impl<M> TargetMemoryAccess for MaskedMemory<'_, M>
where
    M: TargetMemoryAccess + ?Sized,
{
    fn read_memory(&self, address: TargetAddress, len: usize) -> StrandResult<Vec<u8>>
    {
        let mut bytes = self.inner.read_memory(address, len)?;
        self.breakpoints.mask(address, &mut bytes);
        Ok(bytes)
    }

    fn write_memory(&mut self, address: TargetAddress, _data: &[u8]) -> StrandResult<()>
    {
        Err(StrandError::memory(address.value(), "masked view is read-only"))
    }

    fn registers(&self) -> StrandResult<Registers>
    {
        self.inner.registers()
    }

    fn local_domain(&self) -> AddressDomain
    {
        self.inner.local_domain()
    }
}
