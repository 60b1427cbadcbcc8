//! # Symbol Providers
//!
//! The stepping engine never parses debug information itself. Everything it
//! needs to know about the program (where main is, which code range a source
//! line covers, where a trampoline lands) comes through [`SymbolProvider`].

use crate::error::StrandResult;
use crate::inferior::{NotificationKind, TargetMemoryAccess};
use crate::types::{MethodInfo, SourceLine, Symbol, TargetAddress};

/// Source of symbol, line, and method information for the target.
///
/// All methods have conservative defaults so a provider only implements what
/// it actually knows.
pub trait SymbolProvider: Send + Sync
{
    /// Closest symbol at or before `address`.
    fn lookup_symbol(&self, address: TargetAddress) -> Option<Symbol>
    {
        let _ = address;
        None
    }

    /// Line whose code range contains `address`.
    fn lookup_line(&self, address: TargetAddress) -> Option<SourceLine>
    {
        let _ = address;
        None
    }

    /// Method whose code range contains `address`.
    fn lookup_method(&self, address: TargetAddress) -> Option<MethodInfo>
    {
        let _ = address;
        None
    }

    /// Address the main thread should run to before the session is ready.
    ///
    /// `None` means the provider cannot tell; the transport's entry point is
    /// used instead.
    ///
    /// ## Errors
    ///
    /// A failure here aborts session startup.
    fn main_method(&self, memory: &dyn TargetMemoryAccess) -> StrandResult<Option<TargetAddress>>
    {
        let _ = memory;
        Ok(None)
    }

    /// Address of the runtime's generic compile trampoline, if there is one.
    fn trampoline_address(&self) -> Option<TargetAddress>
    {
        None
    }

    /// Code address of the method described by a trampoline's method-info word.
    fn resolve_trampoline_method(&self, method_info: TargetAddress) -> Option<TargetAddress>
    {
        let _ = method_info;
        None
    }

    /// Runtime notification. Called with every peer thread stopped.
    ///
    /// ## Errors
    ///
    /// Errors are logged and reported as debugger errors; the session continues.
    fn handle_notification(
        &self,
        kind: NotificationKind,
        argument: u64,
        memory: &dyn TargetMemoryAccess,
    ) -> StrandResult<()>
    {
        let _ = (kind, argument, memory);
        Ok(())
    }
}

/// Provider that knows nothing; every lookup misses.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbols;

impl SymbolProvider for NoSymbols {}
