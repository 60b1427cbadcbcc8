//! Symbol and source-line lookup results.

use std::fmt;

use super::TargetAddress;

/// A named code address, usually the start of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol
{
    pub name: String,
    /// Address the name refers to.
    pub address: TargetAddress,
}

impl Symbol
{
    pub fn new(name: impl Into<String>, address: TargetAddress) -> Self
    {
        Self {
            name: name.into(),
            address,
        }
    }
}

impl fmt::Display for Symbol
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.write_str(&self.name)
    }
}

/// Source code location for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation
{
    /// Absolute or workspace-relative path.
    pub file: String,
    pub line: u32,
}

impl fmt::Display for SourceLocation
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// The code range generated for one source line
///
/// Line stepping keeps the thread running while its pc stays inside
/// `start..end`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLine
{
    pub location: SourceLocation,
    pub start: TargetAddress,
    /// Exclusive.
    pub end: TargetAddress,
}

impl SourceLine
{
    #[must_use]
    pub fn contains(&self, address: TargetAddress) -> bool
    {
        address.is_within(self.start, self.end)
    }
}

/// Extent of a compiled method or function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo
{
    pub name: String,
    pub start: TargetAddress,
    /// Exclusive.
    pub end: TargetAddress,
    /// Whether the symbol provider has line information for this method.
    pub has_source: bool,
}

impl MethodInfo
{
    #[must_use]
    pub fn contains(&self, address: TargetAddress) -> bool
    {
        address.is_within(self.start, self.end)
    }
}
