//! Session and launch configuration.

use std::path::PathBuf;

use crate::types::ProcessId;

/// How to launch a target process
///
/// ## Example
///
/// ```rust
/// use strand_core::config::SpawnSpec;
///
/// let spec = SpawnSpec::new("/bin/true").arg("--version").env("LANG", "C");
/// assert_eq!(spec.argv, vec!["/bin/true".to_string(), "--version".to_string()]);
/// assert_eq!(spec.envp, vec!["LANG=C".to_string()]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpawnSpec
{
    /// Directory to start in, `None` keeps the debugger's.
    pub working_directory: Option<PathBuf>,
    /// `argv[0]` is the program.
    pub argv: Vec<String>,
    /// `KEY=VALUE` pairs. Empty inherits the debugger's environment.
    pub envp: Vec<String>,
}

impl SpawnSpec
{
    pub fn new(program: impl Into<String>) -> Self
    {
        Self {
            working_directory: None,
            argv: vec![program.into()],
            envp: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self
    {
        self.argv.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self
    {
        self.envp.push(format!("{key}={value}"));
        self
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self
    {
        self.working_directory = Some(dir.into());
        self
    }

    /// The program path, `argv[0]`.
    #[must_use]
    pub fn program(&self) -> Option<&str>
    {
        self.argv.first().map(String::as_str)
    }
}

/// Whether a session launches a new process or attaches to one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchTarget
{
    Spawn(SpawnSpec),
    Attach(ProcessId),
}

/// Tunables for one debugging session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig
{
    /// Run the main thread to the program's main method before reporting the
    /// session as started. When false the session starts at the initial stop.
    pub stop_at_main: bool,
    /// Forward target stdout/stderr as output events.
    pub capture_output: bool,
    /// Default frame limit for backtraces.
    pub backtrace_limit: usize,
    /// Single steps a line-step operation may take before it gives up and
    /// reports the stop where it is. 0 means unlimited.
    pub max_step_iterations: usize,
    /// Detach instead of killing the target when the session is disposed.
    pub detach_on_dispose: bool,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            stop_at_main: true,
            capture_output: true,
            backtrace_limit: 64,
            max_step_iterations: 100_000,
            detach_on_dispose: false,
        }
    }
}

impl SessionConfig
{
    #[must_use]
    pub fn with_stop_at_main(mut self, stop_at_main: bool) -> Self
    {
        self.stop_at_main = stop_at_main;
        self
    }

    #[must_use]
    pub fn with_capture_output(mut self, capture_output: bool) -> Self
    {
        self.capture_output = capture_output;
        self
    }

    #[must_use]
    pub fn with_backtrace_limit(mut self, limit: usize) -> Self
    {
        self.backtrace_limit = limit;
        self
    }

    #[must_use]
    pub fn with_max_step_iterations(mut self, limit: usize) -> Self
    {
        self.max_step_iterations = limit;
        self
    }

    #[must_use]
    pub fn with_detach_on_dispose(mut self, detach: bool) -> Self
    {
        self.detach_on_dispose = detach;
        self
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn builders_override_defaults()
    {
        let config = SessionConfig::default()
            .with_stop_at_main(false)
            .with_backtrace_limit(8)
            .with_max_step_iterations(0);
        assert!(!config.stop_at_main);
        assert!(config.capture_output);
        assert_eq!(config.backtrace_limit, 8);
        assert_eq!(config.max_step_iterations, 0);
    }

    #[test]
    fn spawn_spec_program_is_argv0()
    {
        let spec = SpawnSpec::new("/bin/echo").args(["a", "b"]).working_directory("/tmp");
        assert_eq!(spec.program(), Some("/bin/echo"));
        assert_eq!(spec.argv.len(), 3);
        assert_eq!(spec.working_directory.as_deref(), Some(std::path::Path::new("/tmp")));
    }
}
