//! # Linux Transport
//!
//! Drives the target with `ptrace`. The tracee is started with
//! `PTRACE_TRACEME` and traced with `PTRACE_O_TRACECLONE`, so every thread it
//! creates is traced as well. `global_wait` blocks in `waitpid(-1, __WALL)`,
//! which reports stops of every tracee of the tracer's thread group. `wake`
//! interrupts it with `SIGURG`, whose handler is installed without
//! `SA_RESTART` so the blocked call fails with `EINTR`.
//!
//! Only the thread that forked the tracee (or issued `PTRACE_ATTACH`) may send
//! ptrace requests. The session therefore calls `spawn`, `attach` and every
//! [`crate::InferiorConnection`] method from its engine thread.
//!
//! Attaching traces the main thread only; threads that already exist keep
//! running untraced.

mod inferior;
mod wait;

use std::collections::VecDeque;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

pub use inferior::PtraceInferior;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::pthread::{pthread_kill, pthread_self, Pthread};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, trace};
use wait::{RawStatus, StatusTranslator};

use crate::config::SpawnSpec;
use crate::error::{StrandError, StrandResult};
use crate::inferior::{ChildEvent, InferiorTransport, SpawnedInferior, WaitEvent, WaitOutcome};
use crate::manager::lock;
use crate::types::{ProcessId, ThreadId};

/// Signal that knocks the wait thread out of `waitpid`.
const WAKE_SIGNAL: Signal = Signal::SIGURG;

/// Delay before signalling again a waiter that has not seen its wakeup.
const WAKE_RETRY: Duration = Duration::from_millis(1);

extern "C" fn on_wake_signal(_: libc::c_int) {}

/// Install the no-op `SIGURG` handler once per process.
fn install_wake_handler() -> StrandResult<()>
{
    static INSTALLED: OnceLock<Result<(), Errno>> = OnceLock::new();
    let installed = INSTALLED.get_or_init(|| {
        let action = SigAction::new(SigHandler::Handler(on_wake_signal), SaFlags::empty(), SigSet::empty());
        // SAFETY: the handler does nothing, so it is async-signal-safe.
        unsafe { sigaction(WAKE_SIGNAL, &action) }.map(drop)
    });
    Ok((*installed)?)
}

/// The thread blocked in `global_wait`, if any.
#[derive(Debug, Default)]
struct Waiter
{
    thread: Mutex<Option<Pthread>>,
    blocked: AtomicBool,
}

impl Waiter
{
    fn enter(&self)
    {
        *lock(&self.thread) = Some(pthread_self());
        self.blocked.store(true, Ordering::SeqCst);
    }

    fn leave(&self)
    {
        self.blocked.store(false, Ordering::SeqCst);
    }

    /// Signal the waiter until `seen` holds or it stops waiting.
    ///
    /// The caller publishes its wakeup before calling this. A signal that
    /// lands between the waiter's last check and `waitpid` is lost, so the
    /// signal is repeated.
    fn alert(&self, seen: impl Fn() -> bool)
    {
        let Some(target) = *lock(&self.thread) else {
            return;
        };
        while self.blocked.load(Ordering::SeqCst) && !seen() {
            if let Err(errno) = pthread_kill(target, WAKE_SIGNAL) {
                debug!(%errno, "could not signal wait thread");
                return;
            }
            thread::sleep(WAKE_RETRY);
        }
    }
}

/// [`InferiorTransport`] on top of `ptrace(2)`.
#[derive(Debug, Default)]
pub struct PtraceTransport
{
    woken: AtomicBool,
    /// Synthetic events reported before anything from `waitpid`.
    queued: Mutex<VecDeque<WaitEvent>>,
    translator: Arc<Mutex<StatusTranslator>>,
    waiter: Waiter,
}

impl PtraceTransport
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Set the trace options and queue the initial stop of a fresh tracee.
    fn adopt(&self, pid: Pid) -> StrandResult<PtraceInferior>
    {
        ptrace::setoptions(pid, Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_EXITKILL)?;
        let inferior = PtraceInferior::new(pid, pid, Arc::clone(&self.translator))?;
        lock(&self.queued).push_back(WaitEvent {
            thread: ThreadId(u64::try_from(pid.as_raw()).unwrap_or_default()),
            event: ChildEvent::Stopped { signal: 0 },
        });
        // The fresh tracee is stopped, so a blocked waitpid would never see it.
        self.waiter.alert(|| lock(&self.queued).is_empty());
        Ok(inferior)
    }

    /// Translate one `waitpid` status. `None` for statuses with nothing to
    /// report.
    fn translate(&self, status: WaitStatus) -> StrandResult<Option<WaitOutcome>>
    {
        trace!(?status, "waitpid");

        let raw = match status {
            WaitStatus::StillAlive | WaitStatus::Continued(_) => return Ok(None),
            WaitStatus::Exited(pid, code) => RawStatus::Exited {
                tid: tid_of(pid),
                code,
            },
            WaitStatus::Signaled(pid, signal, _) => RawStatus::Signaled {
                tid: tid_of(pid),
                signal: signal as i32,
            },
            WaitStatus::Stopped(pid, signal) => RawStatus::Stopped {
                tid: tid_of(pid),
                signal: signal as i32,
            },
            WaitStatus::PtraceEvent(pid, Signal::SIGTRAP, event) if event == libc::PTRACE_EVENT_CLONE => {
                let child = ptrace::getevent(pid)?;
                RawStatus::Cloned {
                    tid: tid_of(pid),
                    child: u64::try_from(child).map_err(|_| {
                        StrandError::Transport(format!("invalid thread id {child} from clone event"))
                    })?,
                }
            }
            WaitStatus::PtraceEvent(pid, ..) | WaitStatus::PtraceSyscall(pid) => RawStatus::OtherTrap { tid: tid_of(pid) },
        };

        Ok(lock(&self.translator).translate(raw).map(WaitOutcome::Event))
    }
}

fn tid_of(pid: Pid) -> u64
{
    u64::try_from(pid.as_raw()).unwrap_or_default()
}

fn pid_of(pid: ProcessId) -> StrandResult<Pid>
{
    i32::try_from(pid.0)
        .map(Pid::from_raw)
        .map_err(|_| StrandError::InvalidArgument(format!("process id {pid} out of range")))
}

impl InferiorTransport for PtraceTransport
{
    fn spawn(&self, spec: &SpawnSpec) -> StrandResult<SpawnedInferior>
    {
        let program = spec
            .program()
            .ok_or_else(|| StrandError::InvalidArgument("empty argv".to_string()))?;

        let mut command = Command::new(program);
        command
            .args(spec.argv.iter().skip(1))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !spec.envp.is_empty() {
            command.env_clear();
            for pair in &spec.envp {
                let (key, value) = pair.split_once('=').unwrap_or((pair.as_str(), ""));
                command.env(key, value);
            }
        }
        if let Some(dir) = &spec.working_directory {
            command.current_dir(dir);
        }

        // SAFETY: the closure runs in the forked child before exec and only
        // issues PTRACE_TRACEME, which is async-signal-safe.
        unsafe {
            command.pre_exec(|| ptrace::traceme().map_err(io::Error::from));
        }

        let mut child = command.spawn()?;
        let pid = Pid::from_raw(
            i32::try_from(child.id()).map_err(|_| StrandError::Transport("child pid out of range".to_string()))?,
        );

        // The tracee stops with SIGTRAP once exec succeeded.
        match waitpid(pid, None)? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            status => {
                return Err(StrandError::Startup(format!("unexpected status after exec: {status:?}")));
            }
        }
        debug!(%pid, program, "spawned traced process");

        let inferior = self.adopt(pid)?;
        Ok(SpawnedInferior {
            inferior: Box::new(inferior),
            stdout: child.stdout.take().map(|s| Box::new(s) as Box<dyn io::Read + Send>),
            stderr: child.stderr.take().map(|s| Box::new(s) as Box<dyn io::Read + Send>),
        })
    }

    fn attach(&self, pid: ProcessId) -> StrandResult<SpawnedInferior>
    {
        let pid = pid_of(pid)?;
        ptrace::attach(pid)?;
        match waitpid(pid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            status => {
                return Err(StrandError::Startup(format!("unexpected status after attach: {status:?}")));
            }
        }
        debug!(%pid, "attached");

        Ok(SpawnedInferior {
            inferior: Box::new(self.adopt(pid)?),
            stdout: None,
            stderr: None,
        })
    }

    fn global_wait(&self) -> StrandResult<WaitOutcome>
    {
        install_wake_handler()?;
        loop {
            // Mark the thread as blocked before the checks so an alert issued
            // after them keeps signalling until waitpid returns.
            self.waiter.enter();
            if self.woken.swap(false, Ordering::SeqCst) {
                self.waiter.leave();
                return Ok(WaitOutcome::Woken);
            }
            if let Some(event) = lock(&self.queued).pop_front() {
                self.waiter.leave();
                return Ok(WaitOutcome::Event(event));
            }

            let status = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL));
            self.waiter.leave();
            match status {
                Ok(status) => {
                    if let Some(outcome) = self.translate(status)? {
                        return Ok(outcome);
                    }
                }
                Err(Errno::ECHILD) => return Ok(WaitOutcome::NoChildren),
                Err(Errno::EINTR) => trace!("waitpid interrupted"),
                Err(errno) => return Err(errno.into()),
            }
        }
    }

    fn wake(&self)
    {
        self.woken.store(true, Ordering::SeqCst);
        self.waiter.alert(|| !self.woken.load(Ordering::SeqCst));
    }
}
