//! Debugger event types and the hub that delivers them.
//!
//! Front ends consume these events to react to asynchronous target state
//! changes instead of polling. Events are published from the engine thread
//! (and from the output reader threads) after the engine that produced them is
//! back in the registry, so an observer may issue synchronous commands from
//! inside its callback.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};

use tracing::trace;

use crate::breakpoints::BreakpointHandle;
use crate::error::StrandError;
use crate::manager::ProcessHandle;
use crate::types::{StackFrame, ThreadId};

/// Why a thread stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason
{
    /// The session finished starting up.
    Entry,
    /// A user breakpoint was hit.
    Breakpoint(BreakpointHandle),
    /// A stepping operation completed.
    StepFinished,
    /// The thread received a signal.
    Signal(i32),
    /// The user interrupted the thread.
    Interrupted,
}

/// State change of one target thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent
{
    Stopped
    {
        reason: StopReason,
        /// Innermost frame at the stop, when it could be read.
        frame: Option<StackFrame>,
    },
    Exited(i32),
    Signaled(i32),
}

/// Event emitted by a debugging session.
#[derive(Debug, Clone)]
pub enum DebuggerEvent
{
    /// The main thread's engine exists.
    MainThreadCreated(ProcessHandle),
    /// A new target thread was created and is being debugged.
    ThreadCreated(ProcessHandle),
    /// The session finished starting; the main thread is stopped.
    Initialized(ProcessHandle),
    ThreadExited(ProcessHandle),
    /// The main thread exited; the target is gone.
    TargetExited,
    TargetEvent
    {
        thread: ThreadId,
        event: TargetEvent,
    },
    /// One line the target wrote to stdout or stderr.
    TargetOutput
    {
        is_stderr: bool,
        line: String,
    },
    /// Informational message from the debugger itself.
    DebuggerOutput(String),
    /// A background failure that has no caller to return to.
    DebuggerError
    {
        sender: String,
        message: String,
        error: Option<Arc<StrandError>>,
    },
}

impl DebuggerEvent
{
    /// Human-readable description of the event.
    #[must_use]
    pub fn describe(&self) -> String
    {
        match self {
            Self::MainThreadCreated(handle) => format!("Main thread {} created", handle.thread_id()),
            Self::ThreadCreated(handle) => format!("Thread {} created", handle.thread_id()),
            Self::Initialized(handle) => format!("Target initialized (main thread {})", handle.thread_id()),
            Self::ThreadExited(handle) => format!("Thread {} exited", handle.thread_id()),
            Self::TargetExited => "Target exited".to_string(),
            Self::TargetEvent { thread, event } => format!("{} (thread {thread})", format_target_event(event)),
            Self::TargetOutput { is_stderr, line } => {
                if *is_stderr {
                    format!("[stderr] {line}")
                } else {
                    format!("[stdout] {line}")
                }
            }
            Self::DebuggerOutput(message) => message.clone(),
            Self::DebuggerError { sender, message, .. } => format!("{sender}: {message}"),
        }
    }
}

/// Format a [`StopReason`] into a user-facing message.
#[must_use]
pub fn format_stop_reason(reason: StopReason) -> String
{
    match reason {
        StopReason::Entry => "Stopped at entry".to_string(),
        StopReason::Breakpoint(handle) => format!("Hit breakpoint {handle}"),
        StopReason::StepFinished => "Step finished".to_string(),
        StopReason::Signal(sig) => format!("Stopped by signal: {sig}"),
        StopReason::Interrupted => "Interrupted".to_string(),
    }
}

fn format_target_event(event: &TargetEvent) -> String
{
    match event {
        TargetEvent::Stopped { reason, frame } => match frame {
            Some(frame) => format!("{} at {}", format_stop_reason(*reason), frame.pc),
            None => format_stop_reason(*reason),
        },
        TargetEvent::Exited(code) => format!("Exited with code: {code}"),
        TargetEvent::Signaled(sig) => format!("Killed by signal: {sig}"),
    }
}

/// Sender side of the debugger event channel.
pub type DebuggerEventSender = mpsc::Sender<DebuggerEvent>;
/// Receiver side of the debugger event channel.
pub type DebuggerEventReceiver = mpsc::Receiver<DebuggerEvent>;

/// Callback invoked for every event.
pub type EventObserver = Arc<dyn Fn(&DebuggerEvent) + Send + Sync>;

/// Identifies an observer for [`EventHub::unobserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Fan-out of events to callbacks and channels.
#[derive(Default)]
pub struct EventHub
{
    observers: RwLock<Vec<(ObserverId, EventObserver)>>,
    senders: Mutex<Vec<DebuggerEventSender>>,
    next_id: Mutex<u64>,
}

impl EventHub
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Register a callback. It runs on the publishing thread, with no debugger
    /// lock held.
    pub fn observe(&self, observer: EventObserver) -> ObserverId
    {
        let id = {
            let mut next = self.next_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            *next += 1;
            ObserverId(*next)
        };
        self.observers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((id, observer));
        id
    }

    pub fn unobserve(&self, id: ObserverId) -> bool
    {
        let mut observers = self.observers.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// New channel receiving every event published from now on.
    #[must_use]
    pub fn subscribe(&self) -> DebuggerEventReceiver
    {
        let (sender, receiver) = mpsc::channel();
        self.senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(sender);
        receiver
    }

    pub fn publish(&self, event: &DebuggerEvent)
    {
        trace!(event = %event.describe(), "publishing event");

        let observers: Vec<EventObserver> = self
            .observers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer(event);
        }

        self.senders
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|sender| sender.send(event.clone()).is_ok());
    }
}

impl std::fmt::Debug for EventHub
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("EventHub").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests
{
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn observers_and_channels_both_receive()
    {
        let hub = EventHub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = hub.observe(Arc::new(move |_: &DebuggerEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let receiver = hub.subscribe();

        hub.publish(&DebuggerEvent::DebuggerOutput("hello".into()));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(matches!(receiver.try_recv(), Ok(DebuggerEvent::DebuggerOutput(text)) if text == "hello"));

        assert!(hub.unobserve(id));
        hub.publish(&DebuggerEvent::TargetExited);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(matches!(receiver.try_recv(), Ok(DebuggerEvent::TargetExited)));
    }

    #[test]
    fn dropped_receivers_are_pruned()
    {
        let hub = EventHub::new();
        drop(hub.subscribe());
        hub.publish(&DebuggerEvent::TargetExited);
        assert!(hub.senders.lock().unwrap().is_empty());
    }

    #[test]
    fn describe_target_event()
    {
        let event = DebuggerEvent::TargetEvent {
            thread: ThreadId(5),
            event: TargetEvent::Stopped {
                reason: StopReason::Breakpoint(BreakpointHandle::from_raw(2)),
                frame: None,
            },
        };
        assert_eq!(event.describe(), "Hit breakpoint #2 (thread 5)");
    }
}
