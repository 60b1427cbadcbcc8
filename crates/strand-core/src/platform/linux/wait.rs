//! Translation of `waitpid` statuses into [`ChildEvent`]s.
//!
//! A new thread shows up twice: as `PTRACE_EVENT_CLONE` on its creator and as
//! an initial `SIGSTOP` on itself, in either order. The creation is reported
//! once both halves were seen, so the new thread is stopped and can be
//! resumed by its engine.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::inferior::{ChildEvent, WaitEvent};
use crate::types::ThreadId;

/// Raw status, decoupled from `nix` so the pairing logic can be tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RawStatus
{
    Exited
    {
        tid: u64, code: i32
    },
    Signaled
    {
        tid: u64, signal: i32
    },
    Stopped
    {
        tid: u64, signal: i32
    },
    /// `PTRACE_EVENT_CLONE`; `child` from `PTRACE_GETEVENTMSG`.
    Cloned
    {
        tid: u64, child: u64
    },
    /// Any other ptrace stop (exec, syscall); resumed as before.
    OtherTrap
    {
        tid: u64
    },
}

#[derive(Debug, Default)]
pub(crate) struct StatusTranslator
{
    /// Threads that may report events.
    known: HashSet<u64>,
    /// New thread -> creator, still waiting for the new thread's SIGSTOP.
    awaiting_stop: HashMap<u64, u64>,
    /// New threads whose SIGSTOP arrived before the clone event.
    early_stops: HashSet<u64>,
}

impl StatusTranslator
{
    pub fn track(&mut self, tid: u64)
    {
        self.known.insert(tid);
    }

    pub fn forget(&mut self, tid: u64)
    {
        self.known.remove(&tid);
    }

    /// Translate one status. `None` means "nothing to report yet".
    pub fn translate(&mut self, status: RawStatus) -> Option<WaitEvent>
    {
        let (tid, event) = match status {
            RawStatus::Exited { tid, code } => {
                self.known.remove(&tid);
                (tid, ChildEvent::Exited { code })
            }
            RawStatus::Signaled { tid, signal } => {
                self.known.remove(&tid);
                (tid, ChildEvent::Signaled { signal })
            }
            RawStatus::Stopped { tid, signal } if !self.known.contains(&tid) => {
                if signal != libc::SIGSTOP {
                    trace!(tid, signal, "stop of untracked thread ignored");
                    return None;
                }
                return match self.awaiting_stop.remove(&tid) {
                    Some(creator) => Some(self.created(creator, tid)),
                    None => {
                        self.early_stops.insert(tid);
                        None
                    }
                };
            }
            RawStatus::Stopped { tid, signal } => (tid, ChildEvent::Stopped { signal }),
            RawStatus::Cloned { tid, child } => {
                if self.early_stops.remove(&child) {
                    return Some(self.created(tid, child));
                }
                self.awaiting_stop.insert(child, tid);
                return None;
            }
            RawStatus::OtherTrap { tid } => (tid, ChildEvent::None),
        };
        Some(WaitEvent {
            thread: ThreadId(tid),
            event,
        })
    }

    fn created(&mut self, creator: u64, child: u64) -> WaitEvent
    {
        self.known.insert(child);
        WaitEvent {
            thread: ThreadId(creator),
            event: ChildEvent::CreatedThread {
                thread: ThreadId(child),
            },
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn created(creator: u64, child: u64) -> Option<WaitEvent>
    {
        Some(WaitEvent {
            thread: ThreadId(creator),
            event: ChildEvent::CreatedThread {
                thread: ThreadId(child),
            },
        })
    }

    #[test]
    fn clone_event_first()
    {
        let mut translator = StatusTranslator::default();
        translator.track(10);
        assert_eq!(translator.translate(RawStatus::Cloned { tid: 10, child: 11 }), None);
        assert_eq!(
            translator.translate(RawStatus::Stopped {
                tid: 11,
                signal: libc::SIGSTOP
            }),
            created(10, 11)
        );
        // Now tracked, a later SIGSTOP is a regular stop.
        assert!(matches!(
            translator.translate(RawStatus::Stopped { tid: 11, signal: libc::SIGSTOP }),
            Some(WaitEvent { event: ChildEvent::Stopped { .. }, .. })
        ));
    }

    #[test]
    fn stop_before_clone_event()
    {
        let mut translator = StatusTranslator::default();
        translator.track(10);
        assert_eq!(
            translator.translate(RawStatus::Stopped {
                tid: 12,
                signal: libc::SIGSTOP
            }),
            None
        );
        assert_eq!(translator.translate(RawStatus::Cloned { tid: 10, child: 12 }), created(10, 12));
    }

    #[test]
    fn exits_untrack_threads()
    {
        let mut translator = StatusTranslator::default();
        translator.track(10);
        let event = translator.translate(RawStatus::Exited { tid: 10, code: 3 });
        assert_eq!(event.map(|e| e.event), Some(ChildEvent::Exited { code: 3 }));
        assert_eq!(translator.translate(RawStatus::Stopped { tid: 10, signal: libc::SIGTRAP }), None);
    }
}
