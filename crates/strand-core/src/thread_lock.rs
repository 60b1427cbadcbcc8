//! Reference-counted "stop the world" lock.
//!
//! An engine that needs every other thread quiescent (to step over a
//! breakpoint, or to let the symbol provider read runtime tables) acquires the
//! global thread lock. Only the 0 to 1 transition stops the peers and only the
//! 1 to 0 transition resumes them; nested acquisitions just count.
//!
//! This type only tracks state. The thread manager performs the actual stop
//! and resume requests on the engine thread.

use std::collections::BTreeSet;

use crate::error::{StrandError, StrandResult};
use crate::types::ThreadId;

/// What the caller must do after [`ThreadLock::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockTransition
{
    /// First acquisition: stop these peers.
    Engaged
    {
        peers: Vec<ThreadId>
    },
    /// Already held; nothing to do.
    Nested
    {
        level: usize
    },
}

/// What the caller must do after [`ThreadLock::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseTransition
{
    /// Last release: resume these peers.
    Disengaged
    {
        peers: Vec<ThreadId>
    },
    Nested
    {
        level: usize
    },
}

#[derive(Debug, Default)]
pub struct ThreadLock
{
    level: usize,
    initiator: Option<ThreadId>,
    /// Peers held by the lock.
    held: BTreeSet<ThreadId>,
    /// Held peers whose stop has been requested but not yet reported.
    pending: BTreeSet<ThreadId>,
}

impl ThreadLock
{
    #[must_use]
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Take the lock on behalf of `caller`. `threads` is every live thread;
    /// the caller itself is never stopped.
    pub fn acquire(&mut self, caller: ThreadId, threads: impl IntoIterator<Item = ThreadId>) -> LockTransition
    {
        self.level += 1;
        if self.level > 1 {
            return LockTransition::Nested { level: self.level };
        }

        self.initiator = Some(caller);
        self.held = threads.into_iter().filter(|t| *t != caller).collect();
        self.pending.clear();
        LockTransition::Engaged {
            peers: self.held.iter().copied().collect(),
        }
    }

    /// Drop one level of the lock.
    ///
    /// ## Errors
    ///
    /// [`StrandError::Internal`] if the lock is not held.
    pub fn release(&mut self, caller: ThreadId) -> StrandResult<ReleaseTransition>
    {
        if self.level == 0 {
            return Err(StrandError::Internal(format!(
                "thread {caller} released the global thread lock without holding it"
            )));
        }

        self.level -= 1;
        if self.level > 0 {
            return Ok(ReleaseTransition::Nested { level: self.level });
        }

        self.initiator = None;
        self.pending.clear();
        let peers = std::mem::take(&mut self.held).into_iter().collect();
        Ok(ReleaseTransition::Disengaged { peers })
    }

    /// A held peer has a stop request in flight.
    pub fn mark_pending(&mut self, thread: ThreadId)
    {
        if self.held.contains(&thread) {
            self.pending.insert(thread);
        }
    }

    /// A held peer reported its stop. Returns true if this made every peer
    /// quiescent.
    pub fn peer_stopped(&mut self, thread: ThreadId) -> bool
    {
        self.pending.remove(&thread) && self.pending.is_empty()
    }

    /// A thread is gone; stop waiting for it.
    pub fn forget(&mut self, thread: ThreadId) -> bool
    {
        self.held.remove(&thread);
        self.pending.remove(&thread) && self.pending.is_empty()
    }

    /// Hold a thread that appeared while the lock is engaged.
    pub fn adopt(&mut self, thread: ThreadId)
    {
        if self.level > 0 && Some(thread) != self.initiator {
            self.held.insert(thread);
        }
    }

    #[must_use]
    pub fn is_held(&self) -> bool
    {
        self.level > 0
    }

    #[must_use]
    pub fn level(&self) -> usize
    {
        self.level
    }

    #[must_use]
    pub fn initiator(&self) -> Option<ThreadId>
    {
        self.initiator
    }

    /// True while held and no stop request is outstanding.
    #[must_use]
    pub fn is_quiescent(&self) -> bool
    {
        self.pending.is_empty()
    }

    #[must_use]
    pub fn holds(&self, thread: ThreadId) -> bool
    {
        self.held.contains(&thread)
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    const A: ThreadId = ThreadId(1);
    const B: ThreadId = ThreadId(2);
    const C: ThreadId = ThreadId(3);

    #[test]
    fn only_outer_transitions_touch_peers()
    {
        let mut lock = ThreadLock::new();

        assert_eq!(lock.acquire(A, [A, B, C]), LockTransition::Engaged { peers: vec![B, C] });
        assert_eq!(lock.acquire(A, [A, B, C]), LockTransition::Nested { level: 2 });
        assert_eq!(lock.acquire(A, [A, B, C]), LockTransition::Nested { level: 3 });

        assert_eq!(lock.release(A).unwrap(), ReleaseTransition::Nested { level: 2 });
        assert_eq!(lock.release(A).unwrap(), ReleaseTransition::Nested { level: 1 });
        assert_eq!(lock.release(A).unwrap(), ReleaseTransition::Disengaged { peers: vec![B, C] });
        assert!(!lock.is_held());
    }

    #[test]
    fn release_without_acquire_is_an_error()
    {
        let mut lock = ThreadLock::new();
        assert!(matches!(lock.release(A), Err(StrandError::Internal(_))));

        lock.acquire(A, [A]);
        lock.release(A).unwrap();
        assert!(lock.release(A).is_err());
    }

    #[test]
    fn quiescence_waits_for_pending_peers()
    {
        let mut lock = ThreadLock::new();
        lock.acquire(A, [A, B, C]);
        lock.mark_pending(B);
        lock.mark_pending(C);
        assert!(!lock.is_quiescent());

        assert!(!lock.peer_stopped(B));
        assert!(!lock.peer_stopped(B));
        assert!(lock.forget(C));
        assert!(lock.is_quiescent());
        assert!(!lock.holds(C));
    }

    #[test]
    fn adopted_threads_are_resumed_on_release()
    {
        let mut lock = ThreadLock::new();
        lock.acquire(A, [A, B]);
        lock.adopt(C);
        lock.adopt(A);
        assert_eq!(lock.release(A).unwrap(), ReleaseTransition::Disengaged { peers: vec![B, C] });

        lock.adopt(C);
        assert!(!lock.holds(C));
    }
}
