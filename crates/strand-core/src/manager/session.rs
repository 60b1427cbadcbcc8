//! The shared core of a debugging session.
//!
//! [`Session`] is owned through an `Arc` by the [`super::ThreadManager`], its
//! engine thread and its wait thread. Everything that touches an engine runs
//! on the engine thread; other threads only install work into the slot and
//! wait.

use std::collections::{HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use once_cell::sync::OnceCell;
use tracing::{debug, error, info, trace, warn};

use super::lock;
use super::process::ProcessHandle;
use super::state::{CommandOwner, LoopState, ManagerState, Next};
use crate::arch::Architecture;
use crate::breakpoints::{BreakpointManager, MaskedMemory};
use crate::command::{Command, CommandKind, CommandPermit, CommandResult, CommandValue, Query};
use crate::config::{LaunchTarget, SessionConfig};
use crate::engine::operation::ResumeMode;
use crate::engine::{EngineHost, EngineState, Resumption, Stashed, SteppingEngine};
use crate::error::{StrandError, StrandResult};
use crate::events::{DebuggerEvent, EventHub};
use crate::inferior::{ChildEvent, InferiorTransport, WaitEvent, WaitOutcome};
use crate::symbols::SymbolProvider;
use crate::thread_lock::{LockTransition, ReleaseTransition, ThreadLock};
use crate::types::{TargetAddress, ThreadId};

/// Registry entry for one thread.
struct Slot
{
    /// `None` while the engine is checked out on the engine thread.
    engine: Option<SteppingEngine>,
    is_main: bool,
    state: EngineState,
}

/// Work queued by engines for the loop to run once they are back in the
/// registry.
#[derive(Debug)]
enum Deferred
{
    /// Every peer of the lock initiator is stopped.
    PeersStopped,
    Replay(Stashed),
    Resume(ResumeMode),
}

#[derive(Debug, Default)]
struct Bootstrap
{
    main_thread: Option<ThreadId>,
    attached: bool,
    initial_stop_seen: bool,
    /// Address startup runs to, when there is one.
    main_address: Option<TargetAddress>,
    checkpoint_reached: bool,
}

#[derive(Debug)]
enum Startup
{
    Pending,
    Ready(ThreadId),
    Failed(StrandError),
    /// The result was handed to the caller.
    Reported,
}

pub(crate) struct Session
{
    transport: Arc<dyn InferiorTransport>,
    arch: Arc<dyn Architecture>,
    symbols: Arc<dyn SymbolProvider>,
    config: SessionConfig,
    pub(crate) hub: EventHub,

    state: Mutex<LoopState>,
    /// The engine loop waits here for work.
    engine_wakeup: Condvar,
    /// Callers and the wait thread wait here for the slot to drain, for
    /// results, and for re-arming.
    waiters: Condvar,

    registry: Mutex<HashMap<ThreadId, Slot>>,
    breakpoints: Mutex<BreakpointManager>,
    thread_lock: Mutex<ThreadLock>,
    pending_events: Mutex<Vec<DebuggerEvent>>,
    deferred: Mutex<VecDeque<(ThreadId, Deferred)>>,
    bootstrap: Mutex<Bootstrap>,
    startup: Mutex<Startup>,
    startup_changed: Condvar,

    engine_thread: OnceCell<thread::ThreadId>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    me: Weak<Session>,
}

impl Session
{
    pub(crate) fn new(
        transport: Arc<dyn InferiorTransport>,
        arch: Arc<dyn Architecture>,
        symbols: Arc<dyn SymbolProvider>,
        config: SessionConfig,
    ) -> Arc<Self>
    {
        let breakpoints = BreakpointManager::new(arch.breakpoint_instruction());
        Arc::new_cyclic(|me| Self {
            transport,
            arch,
            symbols,
            config,
            hub: EventHub::new(),
            state: Mutex::new(LoopState::new()),
            engine_wakeup: Condvar::new(),
            waiters: Condvar::new(),
            registry: Mutex::new(HashMap::new()),
            breakpoints: Mutex::new(breakpoints),
            thread_lock: Mutex::new(ThreadLock::new()),
            pending_events: Mutex::new(Vec::new()),
            deferred: Mutex::new(VecDeque::new()),
            bootstrap: Mutex::new(Bootstrap::default()),
            startup: Mutex::new(Startup::Pending),
            startup_changed: Condvar::new(),
            engine_thread: OnceCell::new(),
            threads: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    pub(crate) fn handle(&self, thread: ThreadId, is_main: bool) -> ProcessHandle
    {
        ProcessHandle::new(thread, is_main, self.me.clone())
    }

    fn on_engine_thread(&self) -> bool
    {
        self.engine_thread.get() == Some(&thread::current().id())
    }

    // ---------------------------------------------------------------------
    // Session start and teardown
    // ---------------------------------------------------------------------

    /// Spawn the wait and engine threads and block until the target reached
    /// its initialization checkpoint.
    pub(crate) fn start(self: &Arc<Self>, target: LaunchTarget) -> StrandResult<ProcessHandle>
    {
        {
            let startup = lock(&self.startup);
            if !matches!(*startup, Startup::Pending) || !lock(&self.threads).is_empty() {
                return Err(StrandError::InvalidArgument("session was already started".to_string()));
            }
        }

        let waiter = Arc::clone(self);
        let wait_thread = thread::Builder::new()
            .name("strand-wait".to_string())
            .spawn(move || waiter.run_wait_thread())?;

        let engine = Arc::clone(self);
        let engine_thread = thread::Builder::new()
            .name("strand-engine".to_string())
            .spawn(move || engine.run_engine_thread(target))?;

        lock(&self.threads).extend([wait_thread, engine_thread]);

        let mut startup = lock(&self.startup);
        while matches!(*startup, Startup::Pending) {
            startup = self
                .startup_changed
                .wait(startup)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        match std::mem::replace(&mut *startup, Startup::Reported) {
            Startup::Ready(thread) => Ok(self.handle(thread, true)),
            Startup::Failed(error) => {
                drop(startup);
                self.dispose();
                Err(error)
            }
            Startup::Pending | Startup::Reported => Err(StrandError::SessionClosed),
        }
    }

    fn fail_startup(&self, error: StrandError)
    {
        let mut startup = lock(&self.startup);
        if matches!(*startup, Startup::Pending) {
            error!(%error, "session startup failed");
            *startup = Startup::Failed(error);
            self.startup_changed.notify_all();
        } else {
            debug!(%error, "startup already settled");
        }
    }

    fn complete_startup(&self)
    {
        let thread = {
            let bootstrap = lock(&self.bootstrap);
            if !bootstrap.checkpoint_reached {
                return;
            }
            bootstrap.main_thread
        };
        let Some(thread) = thread else { return };

        let mut startup = lock(&self.startup);
        if matches!(*startup, Startup::Pending) {
            info!(%thread, "session initialized");
            *startup = Startup::Ready(thread);
            self.startup_changed.notify_all();
        }
    }

    /// Stop both threads. Idempotent; joins unless called from the engine
    /// thread itself.
    pub(crate) fn dispose(&self)
    {
        {
            let mut state = lock(&self.state);
            if state.disposed {
                return;
            }
            debug!("disposing session");
            state.disposed = true;
            state.abort = true;
            self.engine_wakeup.notify_all();
            self.waiters.notify_all();
        }
        self.transport.wake();

        let handles: Vec<_> = lock(&self.threads).drain(..).collect();
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("session thread panicked");
            }
        }
    }

    fn launch(&self, target: &LaunchTarget) -> StrandResult<()>
    {
        let spawned = match target {
            LaunchTarget::Spawn(spec) => self.transport.spawn(spec).map_err(|error| {
                StrandError::Startup(format!(
                    "cannot launch {}: {error}",
                    spec.program().unwrap_or("<no program>")
                ))
            })?,
            LaunchTarget::Attach(pid) => self
                .transport
                .attach(*pid)
                .map_err(|error| StrandError::Startup(format!("cannot attach to {pid}: {error}")))?,
        };

        let thread = spawned.inferior.thread_id();
        info!(%thread, pid = %spawned.inferior.process_id(), "target launched");

        if let Some(stdout) = spawned.stdout {
            self.forward_output(stdout, false)?;
        }
        if let Some(stderr) = spawned.stderr {
            self.forward_output(stderr, true)?;
        }

        {
            let mut bootstrap = lock(&self.bootstrap);
            bootstrap.main_thread = Some(thread);
            bootstrap.attached = matches!(target, LaunchTarget::Attach(_));
        }
        lock(&self.registry).insert(
            thread,
            Slot {
                engine: Some(SteppingEngine::new(spawned.inferior, true)),
                is_main: true,
                state: EngineState::Stopped,
            },
        );
        self.publish(DebuggerEvent::MainThreadCreated(self.handle(thread, true)));
        Ok(())
    }

    fn forward_output(&self, stream: Box<dyn Read + Send>, is_stderr: bool) -> StrandResult<()>
    {
        let session = self.me.clone();
        let publish = self.config.capture_output;
        let name = if is_stderr { "strand-stderr" } else { "strand-stdout" };
        thread::Builder::new().name(name.to_string()).spawn(move || {
            // Uncaptured output is drained and dropped.
            for line in BufReader::new(stream).lines() {
                let Ok(line) = line else { break };
                if !publish {
                    continue;
                }
                let Some(session) = session.upgrade() else { break };
                session.hub.publish(&DebuggerEvent::TargetOutput { is_stderr, line });
            }
            trace!(is_stderr, "target output closed");
        })?;
        Ok(())
    }

    fn teardown(&self)
    {
        let detach = self.config.detach_on_dispose;
        let engines: Vec<SteppingEngine> = lock(&self.registry)
            .drain()
            .filter_map(|(_, slot)| slot.engine)
            .collect();

        for mut engine in engines {
            if detach && engine.is_main() && !engine.is_exited() {
                if let Err(error) = lock(&self.breakpoints).clear(engine.inferior_mut()) {
                    warn!(%error, "could not restore breakpoints before detaching");
                }
            }
            if let Err(error) = engine.shutdown(detach) {
                debug!(thread = %engine.thread_id(), %error, "shutdown failed");
            }
        }

        {
            let mut state = lock(&self.state);
            state.abort = true;
            state.phase = ManagerState::Aborting;
            if state.command_owner == Some(CommandOwner::Sync) && state.command_result.is_none() {
                state.command_result = Some(CommandResult::Error(StrandError::SessionClosed));
            }
            self.waiters.notify_all();
        }
        self.transport.wake();
        self.fail_startup(StrandError::SessionClosed);
        info!("session torn down");
    }

    // ---------------------------------------------------------------------
    // Wait thread
    // ---------------------------------------------------------------------

    fn run_wait_thread(self: Arc<Self>)
    {
        debug!("wait thread started");
        loop {
            {
                let mut state = lock(&self.state);
                while !state.wait_armed && !state.abort {
                    state = self.wait(state);
                }
                if state.abort {
                    break;
                }
                state.wait_armed = false;
            }

            match self.transport.global_wait() {
                Ok(WaitOutcome::Event(event)) => {
                    trace!(thread = %event.thread, event = %event.event, "wait event");
                    let mut state = lock(&self.state);
                    if state.has_event() {
                        state.fatal = state.install_event(event).err();
                        self.engine_wakeup.notify_all();
                        break;
                    }
                    while state.has_command() && !state.abort {
                        state = self.wait(state);
                    }
                    if state.abort {
                        break;
                    }
                    if let Err(error) = state.install_event(event) {
                        state.fatal = Some(error);
                        self.engine_wakeup.notify_all();
                        break;
                    }
                    self.engine_wakeup.notify_all();
                }
                Ok(WaitOutcome::NoChildren) => debug!("no traced threads left"),
                Ok(WaitOutcome::Woken) => {
                    let mut state = lock(&self.state);
                    if state.abort {
                        break;
                    }
                    state.wait_armed = true;
                }
                Err(error) => {
                    error!(%error, "global wait failed");
                    let mut state = lock(&self.state);
                    state.fatal = Some(error);
                    self.engine_wakeup.notify_all();
                    break;
                }
            }
        }
        debug!("wait thread finished");
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, LoopState>) -> MutexGuard<'a, LoopState>
    {
        self.waiters.wait(guard).unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Let the wait thread report one more event. Called once per processed
    /// event so the slot never receives a second one.
    fn arm_wait_thread(&self)
    {
        let mut state = lock(&self.state);
        state.wait_armed = true;
        self.waiters.notify_all();
    }

    // ---------------------------------------------------------------------
    // Engine thread
    // ---------------------------------------------------------------------

    fn run_engine_thread(self: Arc<Self>, target: LaunchTarget)
    {
        let _ = self.engine_thread.set(thread::current().id());
        debug!("engine thread started");

        if let Err(error) = self.launch(&target) {
            self.fail_startup(error);
            self.teardown();
            return;
        }
        self.flush_events();
        self.arm_wait_thread();

        loop {
            let next = {
                let mut state = lock(&self.state);
                loop {
                    if let Some(next) = state.next() {
                        // The slot may have drained.
                        self.waiters.notify_all();
                        break next;
                    }
                    state = self
                        .engine_wakeup
                        .wait(state)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
            };

            match next {
                Next::Abort => break,
                Next::Fatal(error) => {
                    self.fatal(error);
                    break;
                }
                Next::Event(event) => {
                    if let Err(error) = self.dispatch_event(event) {
                        if !self.background_failure(&format!("thread {}", event.thread), error) {
                            break;
                        }
                    }
                    self.arm_wait_thread();
                }
                Next::Interrupt { dropped, owner } => self.service_interrupt(dropped, owner),
                Next::Kill => {
                    if let Err(error) = self.kill_target() {
                        warn!(%error, "kill failed");
                    }
                }
                Next::Command { command, sync } => self.service_command(command, sync),
            }

            self.after_work();
            let mut state = lock(&self.state);
            if state.phase != ManagerState::Aborting {
                state.phase = ManagerState::Idle;
            }
        }

        self.teardown();
        debug!("engine thread finished");
    }

    /// Deferred work, then events, then startup completion.
    fn after_work(&self)
    {
        self.process_deferred();
        self.flush_events();
        self.complete_startup();
    }

    fn fatal(&self, error: StrandError)
    {
        error!(%error, "fatal session error");
        self.publish(DebuggerEvent::DebuggerError {
            sender: "thread manager".to_string(),
            message: "session terminated".to_string(),
            error: Some(Arc::new(StrandError::Internal(error.to_string()))),
        });
        self.flush_events();
        self.fail_startup(error);
    }

    /// Returns false if the loop has to stop.
    fn background_failure(&self, sender: &str, error: StrandError) -> bool
    {
        let starting = matches!(*lock(&self.startup), Startup::Pending);
        if error.is_fatal() || starting {
            let error = if starting && !error.is_fatal() {
                match error {
                    StrandError::Startup(_) => error,
                    other => StrandError::Startup(other.to_string()),
                }
            } else {
                error
            };
            self.fatal(error);
            return false;
        }

        error!(sender, %error, "background failure");
        self.publish(DebuggerEvent::DebuggerError {
            sender: sender.to_string(),
            message: error.to_string(),
            error: Some(Arc::new(error)),
        });
        true
    }

    fn service_interrupt(&self, dropped: Option<Command>, owner: Option<CommandOwner>)
    {
        if let Some(command) = dropped {
            info!(%command, "command interrupted before it ran");
            let mut state = lock(&self.state);
            match owner {
                Some(CommandOwner::Sync) => state.command_result = Some(CommandResult::Interrupted),
                Some(CommandOwner::Engine(thread)) => {
                    state.release_engine_owner(thread);
                }
                None => {}
            }
            self.waiters.notify_all();
            return;
        }

        match owner {
            Some(CommandOwner::Engine(thread)) => {
                debug!(%thread, "relaying interrupt");
                if let Err(error) = self.with_engine(thread, SteppingEngine::interrupt) {
                    warn!(%thread, %error, "could not interrupt thread");
                }
            }
            Some(CommandOwner::Sync) => {
                debug!("interrupting a sync caller before its command is queued");
                self.waiters.notify_all();
            }
            None => debug!("interrupt with nothing to interrupt"),
        }
    }

    fn service_command(&self, command: Command, sync: bool)
    {
        trace!(%command, sync, "servicing command");
        let thread = command.thread;
        let result = self.execute_guarded(command);

        let mut state = lock(&self.state);
        if sync {
            state.command_result = Some(result);
        } else if let CommandResult::Error(error) = result {
            state.release_engine_owner(thread);
            drop(state);
            error!(%thread, %error, "operation failed to start");
            self.publish(DebuggerEvent::DebuggerError {
                sender: format!("thread {thread}"),
                message: "operation failed to start".to_string(),
                error: Some(Arc::new(error)),
            });
            return;
        }
        self.waiters.notify_all();
    }

    fn execute_guarded(&self, command: Command) -> CommandResult
    {
        match catch_unwind(AssertUnwindSafe(|| self.execute_command(command))) {
            Ok(result) => result.into(),
            Err(_) => CommandResult::Error(StrandError::Internal("command panicked".to_string())),
        }
    }

    fn execute_command(&self, command: Command) -> StrandResult<CommandValue>
    {
        let thread = command.thread;
        match command.kind {
            CommandKind::Immediate(query) => self.with_engine(thread, |engine| engine.execute(self, query)),
            CommandKind::Operation(operation) => self
                .with_engine(thread, |engine| engine.start_operation(self, operation))
                .map(|()| CommandValue::None),
        }
    }

    fn kill_target(&self) -> StrandResult<()>
    {
        let main = lock(&self.bootstrap).main_thread.ok_or(StrandError::SessionClosed)?;
        self.with_engine(main, |engine| engine.execute(self, Query::Kill).map(|_| ()))
    }

    // ---------------------------------------------------------------------
    // Event dispatch
    // ---------------------------------------------------------------------

    fn dispatch_event(&self, event: WaitEvent) -> StrandResult<()>
    {
        let WaitEvent { thread, event } = event;
        if !lock(&self.registry).contains_key(&thread) {
            return Err(StrandError::Internal(format!(
                "{event} reported for unknown thread {thread}"
            )));
        }

        {
            let mut bootstrap = lock(&self.bootstrap);
            if !bootstrap.initial_stop_seen {
                if event != (ChildEvent::Stopped { signal: 0 }) || bootstrap.main_thread != Some(thread) {
                    error!(%thread, %event, "unexpected event before the initial stop");
                    return Err(StrandError::ProtocolViolation(format!(
                        "expected the initial stop of the main thread, got {event} on thread {thread}"
                    )));
                }
                bootstrap.initial_stop_seen = true;
                drop(bootstrap);
                return self.bootstrap_main(thread);
            }
        }

        match event {
            ChildEvent::CreatedThread { thread: child } => self.thread_created(thread, child),
            event => self.with_engine(thread, |engine| engine.process_event(self, event)),
        }
    }

    fn bootstrap_main(&self, thread: ThreadId) -> StrandResult<()>
    {
        let attached = lock(&self.bootstrap).attached;
        let target = if self.config.stop_at_main && !attached {
            self.with_engine(thread, |engine| {
                let main = {
                    let breakpoints = lock(&self.breakpoints);
                    let memory = MaskedMemory::new(engine.inferior(), &breakpoints);
                    self.symbols.main_method(&memory)
                }
                .map_err(|error| StrandError::Startup(format!("cannot find main: {error}")))?;
                match main {
                    Some(main) => Ok(Some(main)),
                    None => engine.inferior().entry_address(),
                }
            })?
        } else {
            None
        };

        debug!(%thread, ?target, "initial stop");
        lock(&self.bootstrap).main_address = target;
        self.with_engine(thread, |engine| engine.start(self, target))
    }

    fn thread_created(&self, origin: ThreadId, child: ThreadId) -> StrandResult<()>
    {
        info!(%origin, %child, "thread created");
        let inferior = self.with_engine(origin, |engine| engine.inferior().create_thread(child))?;
        let mut engine = SteppingEngine::new(inferior, false);

        lock(&self.registry).insert(
            child,
            Slot {
                engine: None,
                is_main: false,
                state: EngineState::Stopped,
            },
        );

        let held = {
            let mut thread_lock = lock(&self.thread_lock);
            thread_lock.adopt(child);
            thread_lock.holds(child)
        };
        let started = if held {
            engine.acquire_thread_lock().map(|_| ())
        } else {
            Ok(())
        }
        .and_then(|()| engine.start_free_running(self));
        self.checkin(engine);
        started?;

        self.publish(DebuggerEvent::ThreadCreated(self.handle(child, false)));
        self.with_engine(origin, |engine| engine.resume_after_event(self))
    }

    // ---------------------------------------------------------------------
    // Engine registry
    // ---------------------------------------------------------------------

    fn with_engine<R>(&self, thread: ThreadId, f: impl FnOnce(&mut SteppingEngine) -> StrandResult<R>)
        -> StrandResult<R>
    {
        let mut engine = self.checkout(thread)?;
        let result = f(&mut engine);
        self.checkin(engine);
        result
    }

    fn checkout(&self, thread: ThreadId) -> StrandResult<SteppingEngine>
    {
        let mut registry = lock(&self.registry);
        let slot = registry.get_mut(&thread).ok_or(StrandError::UnknownThread(thread))?;
        slot.engine
            .take()
            .ok_or_else(|| StrandError::Internal(format!("engine of thread {thread} is already in use")))
    }

    fn checkin(&self, engine: SteppingEngine)
    {
        if engine.is_exited() {
            self.retire(&engine);
            return;
        }
        let mut registry = lock(&self.registry);
        if let Some(slot) = registry.get_mut(&engine.thread_id()) {
            slot.state = engine.state();
            slot.engine = Some(engine);
        }
    }

    fn retire(&self, engine: &SteppingEngine)
    {
        let thread = engine.thread_id();
        debug!(%thread, "retiring engine");
        lock(&self.registry).remove(&thread);

        let mut resumed = Vec::new();
        {
            let mut thread_lock = lock(&self.thread_lock);
            if thread_lock.initiator() == Some(thread) {
                warn!(%thread, "lock initiator exited while holding the global thread lock");
                while thread_lock.is_held() {
                    match thread_lock.release(thread) {
                        Ok(ReleaseTransition::Disengaged { peers }) => resumed = peers,
                        Ok(ReleaseTransition::Nested { .. }) => {}
                        Err(_) => break,
                    }
                }
            } else if thread_lock.forget(thread) {
                if let Some(initiator) = thread_lock.initiator() {
                    lock(&self.deferred).push_back((initiator, Deferred::PeersStopped));
                }
            }
        }
        for peer in resumed {
            self.release_peer(peer);
        }
        {
            let mut state = lock(&self.state);
            if state.release_engine_owner(thread) {
                self.waiters.notify_all();
            }
        }

        if engine.is_main() {
            if !lock(&self.bootstrap).checkpoint_reached {
                self.fail_startup(StrandError::Startup(format!(
                    "main thread {thread} exited before the session was initialized"
                )));
            }
            self.publish(DebuggerEvent::TargetExited);
        } else {
            self.publish(DebuggerEvent::ThreadExited(self.handle(thread, false)));
        }
    }

    fn release_peer(&self, peer: ThreadId)
    {
        let resumption = {
            let mut registry = lock(&self.registry);
            registry
                .get_mut(&peer)
                .and_then(|slot| slot.engine.as_mut())
                .and_then(SteppingEngine::release_thread_lock)
        };
        let deferred = match resumption {
            Some(Resumption::Replay(stashed)) => Deferred::Replay(stashed),
            Some(Resumption::Resume(mode)) => Deferred::Resume(mode),
            None => return,
        };
        lock(&self.deferred).push_back((peer, deferred));
    }

    fn process_deferred(&self)
    {
        loop {
            let Some((thread, work)) = lock(&self.deferred).pop_front() else {
                break;
            };
            trace!(%thread, ?work, "deferred work");
            let result = match work {
                Deferred::PeersStopped => self.with_engine(thread, |engine| engine.peers_quiescent(self)),
                Deferred::Resume(mode) => self.with_engine(thread, |engine| engine.resume_released(self, mode)),
                Deferred::Replay(stashed) => self
                    .with_engine(thread, |engine| Ok(engine.restore(stashed)))
                    .and_then(|event| self.dispatch_event(WaitEvent { thread, event })),
            };
            if let Err(error) = result {
                if !self.background_failure(&format!("thread {thread}"), error) {
                    let mut state = lock(&self.state);
                    state.abort = true;
                    self.engine_wakeup.notify_all();
                    break;
                }
            }
        }
    }

    fn flush_events(&self)
    {
        let events: Vec<_> = lock(&self.pending_events).drain(..).collect();
        for event in &events {
            self.hub.publish(event);
        }
    }

    // ---------------------------------------------------------------------
    // Public operations (any thread)
    // ---------------------------------------------------------------------

    pub(crate) fn send_sync_command(&self, command: Command) -> CommandResult
    {
        if self.on_engine_thread() {
            trace!(%command, "re-entrant command runs inline");
            let result = self.execute_guarded(command);
            self.after_work();
            return result;
        }

        let mut state = lock(&self.state);
        if state.abort {
            return CommandResult::Error(StrandError::SessionClosed);
        }
        if state.command_owner.is_some() {
            return CommandResult::Busy;
        }
        state.command_owner = Some(CommandOwner::Sync);
        state.command_result = None;

        while (state.has_event() || state.has_command()) && state.command_result.is_none() {
            if state.abort {
                break;
            }
            state = self.wait(state);
        }
        if !state.abort && state.command_result.is_none() {
            if let Err(error) = state.install_command(command, true) {
                state.command_owner = None;
                return CommandResult::Error(error);
            }
            self.engine_wakeup.notify_all();
        }

        while state.command_result.is_none() && !state.abort {
            state = self.wait(state);
        }
        let result = state
            .command_result
            .take()
            .unwrap_or(CommandResult::Error(StrandError::SessionClosed));
        state.command_owner = None;
        self.waiters.notify_all();
        result
    }

    pub(crate) fn acquire_command_mutex(&self, thread: ThreadId) -> StrandResult<CommandPermit>
    {
        let mut state = lock(&self.state);
        if state.abort {
            return Err(StrandError::SessionClosed);
        }
        if state.command_owner.is_some() {
            return Err(StrandError::Busy);
        }
        state.command_owner = Some(CommandOwner::Engine(thread));

        let session = self.me.clone();
        Ok(CommandPermit {
            thread,
            release: Some(Box::new(move || {
                if let Some(session) = session.upgrade() {
                    let mut state = lock(&session.state);
                    if state.release_engine_owner(thread) {
                        session.waiters.notify_all();
                    }
                }
            })),
        })
    }

    pub(crate) fn send_async_command(&self, permit: CommandPermit, command: Command) -> StrandResult<()>
    {
        if permit.thread() != command.thread || !matches!(command.kind, CommandKind::Operation(_)) {
            return Err(StrandError::InvalidArgument(format!(
                "permit for thread {} cannot run {command}",
                permit.thread()
            )));
        }

        if self.on_engine_thread() {
            permit.disarm();
            self.service_command(command, false);
            self.after_work();
            return Ok(());
        }

        let mut state = lock(&self.state);
        while (state.has_event() || state.has_command()) && !state.abort {
            state = self.wait(state);
        }
        if state.abort {
            drop(state);
            return Err(StrandError::SessionClosed);
        }
        state.install_command(command, false)?;
        permit.disarm();
        self.engine_wakeup.notify_all();
        Ok(())
    }

    pub(crate) fn interrupt(&self)
    {
        let mut state = lock(&self.state);
        state.interrupt = true;
        self.engine_wakeup.notify_all();
    }

    pub(crate) fn kill(&self)
    {
        let mut state = lock(&self.state);
        state.kill = true;
        self.engine_wakeup.notify_all();
    }

    pub(crate) fn manager_state(&self) -> ManagerState
    {
        lock(&self.state).phase
    }

    pub(crate) fn threads(&self) -> Vec<ProcessHandle>
    {
        let mut threads: Vec<_> = lock(&self.registry)
            .iter()
            .map(|(thread, slot)| self.handle(*thread, slot.is_main))
            .collect();
        threads.sort_by_key(ProcessHandle::thread_id);
        threads
    }

    pub(crate) fn main_thread(&self) -> Option<ProcessHandle>
    {
        let thread = lock(&self.bootstrap).main_thread?;
        lock(&self.registry)
            .contains_key(&thread)
            .then(|| self.handle(thread, true))
    }

    /// Last state the engine reported, readable while it runs.
    pub(crate) fn thread_state(&self, thread: ThreadId) -> StrandResult<EngineState>
    {
        lock(&self.registry)
            .get(&thread)
            .map(|slot| slot.state)
            .ok_or(StrandError::UnknownThread(thread))
    }

    pub(crate) fn backtrace_limit(&self) -> usize
    {
        self.config.backtrace_limit
    }
}

impl EngineHost for Session
{
    fn architecture(&self) -> &dyn Architecture
    {
        self.arch.as_ref()
    }

    fn symbols(&self) -> &dyn SymbolProvider
    {
        self.symbols.as_ref()
    }

    fn config(&self) -> &SessionConfig
    {
        &self.config
    }

    fn breakpoints(&self) -> MutexGuard<'_, BreakpointManager>
    {
        lock(&self.breakpoints)
    }

    fn publish(&self, event: DebuggerEvent)
    {
        lock(&self.pending_events).push(event);
    }

    fn acquire_global_thread_lock(&self, caller: ThreadId) -> StrandResult<bool>
    {
        let threads: Vec<ThreadId> = lock(&self.registry).keys().copied().collect();
        let transition = lock(&self.thread_lock).acquire(caller, threads);

        match transition {
            LockTransition::Nested { level } => {
                trace!(%caller, level, "global thread lock nested");
                Ok(lock(&self.thread_lock).is_quiescent())
            }
            LockTransition::Engaged { peers } => {
                debug!(%caller, peers = peers.len(), "global thread lock engaged");
                for peer in peers {
                    let pending = {
                        let mut registry = lock(&self.registry);
                        match registry.get_mut(&peer).and_then(|slot| slot.engine.as_mut()) {
                            Some(engine) => engine.acquire_thread_lock()?,
                            None => {
                                warn!(%peer, "peer engine unavailable while engaging the lock");
                                false
                            }
                        }
                    };
                    if pending {
                        lock(&self.thread_lock).mark_pending(peer);
                    }
                }
                Ok(lock(&self.thread_lock).is_quiescent())
            }
        }
    }

    fn release_global_thread_lock(&self, caller: ThreadId) -> StrandResult<()>
    {
        let transition = lock(&self.thread_lock).release(caller)?;
        match transition {
            ReleaseTransition::Nested { level } => {
                trace!(%caller, level, "global thread lock still held");
            }
            ReleaseTransition::Disengaged { peers } => {
                debug!(%caller, peers = peers.len(), "global thread lock released");
                for peer in peers {
                    self.release_peer(peer);
                }
            }
        }
        Ok(())
    }

    fn peer_stopped(&self, thread: ThreadId)
    {
        let mut thread_lock = lock(&self.thread_lock);
        if thread_lock.peer_stopped(thread) {
            if let Some(initiator) = thread_lock.initiator() {
                trace!(%initiator, "all peers stopped");
                lock(&self.deferred).push_back((initiator, Deferred::PeersStopped));
            }
        }
    }

    fn operation_finished(&self, thread: ThreadId)
    {
        let mut state = lock(&self.state);
        if state.release_engine_owner(thread) {
            trace!(%thread, "command mutex released");
            self.waiters.notify_all();
        }
    }

    fn startup_checkpoint(&self, thread: ThreadId, pc: TargetAddress) -> StrandResult<()>
    {
        let mut bootstrap = lock(&self.bootstrap);
        if let Some(expected) = bootstrap.main_address {
            if pc != expected {
                return Err(StrandError::Startup(format!(
                    "main thread {thread} stopped at {pc}, expected {expected}"
                )));
            }
        }
        bootstrap.checkpoint_reached = true;
        drop(bootstrap);
        self.publish(DebuggerEvent::Initialized(self.handle(thread, true)));
        Ok(())
    }
}
