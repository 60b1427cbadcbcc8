//! # Stepping Engine
//!
//! One [`SteppingEngine`] exists per debugged native thread. It owns the
//! thread's [`InferiorConnection`] and turns raw [`ChildEvent`]s into stop
//! reports: it recognizes breakpoint traps, drives multi-stage stepping
//! operations, steps over breakpoints at the current pc, and takes part in the
//! global thread lock.
//!
//! Engines never block. Every operation is a small state machine that issues
//! a single `Continue` or `Step` and waits for the next event, so the thread
//! manager can keep servicing other threads meanwhile.
//!
//! ## Thread affinity
//!
//! Engines live in the thread manager's registry and are only touched on the
//! engine thread. Everything an engine needs from the session (architecture,
//! symbols, shared breakpoints, the global lock, event publication) goes
//! through [`EngineHost`].

pub mod operation;

use std::sync::MutexGuard;

use tracing::{debug, info, trace, warn};

pub use operation::{EngineState, Operation};
use operation::{ActiveOperation, OperationKind, Plan, ResumeMode};

use crate::arch::Architecture;
use crate::breakpoints::{BreakpointHandle, BreakpointKind, BreakpointManager, BreakpointScope, MaskedMemory};
use crate::command::{CommandValue, Query};
use crate::config::SessionConfig;
use crate::error::{StrandError, StrandResult};
use crate::events::{DebuggerEvent, StopReason, TargetEvent};
use crate::inferior::{ChildEvent, InferiorConnection, NotificationKind, ServerCommand, TargetMemoryAccess};
use crate::symbols::SymbolProvider;
use crate::types::{Backtrace, StackFrame, TargetAddress, ThreadId};

const SIGTRAP: i32 = libc::SIGTRAP;
const SIGSTOP: i32 = libc::SIGSTOP;

/// Session services available to an engine while it processes work.
pub(crate) trait EngineHost
{
    fn architecture(&self) -> &dyn Architecture;

    fn symbols(&self) -> &dyn SymbolProvider;

    fn config(&self) -> &SessionConfig;

    fn breakpoints(&self) -> MutexGuard<'_, BreakpointManager>;

    /// Queue an event; it is published once the engine is back in the registry.
    fn publish(&self, event: DebuggerEvent);

    /// Take one level of the global thread lock. Returns whether every peer is
    /// already stopped.
    fn acquire_global_thread_lock(&self, caller: ThreadId) -> StrandResult<bool>;

    fn release_global_thread_lock(&self, caller: ThreadId) -> StrandResult<()>;

    /// A peer held by the global lock has stopped.
    fn peer_stopped(&self, thread: ThreadId);

    /// The stepping operation of `thread` completed; release the command mutex
    /// if that thread owns it.
    fn operation_finished(&self, thread: ThreadId);

    /// The main thread reached the point where startup ends.
    fn startup_checkpoint(&self, thread: ThreadId, pc: TargetAddress) -> StrandResult<()>;
}

/// Event that arrived while the thread was held by the global lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Stashed
{
    pub event: ChildEvent,
    mode: Option<ResumeMode>,
}

/// Follow-up work after the global lock let go of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resumption
{
    Replay(Stashed),
    Resume(ResumeMode),
}

/// Participation in the global thread lock.
#[derive(Debug, Default)]
struct ForcedStop
{
    locked: bool,
    /// `stop()` was sent to a running thread and its SIGSTOP has not been
    /// seen yet.
    stop_requested: bool,
    /// The thread reported some other stop before the requested SIGSTOP. The
    /// signal is still queued and surfaces after the next resume.
    stale_stop: bool,
    /// How to resume when the lock is released.
    resume: Option<ResumeMode>,
    stashed: Option<Stashed>,
}

/// Stepping over a breakpoint inserted at the current pc.
#[derive(Debug, Clone, Copy)]
enum StepOver
{
    WaitingForPeers
    {
        address: TargetAddress, then: ResumeMode
    },
    Stepping
    {
        address: TargetAddress, then: ResumeMode
    },
}

/// Classified stop.
enum Stop
{
    StepDone,
    Breakpoint(crate::breakpoints::BreakpointInfo),
    /// Trap at a breakpoint that does not apply to this thread.
    Foreign,
    Signal(i32),
}

/// Per-thread stepping state machine.
pub struct SteppingEngine
{
    thread: ThreadId,
    inferior: Box<dyn InferiorConnection>,
    is_main: bool,
    running: Option<ResumeMode>,
    exited: bool,
    operation: Option<ActiveOperation>,
    forced: ForcedStop,
    step_over: Option<StepOver>,
    pending_signal: Option<i32>,
    interrupt_requested: bool,
}

impl std::fmt::Debug for SteppingEngine
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result
    {
        f.debug_struct("SteppingEngine")
            .field("thread", &self.thread)
            .field("is_main", &self.is_main)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl SteppingEngine
{
    pub(crate) fn new(inferior: Box<dyn InferiorConnection>, is_main: bool) -> Self
    {
        Self {
            thread: inferior.thread_id(),
            inferior,
            is_main,
            running: None,
            exited: false,
            operation: None,
            forced: ForcedStop::default(),
            step_over: None,
            pending_signal: None,
            interrupt_requested: false,
        }
    }

    #[must_use]
    pub fn thread_id(&self) -> ThreadId
    {
        self.thread
    }

    #[must_use]
    pub fn is_main(&self) -> bool
    {
        self.is_main
    }

    #[must_use]
    pub fn state(&self) -> EngineState
    {
        if self.exited {
            return EngineState::Exited;
        }
        if self.forced.stop_requested || matches!(self.step_over, Some(StepOver::WaitingForPeers { .. })) {
            return EngineState::WaitingForSignal;
        }
        match (self.running, &self.operation) {
            (None, _) => EngineState::Stopped,
            (Some(_), Some(op)) => op.state(),
            (Some(_), None) => EngineState::Running,
        }
    }

    #[must_use]
    pub fn is_exited(&self) -> bool
    {
        self.exited
    }

    pub(crate) fn inferior(&self) -> &dyn InferiorConnection
    {
        self.inferior.as_ref()
    }

    pub(crate) fn inferior_mut(&mut self) -> &mut dyn InferiorConnection
    {
        self.inferior.as_mut()
    }

    // ---------------------------------------------------------------------
    // Starting and resuming
    // ---------------------------------------------------------------------

    /// Begin the session on the main thread: run to `target`, or report the
    /// startup checkpoint right here when there is nothing to run to.
    pub(crate) fn start(&mut self, host: &dyn EngineHost, target: Option<TargetAddress>) -> StrandResult<()>
    {
        match target {
            Some(target) => {
                info!(thread = %self.thread, %target, "running to main");
                self.operation = Some(ActiveOperation::new(OperationKind::Startup(target)));
                self.advance(host)
            }
            None => {
                let pc = self.inferior.current_pc()?;
                host.startup_checkpoint(self.thread, pc)
            }
        }
    }

    /// Let a freshly created thread run freely.
    pub(crate) fn start_free_running(&mut self, host: &dyn EngineHost) -> StrandResult<()>
    {
        self.resume(host, ResumeMode::Continue)
    }

    /// Start a stepping operation. Completion is reported as an event.
    ///
    /// ## Errors
    ///
    /// [`StrandError::NotStopped`] if the thread is running or already busy.
    pub(crate) fn start_operation(&mut self, host: &dyn EngineHost, operation: Operation) -> StrandResult<()>
    {
        if self.exited || self.running.is_some() || self.operation.is_some() || self.step_over.is_some() {
            return Err(StrandError::NotStopped(self.thread));
        }
        debug!(thread = %self.thread, ?operation, "starting operation");
        self.operation = Some(ActiveOperation::new(OperationKind::User(operation)));
        if let Err(error) = self.advance(host) {
            self.drop_operation(host);
            return Err(error);
        }
        Ok(())
    }

    fn resume(&mut self, host: &dyn EngineHost, mode: ResumeMode) -> StrandResult<()>
    {
        if self.forced.locked {
            self.forced.resume = Some(mode);
            return Ok(());
        }
        if self.interrupt_requested && self.operation.is_some() {
            self.interrupt_requested = false;
            return self.finish(host, StopReason::Interrupted);
        }

        let pc = self.inferior.current_pc()?;
        if host.breakpoints().is_breakpoint(pc) {
            return self.begin_step_over(host, pc, mode);
        }
        self.issue(mode)
    }

    /// Send the resume command, or remember it while the lock holds us.
    fn issue(&mut self, mode: ResumeMode) -> StrandResult<()>
    {
        if self.forced.locked {
            self.forced.resume = Some(mode);
            return Ok(());
        }

        self.inferior.set_signal(self.pending_signal.take())?;
        let command = match mode {
            ResumeMode::Continue => ServerCommand::Continue,
            ResumeMode::Step => ServerCommand::Step,
        };
        self.inferior.send_command(command)?;
        self.running = Some(mode);
        trace!(thread = %self.thread, ?mode, "resumed");
        Ok(())
    }

    fn begin_step_over(&mut self, host: &dyn EngineHost, address: TargetAddress, then: ResumeMode) -> StrandResult<()>
    {
        debug!(thread = %self.thread, %address, "stepping over breakpoint");
        if host.acquire_global_thread_lock(self.thread)? {
            self.step_past(host, address, then)
        } else {
            self.step_over = Some(StepOver::WaitingForPeers { address, then });
            Ok(())
        }
    }

    fn step_past(&mut self, host: &dyn EngineHost, address: TargetAddress, then: ResumeMode) -> StrandResult<()>
    {
        host.breakpoints().lift(self.inferior.as_mut(), address)?;
        self.step_over = Some(StepOver::Stepping { address, then });
        self.issue(ResumeMode::Step)
    }

    /// Every peer has stopped; continue a pending step-over.
    pub(crate) fn peers_quiescent(&mut self, host: &dyn EngineHost) -> StrandResult<()>
    {
        if let Some(StepOver::WaitingForPeers { address, then }) = self.step_over {
            self.step_over = None;
            return self.step_past(host, address, then);
        }
        Ok(())
    }

    /// Put a lifted breakpoint back and drop the global lock taken for it.
    fn end_step_over(&mut self, host: &dyn EngineHost) -> StrandResult<Option<ResumeMode>>
    {
        match self.step_over.take() {
            Some(StepOver::Stepping { address, then }) => {
                host.breakpoints().replant(self.inferior.as_mut(), address)?;
                host.release_global_thread_lock(self.thread)?;
                Ok(Some(then))
            }
            Some(StepOver::WaitingForPeers { .. }) => {
                host.release_global_thread_lock(self.thread)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    // ---------------------------------------------------------------------
    // Global thread lock participation
    // ---------------------------------------------------------------------

    /// Held by another thread's global lock. Returns true if the thread is
    /// running and its stop has not arrived yet.
    pub(crate) fn acquire_thread_lock(&mut self) -> StrandResult<bool>
    {
        self.forced.locked = true;
        if self.exited || self.running.is_none() {
            return Ok(false);
        }
        self.request_stop()?;
        Ok(true)
    }

    /// Make sure a SIGSTOP is on its way to the running thread.
    fn request_stop(&mut self) -> StrandResult<()>
    {
        if self.forced.stop_requested {
            return Ok(());
        }
        if self.forced.stale_stop {
            // Still queued from an earlier request.
            self.forced.stale_stop = false;
        } else {
            self.inferior.stop()?;
        }
        self.forced.stop_requested = true;
        Ok(())
    }

    /// The thread stopped for a reason other than the requested SIGSTOP.
    fn stopped_first(&mut self)
    {
        if self.forced.stop_requested {
            trace!(thread = %self.thread, "requested stop overtaken by another event");
            self.forced.stop_requested = false;
            self.forced.stale_stop = true;
        }
    }

    fn is_requested_stop(&self, event: ChildEvent) -> bool
    {
        event == (ChildEvent::Stopped { signal: SIGSTOP }) && (self.forced.stop_requested || self.forced.stale_stop)
    }

    /// Released by the global lock. Returns what the thread manager has to do
    /// to let the thread carry on: replay an event that arrived meanwhile, or
    /// resume the thread if the lock stopped it.
    pub(crate) fn release_thread_lock(&mut self) -> Option<Resumption>
    {
        self.forced.locked = false;
        if let Some(stashed) = self.forced.stashed.take() {
            self.forced.resume = None;
            return Some(Resumption::Replay(stashed));
        }
        self.forced.resume.take().map(Resumption::Resume)
    }

    /// Continue after the global lock was released.
    pub(crate) fn resume_released(&mut self, host: &dyn EngineHost, mode: ResumeMode) -> StrandResult<()>
    {
        if self.exited || self.running.is_some() {
            return Ok(());
        }
        self.resume(host, mode)
    }

    /// Restore the resume state that was current when a stashed event arrived.
    pub(crate) fn restore(&mut self, stashed: Stashed) -> ChildEvent
    {
        self.running = stashed.mode;
        stashed.event
    }

    fn park(&mut self, host: &dyn EngineHost, event: ChildEvent) -> StrandResult<()>
    {
        let mode = self.running.take();
        if self.is_requested_stop(event) {
            self.forced.stop_requested = false;
            self.forced.stale_stop = false;
            self.forced.resume = mode;
        } else {
            trace!(thread = %self.thread, %event, "stashing event while held");
            self.forced.stashed = Some(Stashed { event, mode });
        }
        host.peer_stopped(self.thread);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Process one event for this thread.
    ///
    /// ## Errors
    ///
    /// Transport failures while inspecting or resuming the thread.
    pub(crate) fn process_event(&mut self, host: &dyn EngineHost, event: ChildEvent) -> StrandResult<()>
    {
        trace!(thread = %self.thread, %event, state = %self.state(), "processing event");

        match event {
            ChildEvent::Exited { code } => return self.exit(host, TargetEvent::Exited(code)),
            ChildEvent::Signaled { signal } => return self.exit(host, TargetEvent::Signaled(signal)),
            _ => {}
        }

        if !self.is_requested_stop(event) {
            self.stopped_first();
        }
        if self.forced.locked {
            return self.park(host, event);
        }

        let mode = self.running.take();
        match event {
            ChildEvent::None => match mode {
                Some(mode) => self.issue(mode),
                None => Ok(()),
            },
            ChildEvent::Stopped { signal } => self.stopped(host, signal, mode),
            ChildEvent::Notification { kind, argument } => self.runtime_notification(host, kind, argument, mode),
            ChildEvent::CreatedThread { thread } => Err(StrandError::Internal(format!(
                "thread creation of {thread} reached the engine of {}",
                self.thread
            ))),
            ChildEvent::Exited { .. } | ChildEvent::Signaled { .. } => Ok(()),
        }
    }

    /// Resume after the thread manager consumed an event (thread creation).
    pub(crate) fn resume_after_event(&mut self, host: &dyn EngineHost) -> StrandResult<()>
    {
        let mode = self.running.take().unwrap_or(ResumeMode::Continue);
        self.stopped_first();
        if self.forced.locked {
            host.peer_stopped(self.thread);
            self.forced.resume = Some(mode);
            return Ok(());
        }
        self.resume(host, mode)
    }

    fn exit(&mut self, host: &dyn EngineHost, event: TargetEvent) -> StrandResult<()>
    {
        info!(thread = %self.thread, ?event, "thread exited");
        self.exited = true;
        self.running = None;
        self.step_over = None;
        self.forced = ForcedStop::default();

        if let Some(op) = self.operation.take() {
            if !op.is_startup() {
                host.operation_finished(self.thread);
            }
        }

        if let Err(error) = host
            .breakpoints()
            .remove_thread_breakpoints(self.inferior.as_mut(), self.thread)
        {
            debug!(thread = %self.thread, %error, "could not restore thread breakpoints after exit");
        }

        host.publish(DebuggerEvent::TargetEvent {
            thread: self.thread,
            event,
        });
        Ok(())
    }

    fn stopped(&mut self, host: &dyn EngineHost, signal: i32, mode: Option<ResumeMode>) -> StrandResult<()>
    {
        if self.is_requested_stop(ChildEvent::Stopped { signal }) {
            self.forced.stop_requested = false;
            self.forced.stale_stop = false;
            if self.interrupt_requested {
                self.interrupt_requested = false;
                return self.finish(host, StopReason::Interrupted);
            }
            // Lock released before the stop arrived; carry on as before.
            return match mode {
                Some(mode) => self.issue(mode),
                None => Ok(()),
            };
        }

        if matches!(self.step_over, Some(StepOver::Stepping { .. })) {
            let then = self.end_step_over(host)?;
            if signal == SIGTRAP {
                return match then {
                    Some(ResumeMode::Continue) => self.resume(host, ResumeMode::Continue),
                    _ => self.step_completed(host),
                };
            }
        }

        match self.classify(host, signal, mode)? {
            Stop::StepDone => self.step_completed(host),
            Stop::Foreign => self.resume(host, mode.unwrap_or(ResumeMode::Continue)),
            Stop::Breakpoint(info) => {
                if info.kind == BreakpointKind::Temporary {
                    let owned = self.operation.as_ref().and_then(|op| op.temporary) == Some(info.handle);
                    if owned {
                        self.remove_temporary(host);
                        return self.advance(host);
                    }
                    warn!(thread = %self.thread, handle = %info.handle, "stale temporary breakpoint");
                    host.breakpoints().remove(self.inferior.as_mut(), info.handle)?;
                    return self.resume(host, mode.unwrap_or(ResumeMode::Continue));
                }
                host.breakpoints().record_hit(info.handle);
                self.finish(host, StopReason::Breakpoint(info.handle))
            }
            Stop::Signal(signal) => {
                if signal != SIGTRAP && signal != SIGSTOP {
                    self.pending_signal = Some(signal);
                }
                self.finish(host, StopReason::Signal(signal))
            }
        }
    }

    fn classify(&mut self, host: &dyn EngineHost, signal: i32, mode: Option<ResumeMode>) -> StrandResult<Stop>
    {
        if signal != SIGTRAP {
            return Ok(Stop::Signal(signal));
        }
        if mode == Some(ResumeMode::Step) {
            return Ok(Stop::StepDone);
        }

        let pc = self.inferior.current_pc()?;
        let site = pc - host.architecture().breakpoint_pc_adjustment();
        let (hit, any) = {
            let breakpoints = host.breakpoints();
            (breakpoints.lookup(site, self.thread).cloned(), breakpoints.is_breakpoint(site))
        };

        match hit {
            Some(info) => {
                self.inferior.set_pc(site)?;
                Ok(Stop::Breakpoint(info))
            }
            None if any => {
                self.inferior.set_pc(site)?;
                Ok(Stop::Foreign)
            }
            None => Ok(Stop::Signal(SIGTRAP)),
        }
    }

    fn step_completed(&mut self, host: &dyn EngineHost) -> StrandResult<()>
    {
        if self.operation.is_some() {
            self.advance(host)
        } else {
            self.finish(host, StopReason::StepFinished)
        }
    }

    fn runtime_notification(
        &mut self,
        host: &dyn EngineHost,
        kind: NotificationKind,
        argument: u64,
        mode: Option<ResumeMode>,
    ) -> StrandResult<()>
    {
        debug!(thread = %self.thread, ?kind, argument, "runtime notification");

        host.acquire_global_thread_lock(self.thread)?;
        let result = {
            let breakpoints = host.breakpoints();
            let memory = MaskedMemory::new(self.inferior.as_ref(), &breakpoints);
            host.symbols().handle_notification(kind, argument, &memory)
        };
        host.release_global_thread_lock(self.thread)?;

        if let Err(error) = result {
            warn!(thread = %self.thread, %error, "runtime notification failed");
            host.publish(DebuggerEvent::DebuggerError {
                sender: format!("thread {}", self.thread),
                message: format!("failed to handle runtime notification {kind:?}"),
                error: Some(std::sync::Arc::new(error)),
            });
        }

        match mode {
            Some(mode) => self.resume(host, mode),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------------
    // Operations
    // ---------------------------------------------------------------------

    /// Re-plan the current operation from a stopped thread.
    fn advance(&mut self, host: &dyn EngineHost) -> StrandResult<()>
    {
        if self.interrupt_requested {
            self.interrupt_requested = false;
            return self.finish(host, StopReason::Interrupted);
        }

        let Some(mut op) = self.operation.take() else {
            return self.finish(host, StopReason::StepFinished);
        };
        let plan = self.plan(host, &mut op);
        self.operation = Some(op);

        match plan? {
            Plan::Done(reason) => self.finish(host, reason),
            Plan::Step => self.resume(host, ResumeMode::Step),
            Plan::Continue => self.resume(host, ResumeMode::Continue),
            Plan::RunTo(address) => {
                self.set_temporary(host, address)?;
                self.resume(host, ResumeMode::Continue)
            }
        }
    }

    fn plan(&mut self, host: &dyn EngineHost, op: &mut ActiveOperation) -> StrandResult<Plan>
    {
        let pc = self.inferior.current_pc()?;
        op.iterations += 1;
        let limit = host.config().max_step_iterations;
        if limit != 0 && op.iterations > limit {
            warn!(thread = %self.thread, iterations = op.iterations, "giving up on stepping operation");
            return Ok(Plan::Done(StopReason::StepFinished));
        }

        let first = !op.started;
        op.started = true;

        let operation = match op.kind {
            OperationKind::Startup(target) => {
                return Ok(if !first || pc == target {
                    Plan::Done(StopReason::Entry)
                } else {
                    Plan::RunTo(target)
                });
            }
            OperationKind::User(operation) => operation,
        };

        match operation {
            Operation::StepInstruction => Ok(if first { Plan::Step } else { Plan::Done(StopReason::StepFinished) }),
            Operation::NextInstruction => {
                if !first {
                    return Ok(Plan::Done(StopReason::StepFinished));
                }
                Ok(match self.decode_call(host, pc)? {
                    Some(call) => Plan::RunTo(pc + call.instruction_size as u64),
                    None => Plan::Step,
                })
            }
            Operation::RunTo(address) => Ok(if !first || pc == address {
                Plan::Done(StopReason::StepFinished)
            } else {
                Plan::RunTo(address)
            }),
            Operation::Continue => Ok(Plan::Continue),
            Operation::StepOut => self.plan_step_out(host, op, first),
            Operation::StepInto | Operation::StepOver => {
                self.plan_line(host, op, pc, first, operation == Operation::StepOver)
            }
        }
    }

    fn plan_step_out(&mut self, host: &dyn EngineHost, op: &mut ActiveOperation, first: bool) -> StrandResult<Plan>
    {
        let frame = self.current_frame(host)?;

        if first {
            if self.at_return(host, frame.pc)? {
                // One step lands in the caller.
                op.frame_sp = None;
                op.return_address = None;
                return Ok(Plan::Step);
            }
            let Some(caller) = self.unwind_one(host, &frame)? else {
                debug!(thread = %self.thread, "cannot find caller to step out to");
                return Ok(Plan::Done(StopReason::StepFinished));
            };
            op.frame_sp = Some(frame.sp);
            op.return_address = Some(caller.pc);
            return Ok(Plan::RunTo(caller.pc));
        }

        // At the return address. A recursive call can reach it before the
        // frame we started in has returned.
        let returned = match op.frame_sp {
            Some(start) => frame.sp.try_cmp(start)?.is_gt(),
            None => true,
        };
        match (returned, op.return_address) {
            (false, Some(address)) => Ok(Plan::RunTo(address)),
            _ => Ok(Plan::Done(StopReason::StepFinished)),
        }
    }

    fn plan_line(
        &mut self,
        host: &dyn EngineHost,
        op: &mut ActiveOperation,
        pc: TargetAddress,
        first: bool,
        over: bool,
    ) -> StrandResult<Plan>
    {
        let symbols = host.symbols();

        if first {
            op.line = symbols.lookup_line(pc);
            if op.line.is_none() {
                // No line info: degrade to instruction stepping.
                op.kind = OperationKind::User(if over {
                    Operation::NextInstruction
                } else {
                    Operation::StepInstruction
                });
                op.started = false;
                return self.plan(host, op);
            }
            op.frame_sp = Some(self.current_frame(host)?.sp);
        } else {
            if let Some(return_address) = op.entered_call.take() {
                if symbols.lookup_line(pc).is_some() {
                    return Ok(Plan::Done(StopReason::StepFinished));
                }
                trace!(thread = %self.thread, %pc, "entered code without line info, stepping out");
                return Ok(Plan::RunTo(return_address));
            }

            let in_line = op.line.as_ref().is_some_and(|line| line.contains(pc));
            if !in_line {
                if symbols.lookup_line(pc).is_none() {
                    // Returned into a method without line info.
                    let frame = self.current_frame(host)?;
                    if let Some(caller) = self.unwind_one(host, &frame)? {
                        return Ok(Plan::RunTo(caller.pc));
                    }
                }
                return Ok(Plan::Done(StopReason::StepFinished));
            }
        }

        let Some(call) = self.decode_call(host, pc)? else {
            return Ok(Plan::Step);
        };
        let return_address = pc + call.instruction_size as u64;
        if over {
            return Ok(Plan::RunTo(return_address));
        }

        let Some(destination) = call.target else {
            // Destination unknown until the call executes; look where it lands.
            op.entered_call = Some(return_address);
            return Ok(Plan::Step);
        };
        let target = self.resolve_trampoline(host, destination)?;
        let target = self.look_through_stub(host, target)?;
        if symbols.lookup_line(target).is_none() {
            return Ok(Plan::RunTo(return_address));
        }
        if target == destination {
            op.entered_call = Some(return_address);
            Ok(Plan::Step)
        } else {
            Ok(Plan::RunTo(target))
        }
    }

    fn decode_call(&self, host: &dyn EngineHost, pc: TargetAddress) -> StrandResult<Option<crate::arch::CallTarget>>
    {
        let breakpoints = host.breakpoints();
        let memory = MaskedMemory::new(self.inferior.as_ref(), &breakpoints);
        host.architecture().call_target(&memory, pc)
    }

    fn at_return(&self, host: &dyn EngineHost, pc: TargetAddress) -> StrandResult<bool>
    {
        let breakpoints = host.breakpoints();
        let memory = MaskedMemory::new(self.inferior.as_ref(), &breakpoints);
        host.architecture().is_return_instruction(&memory, pc)
    }

    /// Calls into shared libraries land on a jump stub (a PLT entry); return
    /// the stub's destination instead.
    fn look_through_stub(&self, host: &dyn EngineHost, target: TargetAddress) -> StrandResult<TargetAddress>
    {
        if host.symbols().lookup_line(target).is_some() {
            return Ok(target);
        }
        let jump = {
            let breakpoints = host.breakpoints();
            let memory = MaskedMemory::new(self.inferior.as_ref(), &breakpoints);
            host.architecture().jump_target(&memory, target)
        };
        match jump {
            Ok(Some(jump)) => Ok(jump.target.unwrap_or(target)),
            Ok(None) => Ok(target),
            Err(error) => {
                trace!(thread = %self.thread, %target, %error, "cannot decode call destination");
                Ok(target)
            }
        }
    }

    fn resolve_trampoline(&self, host: &dyn EngineHost, target: TargetAddress) -> StrandResult<TargetAddress>
    {
        let symbols = host.symbols();
        let Some(trampoline) = symbols.trampoline_address() else {
            return Ok(target);
        };
        let info = {
            let breakpoints = host.breakpoints();
            let memory = MaskedMemory::new(self.inferior.as_ref(), &breakpoints);
            host.architecture().trampoline_target(&memory, target, trampoline)?
        };
        Ok(info
            .and_then(|info| symbols.resolve_trampoline_method(info))
            .unwrap_or(target))
    }

    fn set_temporary(&mut self, host: &dyn EngineHost, address: TargetAddress) -> StrandResult<()>
    {
        self.remove_temporary(host);
        let handle = host.breakpoints().insert(
            self.inferior.as_mut(),
            address,
            BreakpointScope::Thread(self.thread),
            BreakpointKind::Temporary,
        )?;
        if let Some(op) = self.operation.as_mut() {
            op.temporary = Some(handle);
        }
        Ok(())
    }

    fn remove_temporary(&mut self, host: &dyn EngineHost)
    {
        let Some(handle) = self.operation.as_mut().and_then(|op| op.temporary.take()) else {
            return;
        };
        self.remove_breakpoint_quietly(host, handle);
    }

    fn remove_breakpoint_quietly(&mut self, host: &dyn EngineHost, handle: BreakpointHandle)
    {
        if let Err(error) = host.breakpoints().remove(self.inferior.as_mut(), handle) {
            warn!(thread = %self.thread, %handle, %error, "failed to remove temporary breakpoint");
        }
    }

    fn drop_operation(&mut self, host: &dyn EngineHost)
    {
        self.remove_temporary(host);
        self.operation = None;
    }

    /// Stop reporting: the thread stays stopped until the next command.
    fn finish(&mut self, host: &dyn EngineHost, reason: StopReason) -> StrandResult<()>
    {
        if self.step_over.is_some() {
            self.end_step_over(host)?;
        }

        let op = self.operation.take();
        if let Some(handle) = op.as_ref().and_then(|op| op.temporary) {
            self.remove_breakpoint_quietly(host, handle);
        }

        let frame = self.current_frame(host).ok();
        let startup = op.as_ref().is_some_and(ActiveOperation::is_startup);
        debug!(thread = %self.thread, ?reason, pc = ?frame.as_ref().map(|f| f.pc), "stopped");

        if startup {
            let pc = match &frame {
                Some(frame) => frame.pc,
                None => self.inferior.current_pc()?,
            };
            return host.startup_checkpoint(self.thread, pc);
        }

        if op.is_some() {
            host.operation_finished(self.thread);
        }
        host.publish(DebuggerEvent::TargetEvent {
            thread: self.thread,
            event: TargetEvent::Stopped { reason, frame },
        });
        Ok(())
    }

    /// Ask a running thread to stop; the stop is reported as
    /// [`StopReason::Interrupted`].
    pub(crate) fn interrupt(&mut self) -> StrandResult<()>
    {
        if self.exited {
            return Ok(());
        }
        if self.running.is_some() {
            self.request_stop()?;
            self.interrupt_requested = true;
        } else if self.operation.is_some() {
            self.interrupt_requested = true;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    fn ensure_stopped(&self) -> StrandResult<()>
    {
        if self.exited || self.running.is_some() {
            Err(StrandError::NotStopped(self.thread))
        } else {
            Ok(())
        }
    }

    /// Execute an immediate command.
    ///
    /// ## Errors
    ///
    /// [`StrandError::NotStopped`] for inspection of a running thread, plus
    /// whatever the transport reports.
    pub(crate) fn execute(&mut self, host: &dyn EngineHost, query: Query) -> StrandResult<CommandValue>
    {
        match query {
            Query::State => Ok(CommandValue::State(self.state())),
            Query::Stop => {
                self.interrupt()?;
                Ok(CommandValue::None)
            }
            Query::Kill => {
                self.inferior.send_command(ServerCommand::Kill)?;
                Ok(CommandValue::None)
            }
            Query::Detach => {
                self.detach(host)?;
                Ok(CommandValue::None)
            }
            Query::AcquireThreadLock => {
                host.acquire_global_thread_lock(self.thread)?;
                Ok(CommandValue::None)
            }
            Query::ReleaseThreadLock => {
                host.release_global_thread_lock(self.thread)?;
                Ok(CommandValue::None)
            }
            Query::ListBreakpoints => Ok(CommandValue::Breakpoints(host.breakpoints().list())),
            Query::InsertBreakpoint { address, scope } => {
                let handle =
                    host.breakpoints()
                        .insert(self.inferior.as_mut(), address, scope, BreakpointKind::User)?;
                Ok(CommandValue::Breakpoint(handle))
            }
            Query::RemoveBreakpoint(handle) => {
                host.breakpoints().remove(self.inferior.as_mut(), handle)?;
                Ok(CommandValue::None)
            }
            Query::Frame => {
                self.ensure_stopped()?;
                Ok(CommandValue::Frame(self.current_frame(host)?))
            }
            Query::Backtrace { max_frames } => {
                self.ensure_stopped()?;
                Ok(CommandValue::Backtrace(self.backtrace(host, max_frames)?))
            }
            Query::Registers => {
                self.ensure_stopped()?;
                Ok(CommandValue::Registers(self.inferior.registers()?))
            }
            Query::ReadMemory { address, len } => {
                self.ensure_stopped()?;
                let breakpoints = host.breakpoints();
                let memory = MaskedMemory::new(self.inferior.as_ref(), &breakpoints);
                Ok(CommandValue::Memory(memory.read_memory(address, len)?))
            }
            Query::WriteMemory { address, data } => {
                self.ensure_stopped()?;
                host.breakpoints().write_through(self.inferior.as_mut(), address, &data)?;
                Ok(CommandValue::None)
            }
        }
    }

    fn detach(&mut self, host: &dyn EngineHost) -> StrandResult<()>
    {
        if self.is_main {
            host.breakpoints().clear(self.inferior.as_mut())?;
        }
        self.inferior.send_command(ServerCommand::Detach)?;
        self.exited = true;
        self.running = None;
        if self.operation.take().is_some() {
            host.operation_finished(self.thread);
        }
        info!(thread = %self.thread, "detached");
        Ok(())
    }

    /// Tear-down: kill or detach without reporting anything.
    pub(crate) fn shutdown(&mut self, detach: bool) -> StrandResult<()>
    {
        if self.exited {
            return Ok(());
        }
        let command = if detach { ServerCommand::Detach } else { ServerCommand::Kill };
        self.inferior.send_command(command)?;
        self.exited = true;
        Ok(())
    }

    pub(crate) fn current_frame(&self, host: &dyn EngineHost) -> StrandResult<StackFrame>
    {
        let registers = self.inferior.registers()?;
        let mut frame =
            host.architecture()
                .frame_from_registers(self.thread, registers, self.inferior.local_domain());
        annotate(host, &mut frame);
        Ok(frame)
    }

    fn unwind_one(&self, host: &dyn EngineHost, frame: &StackFrame) -> StrandResult<Option<StackFrame>>
    {
        let arch = host.architecture();
        let breakpoints = host.breakpoints();
        let memory = MaskedMemory::new(self.inferior.as_ref(), &breakpoints);

        if let Some(caller) = arch.try_special_unwind(frame, &memory)? {
            return Ok(Some(caller));
        }

        let Some(method) = host.symbols().lookup_method(frame.pc) else {
            return arch.unwind_stack(frame, &memory, None, 0);
        };
        let offset = usize::try_from(frame.pc.offset_from(method.start)?).unwrap_or(0);
        let size = usize::try_from(method.end.offset_from(method.start)?).unwrap_or(0);
        let code = memory.read_memory(method.start, size.min(arch.max_prologue_size())).ok();
        arch.unwind_stack(frame, &memory, code.as_deref(), offset)
    }

    /// Walk the stack from the innermost frame.
    pub(crate) fn backtrace(&self, host: &dyn EngineHost, max_frames: usize) -> StrandResult<Backtrace>
    {
        let mut frames = vec![self.current_frame(host)?];

        while frames.len() < max_frames {
            let Some(frame) = frames.last() else { break };
            let caller = match self.unwind_one(host, frame) {
                Ok(Some(caller)) => caller,
                Ok(None) => break,
                Err(error) => {
                    trace!(thread = %self.thread, %error, "backtrace ended");
                    break;
                }
            };
            let progressed = caller.sp.try_cmp(frame.sp).map(|o| o.is_gt()).unwrap_or(false);
            if caller.pc.is_null() || !progressed {
                break;
            }
            let mut caller = caller;
            annotate(host, &mut caller);
            frames.push(caller);
        }

        Ok(Backtrace { frames })
    }
}

fn annotate(host: &dyn EngineHost, frame: &mut StackFrame)
{
    let symbols = host.symbols();
    frame.symbol = symbols.lookup_symbol(frame.pc);
    frame.location = symbols.lookup_line(frame.pc).map(|line| line.location);
}
