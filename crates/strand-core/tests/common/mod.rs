//! In-process target used by the session integration tests
//!
//! The simulator interprets a handful of x86-64 opcodes over a flat 64 KiB
//! memory, which is enough to exercise breakpoints, stepping, unwinding and
//! thread creation without a real tracee:
//!
//! | bytes       | effect                                              |
//! |-------------|-----------------------------------------------------|
//! | `90`        | nop                                                 |
//! | `cc`        | trap, reported as SIGTRAP with pc past the `cc`     |
//! | `e8 rel32`  | call                                                |
//! | `c3`        | ret                                                 |
//! | `55`        | push %rbp                                           |
//! | `48 89 e5`  | mov %rsp,%rbp                                       |
//! | `5d`        | pop %rbp                                            |
//! | `eb rel8`   | jmp                                                 |
//! | `ff 25 d32` | jmp *d32(%rip)                                      |
//! | `f4`        | exit the executing thread with code `%rax`          |
//! | `0f 0b`     | start a thread at [`Program::thread_entry`]         |
//! | `0f 05`     | raise a runtime notification, argument is the pc    |
//!
//! Anything else stops the thread with SIGILL.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::io::Cursor;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use strand_core::config::SpawnSpec;
use strand_core::inferior::{NotificationKind, ServerCommand, ServerReply, SpawnedInferior};
use strand_core::types::{AddressDomain, MethodInfo, Registers, SourceLine, SourceLocation, Symbol};
use strand_core::{
    ChildEvent, DebuggerEvent, InferiorConnection, InferiorTransport, ProcessId, StackFrame, StopReason, StrandError,
    StrandResult, SymbolProvider, TargetAddress, TargetEvent, TargetMemoryAccess, ThreadId, WaitEvent, WaitOutcome,
};

pub const SIGILL: i32 = libc::SIGILL;
pub const SIGTRAP: i32 = libc::SIGTRAP;
pub const SIGKILL: i32 = libc::SIGKILL;
pub const SIGSTOP: i32 = libc::SIGSTOP;

pub const PID: u32 = 100;
pub const MAIN_THREAD: ThreadId = ThreadId(100);

pub const ENTRY: u64 = 0x0f00;
pub const MAIN: u64 = 0x1000;
pub const HELPER: u64 = 0x1100;
pub const WORKER: u64 = 0x1300;

/// Function called by both threads of [`Program::contended`].
pub const SHARED: u64 = 0x1200;
/// Jump stub of [`Program::through_stub`] and its pointer slot.
pub const STUB: u64 = 0x1400;
pub const STUB_SLOT: u64 = 0x1500;

/// `main`'s call to `helper` and the instruction after it.
pub const CALL_SITE: u64 = 0x1005;
pub const AFTER_CALL: u64 = 0x100a;

const MEMORY_SIZE: usize = 0x1_0000;
const MAIN_STACK: u64 = 0x9000;
const THREAD_STACK: u64 = 0xc000;
const STACK_STRIDE: u64 = 0x1000;
/// Instructions a `Continue` may execute before the thread counts as spinning.
const RUN_BUDGET: usize = 10_000;

const RAX: usize = 10;
const RBP: usize = 4;
const RIP: usize = 16;
const RSP: usize = 19;
const REGISTER_COUNT: usize = 27;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Code and data loaded into the simulator.
#[derive(Debug, Clone)]
pub struct Program
{
    pub entry: u64,
    pub thread_entry: u64,
    pub segments: Vec<(u64, Vec<u8>)>,
    pub stdout: Vec<u8>,
}

impl Program
{
    /// `_start` calls `main`, `main` calls `helper` and returns to `_start`,
    /// which exits.
    ///
    /// ```text
    /// 0f00 _start: call main; hlt
    /// 1000 main:   push %rbp; mov %rsp,%rbp; nop; call helper; nop; pop %rbp; ret
    /// 1100 helper: nop; nop; ret
    /// ```
    pub fn standard() -> Self
    {
        Self {
            entry: ENTRY,
            thread_entry: WORKER,
            segments: vec![
                (ENTRY, vec![0xe8, 0xfb, 0x00, 0x00, 0x00, 0xf4]),
                (
                    MAIN,
                    vec![0x55, 0x48, 0x89, 0xe5, 0x90, 0xe8, 0xf6, 0x00, 0x00, 0x00, 0x90, 0x5d, 0xc3],
                ),
                (HELPER, vec![0x90, 0x90, 0xc3]),
            ],
            stdout: Vec::new(),
        }
    }

    /// `_start` spawns a worker and calls `shared`; the worker calls
    /// `shared` in a loop.
    ///
    /// ```text
    /// 0f00 _start: spawn; call shared; hlt
    /// 1200 shared: nop; nop; ret
    /// 1300 worker: call shared; jmp worker
    /// ```
    pub fn contended() -> Self
    {
        Self {
            entry: ENTRY,
            thread_entry: WORKER,
            segments: vec![
                (ENTRY, vec![0x0f, 0x0b, 0xe8, 0xf9, 0x02, 0x00, 0x00, 0xf4]),
                (SHARED, vec![0x90, 0x90, 0xc3]),
                (WORKER, vec![0xe8, 0xfb, 0xfe, 0xff, 0xff, 0xeb, 0xf9]),
            ],
            stdout: Vec::new(),
        }
    }

    /// `_start` calls `helper` through a jump stub, the way calls into a
    /// shared library go through the PLT.
    ///
    /// ```text
    /// 0f00 _start: call stub; hlt
    /// 1100 helper: nop; nop; ret
    /// 1400 stub:   jmp *slot(%rip)
    /// 1500 slot:   .quad helper
    /// ```
    pub fn through_stub() -> Self
    {
        Self {
            entry: ENTRY,
            thread_entry: WORKER,
            segments: vec![
                (ENTRY, vec![0xe8, 0xfb, 0x04, 0x00, 0x00, 0xf4]),
                (HELPER, vec![0x90, 0x90, 0xc3]),
                (STUB, vec![0xff, 0x25, 0xfa, 0x00, 0x00, 0x00]),
                (STUB_SLOT, HELPER.to_le_bytes().to_vec()),
            ],
            stdout: Vec::new(),
        }
    }

    /// A program that only runs `code` at the entry point.
    pub fn with_entry_code(code: &[u8]) -> Self
    {
        Self {
            entry: ENTRY,
            thread_entry: WORKER,
            segments: vec![(ENTRY, code.to_vec())],
            stdout: Vec::new(),
        }
    }

    pub fn segment(mut self, address: u64, code: &[u8]) -> Self
    {
        self.segments.push((address, code.to_vec()));
        self
    }

    pub fn stdout(mut self, text: &str) -> Self
    {
        self.stdout = text.as_bytes().to_vec();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState
{
    Stopped,
    Running,
    Gone,
}

#[derive(Debug)]
struct SimThread
{
    registers: [u64; REGISTER_COUNT],
    state: RunState,
    /// A stop was requested while the thread was already stopped.
    stop_pending: bool,
}

impl SimThread
{
    fn new(pc: u64, sp: u64) -> Self
    {
        let mut registers = [0; REGISTER_COUNT];
        registers[RIP] = pc;
        registers[RSP] = sp;
        Self {
            registers,
            state: RunState::Stopped,
            stop_pending: false,
        }
    }
}

/// What one instruction did.
enum Effect
{
    Next,
    Event(ChildEvent),
}

#[derive(Debug, Default)]
struct Machine
{
    memory: Vec<u8>,
    threads: BTreeMap<ThreadId, SimThread>,
    events: VecDeque<WaitEvent>,
    woken: bool,
    writes: Vec<(u64, Vec<u8>)>,
    steps: usize,
    next_thread: u64,
    thread_entry: u64,
    entry: u64,
}

impl Machine
{
    fn thread(&mut self, thread: ThreadId) -> StrandResult<&mut SimThread>
    {
        self.threads.get_mut(&thread).ok_or(StrandError::UnknownThread(thread))
    }

    fn stopped(&mut self, thread: ThreadId) -> StrandResult<&mut SimThread>
    {
        let sim = self.thread(thread)?;
        if sim.state == RunState::Stopped {
            Ok(sim)
        } else {
            Err(StrandError::NotStopped(thread))
        }
    }

    fn range(&self, address: u64, len: usize) -> StrandResult<std::ops::Range<usize>>
    {
        let start = usize::try_from(address).map_err(|_| StrandError::memory(address, "out of range"))?;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.memory.len())
            .ok_or_else(|| StrandError::memory(address, "out of range"))?;
        Ok(start..end)
    }

    fn read(&self, address: u64, len: usize) -> StrandResult<Vec<u8>>
    {
        let range = self.range(address, len)?;
        Ok(self.memory[range].to_vec())
    }

    fn byte(&self, address: u64) -> StrandResult<u8>
    {
        Ok(self.read(address, 1)?[0])
    }

    fn word(&self, address: u64) -> StrandResult<u64>
    {
        let bytes = self.read(address, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn put_word(&mut self, address: u64, value: u64) -> StrandResult<()>
    {
        let range = self.range(address, 8)?;
        self.memory[range].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn push(&mut self, thread: ThreadId, value: u64) -> StrandResult<()>
    {
        let sp = self.thread(thread)?.registers[RSP] - 8;
        self.put_word(sp, value)?;
        self.thread(thread)?.registers[RSP] = sp;
        Ok(())
    }

    fn pop(&mut self, thread: ThreadId) -> StrandResult<u64>
    {
        let sp = self.thread(thread)?.registers[RSP];
        let value = self.word(sp)?;
        self.thread(thread)?.registers[RSP] = sp + 8;
        Ok(value)
    }

    fn execute(&mut self, thread: ThreadId) -> StrandResult<Effect>
    {
        let pc = self.thread(thread)?.registers[RIP];
        let opcode = self.byte(pc)?;

        let mut next_pc = pc + 1;
        let effect = match opcode {
            0x90 => Effect::Next,
            0xcc => Effect::Event(ChildEvent::Stopped { signal: SIGTRAP }),
            0xe8 => {
                let raw = self.read(pc + 1, 4)?;
                let disp = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                self.push(thread, pc + 5)?;
                next_pc = (pc + 5).wrapping_add_signed(i64::from(disp));
                Effect::Next
            }
            0xc3 => {
                next_pc = self.pop(thread)?;
                Effect::Next
            }
            0x55 => {
                let rbp = self.thread(thread)?.registers[RBP];
                self.push(thread, rbp)?;
                Effect::Next
            }
            0x48 if self.read(pc + 1, 2)? == [0x89, 0xe5] => {
                let sim = self.thread(thread)?;
                sim.registers[RBP] = sim.registers[RSP];
                next_pc = pc + 3;
                Effect::Next
            }
            0x5d => {
                let rbp = self.pop(thread)?;
                self.thread(thread)?.registers[RBP] = rbp;
                Effect::Next
            }
            0xeb => {
                let disp = self.byte(pc + 1)? as i8;
                next_pc = (pc + 2).wrapping_add_signed(i64::from(disp));
                Effect::Next
            }
            0xff if self.byte(pc + 1)? == 0x25 => {
                let raw = self.read(pc + 2, 4)?;
                let disp = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                next_pc = self.word((pc + 6).wrapping_add_signed(i64::from(disp)))?;
                Effect::Next
            }
            0xf4 => {
                let code = self.thread(thread)?.registers[RAX] as i32;
                Effect::Event(ChildEvent::Exited { code })
            }
            0x0f if self.byte(pc + 1)? == 0x0b => {
                next_pc = pc + 2;
                let child = ThreadId(self.next_thread);
                self.next_thread += 1;
                let stack = THREAD_STACK + STACK_STRIDE * (child.raw() - u64::from(PID));
                self.threads.insert(child, SimThread::new(self.thread_entry, stack));
                Effect::Event(ChildEvent::CreatedThread { thread: child })
            }
            0x0f if self.byte(pc + 1)? == 0x05 => {
                next_pc = pc + 2;
                Effect::Event(ChildEvent::Notification {
                    kind: NotificationKind::RuntimeInitialized,
                    argument: pc,
                })
            }
            _ => {
                next_pc = pc;
                Effect::Event(ChildEvent::Stopped { signal: SIGILL })
            }
        };

        self.thread(thread)?.registers[RIP] = next_pc;
        Ok(effect)
    }

    fn report(&mut self, thread: ThreadId, event: ChildEvent) -> StrandResult<()>
    {
        let sim = self.thread(thread)?;
        sim.state = if event.is_exit() { RunState::Gone } else { RunState::Stopped };
        self.events.push_back(WaitEvent { thread, event });
        Ok(())
    }

    fn resume(&mut self, thread: ThreadId, step: bool) -> StrandResult<()>
    {
        let sim = self.stopped(thread)?;
        sim.state = RunState::Running;
        if std::mem::take(&mut sim.stop_pending) {
            return self.report(thread, ChildEvent::Stopped { signal: SIGSTOP });
        }

        if step {
            self.steps += 1;
            return match self.execute(thread)? {
                Effect::Next => self.report(thread, ChildEvent::Stopped { signal: SIGTRAP }),
                Effect::Event(event) => self.report(thread, event),
            };
        }

        for _ in 0..RUN_BUDGET {
            if let Effect::Event(event) = self.execute(thread)? {
                return self.report(thread, event);
            }
        }
        // Spinning; only a stop request ends this.
        Ok(())
    }

    fn kill(&mut self)
    {
        let mut victims: Vec<ThreadId> = self
            .threads
            .iter()
            .filter(|(_, sim)| sim.state != RunState::Gone)
            .map(|(thread, _)| *thread)
            .collect();
        // The main thread last, so its exit ends the session.
        victims.sort_by_key(|thread| *thread == MAIN_THREAD);
        for thread in victims {
            let _ = self.report(thread, ChildEvent::Signaled { signal: SIGKILL });
        }
    }
}

/// The simulated target and its transport.
#[derive(Debug)]
pub struct Simulator
{
    machine: Mutex<Machine>,
    changed: Condvar,
    program: Program,
    me: Weak<Simulator>,
}

impl Simulator
{
    pub fn new(program: Program) -> Arc<Self>
    {
        let mut memory = vec![0u8; MEMORY_SIZE];
        for (address, code) in &program.segments {
            let start = *address as usize;
            memory[start..start + code.len()].copy_from_slice(code);
        }
        Arc::new_cyclic(|me| Self {
            machine: Mutex::new(Machine {
                memory,
                next_thread: u64::from(PID) + 1,
                thread_entry: program.thread_entry,
                entry: program.entry,
                ..Machine::default()
            }),
            changed: Condvar::new(),
            program,
            me: me.clone(),
        })
    }

    fn machine(&self) -> MutexGuard<'_, Machine>
    {
        self.machine.lock().unwrap()
    }

    fn start(&self) -> StrandResult<SpawnedInferior>
    {
        {
            let mut machine = self.machine();
            if machine.threads.contains_key(&MAIN_THREAD) {
                return Err(StrandError::Transport("target already running".to_string()));
            }
            let entry = machine.entry;
            machine.threads.insert(MAIN_THREAD, SimThread::new(entry, MAIN_STACK));
            machine.events.push_back(WaitEvent {
                thread: MAIN_THREAD,
                event: ChildEvent::Stopped { signal: 0 },
            });
        }
        self.changed.notify_all();

        let stdout: Option<Box<dyn std::io::Read + Send>> = if self.program.stdout.is_empty() {
            None
        } else {
            Some(Box::new(Cursor::new(self.program.stdout.clone())))
        };
        Ok(SpawnedInferior {
            inferior: self.connection(MAIN_THREAD),
            stdout,
            stderr: None,
        })
    }

    fn connection(&self, thread: ThreadId) -> Box<dyn InferiorConnection>
    {
        Box::new(SimConnection {
            simulator: self.me.upgrade().expect("simulator alive"),
            thread,
        })
    }

    fn update<R>(&self, f: impl FnOnce(&mut Machine) -> StrandResult<R>) -> StrandResult<R>
    {
        let result = f(&mut self.machine());
        self.changed.notify_all();
        result
    }

    /// Raw memory, with inserted breakpoints visible.
    pub fn memory(&self, address: u64, len: usize) -> Vec<u8>
    {
        self.machine().read(address, len).unwrap()
    }

    /// Memory writes since the last call.
    pub fn take_writes(&self) -> Vec<(u64, Vec<u8>)>
    {
        std::mem::take(&mut self.machine().writes)
    }

    /// Single steps executed so far.
    pub fn steps(&self) -> usize
    {
        self.machine().steps
    }

    pub fn live_threads(&self) -> usize
    {
        self.machine()
            .threads
            .values()
            .filter(|sim| sim.state != RunState::Gone)
            .count()
    }
}

impl InferiorTransport for Simulator
{
    fn spawn(&self, _spec: &SpawnSpec) -> StrandResult<SpawnedInferior>
    {
        self.start()
    }

    fn attach(&self, pid: ProcessId) -> StrandResult<SpawnedInferior>
    {
        if pid != ProcessId(PID) {
            return Err(StrandError::Transport(format!("no process {pid}")));
        }
        self.start()
    }

    fn global_wait(&self) -> StrandResult<WaitOutcome>
    {
        let mut machine = self.machine();
        loop {
            if std::mem::take(&mut machine.woken) {
                return Ok(WaitOutcome::Woken);
            }
            if let Some(event) = machine.events.pop_front() {
                return Ok(WaitOutcome::Event(event));
            }
            machine = self.changed.wait(machine).unwrap();
        }
    }

    fn wake(&self)
    {
        self.machine().woken = true;
        self.changed.notify_all();
    }
}

/// Connection to one simulated thread.
struct SimConnection
{
    simulator: Arc<Simulator>,
    thread: ThreadId,
}

impl TargetMemoryAccess for SimConnection
{
    fn read_memory(&self, address: TargetAddress, len: usize) -> StrandResult<Vec<u8>>
    {
        self.simulator.machine().read(address.value(), len)
    }

    fn write_memory(&mut self, address: TargetAddress, data: &[u8]) -> StrandResult<()>
    {
        self.simulator.update(|machine| {
            let range = machine.range(address.value(), data.len())?;
            machine.memory[range].copy_from_slice(data);
            machine.writes.push((address.value(), data.to_vec()));
            Ok(())
        })
    }

    fn registers(&self) -> StrandResult<Registers>
    {
        let mut machine = self.simulator.machine();
        let sim = machine.stopped(self.thread)?;
        Ok(Registers::from_values(&sim.registers))
    }

    fn local_domain(&self) -> AddressDomain
    {
        AddressDomain::ThreadLocal(self.thread)
    }
}

impl InferiorConnection for SimConnection
{
    fn thread_id(&self) -> ThreadId
    {
        self.thread
    }

    fn process_id(&self) -> ProcessId
    {
        ProcessId(PID)
    }

    fn send_command(&mut self, command: ServerCommand) -> StrandResult<ServerReply>
    {
        let thread = self.thread;
        self.simulator.update(|machine| match command {
            ServerCommand::GetPc => Ok(ServerReply::Pc(machine.stopped(thread)?.registers[RIP])),
            ServerCommand::Continue => machine.resume(thread, false).map(|()| ServerReply::Done),
            ServerCommand::Step => machine.resume(thread, true).map(|()| ServerReply::Done),
            ServerCommand::Detach | ServerCommand::Shutdown => {
                machine.thread(thread)?.state = RunState::Gone;
                Ok(ServerReply::Done)
            }
            ServerCommand::Kill => {
                machine.kill();
                Ok(ServerReply::Done)
            }
        })
    }

    fn set_pc(&mut self, pc: TargetAddress) -> StrandResult<()>
    {
        let thread = self.thread;
        self.simulator.update(|machine| {
            machine.stopped(thread)?.registers[RIP] = pc.value();
            Ok(())
        })
    }

    fn set_signal(&mut self, _signal: Option<i32>) -> StrandResult<()>
    {
        Ok(())
    }

    fn stop(&mut self) -> StrandResult<()>
    {
        let thread = self.thread;
        self.simulator.update(|machine| {
            let sim = machine.thread(thread)?;
            match sim.state {
                RunState::Running => machine.report(thread, ChildEvent::Stopped { signal: SIGSTOP }),
                RunState::Stopped => {
                    sim.stop_pending = true;
                    Ok(())
                }
                RunState::Gone => Ok(()),
            }
        })
    }

    fn create_thread(&self, thread: ThreadId) -> StrandResult<Box<dyn InferiorConnection>>
    {
        if !self.simulator.machine().threads.contains_key(&thread) {
            return Err(StrandError::UnknownThread(thread));
        }
        Ok(self.simulator.connection(thread))
    }

    fn entry_address(&self) -> StrandResult<Option<TargetAddress>>
    {
        Ok(Some(TargetAddress::global(self.simulator.machine().entry)))
    }
}

/// Symbols and line table of [`Program::standard`].
#[derive(Debug, Default)]
pub struct TestSymbols
{
    pub main: Option<u64>,
    pub lines: Vec<SourceLine>,
    pub methods: Vec<MethodInfo>,
    pub symbols: Vec<Symbol>,
    pub notifications: Mutex<Vec<(NotificationKind, u64)>>,
}

fn line(number: u32, start: u64, end: u64) -> SourceLine
{
    SourceLine {
        location: SourceLocation {
            file: "demo.c".to_string(),
            line: number,
        },
        start: TargetAddress::global(start),
        end: TargetAddress::global(end),
    }
}

fn method(name: &str, start: u64, end: u64) -> MethodInfo
{
    MethodInfo {
        name: name.to_string(),
        start: TargetAddress::global(start),
        end: TargetAddress::global(end),
        has_source: true,
    }
}

impl TestSymbols
{
    pub fn standard() -> Self
    {
        Self {
            main: Some(MAIN),
            lines: vec![
                line(10, 0x1000, 0x1004),
                line(11, 0x1004, 0x1005),
                line(12, 0x1005, 0x100a),
                line(13, 0x100a, 0x100d),
                line(20, 0x1100, 0x1103),
            ],
            methods: vec![method("main", 0x1000, 0x100d), method("helper", 0x1100, 0x1103)],
            symbols: vec![
                Symbol::new("_start", TargetAddress::global(ENTRY)),
                Symbol::new("main", TargetAddress::global(MAIN)),
                Symbol::new("helper", TargetAddress::global(HELPER)),
            ],
            notifications: Mutex::new(Vec::new()),
        }
    }

    /// Symbols without a main method or line table.
    pub fn bare() -> Self
    {
        Self::default()
    }

    pub fn with_line(mut self, number: u32, start: u64, end: u64) -> Self
    {
        self.lines.push(line(number, start, end));
        self
    }
}

impl SymbolProvider for TestSymbols
{
    fn lookup_symbol(&self, address: TargetAddress) -> Option<Symbol>
    {
        self.symbols
            .iter()
            .filter(|symbol| symbol.address.value() <= address.value())
            .max_by_key(|symbol| symbol.address.value())
            .cloned()
    }

    fn lookup_line(&self, address: TargetAddress) -> Option<SourceLine>
    {
        self.lines.iter().find(|line| line.contains(address)).cloned()
    }

    fn lookup_method(&self, address: TargetAddress) -> Option<MethodInfo>
    {
        self.methods.iter().find(|method| method.contains(address)).cloned()
    }

    fn main_method(&self, _memory: &dyn TargetMemoryAccess) -> StrandResult<Option<TargetAddress>>
    {
        Ok(self.main.map(TargetAddress::global))
    }

    fn handle_notification(
        &self,
        kind: NotificationKind,
        argument: u64,
        _memory: &dyn TargetMemoryAccess,
    ) -> StrandResult<()>
    {
        self.notifications.lock().unwrap().push((kind, argument));
        Ok(())
    }
}

/// A reported stop.
#[derive(Debug)]
pub struct Stop
{
    pub thread: ThreadId,
    pub reason: StopReason,
    pub frame: Option<StackFrame>,
}

impl Stop
{
    pub fn pc(&self) -> u64
    {
        self.frame.as_ref().map(|frame| frame.pc.value()).expect("stop without a frame")
    }
}

/// Next event matching `pick`, skipping everything else.
pub fn wait_for<T>(events: &Receiver<DebuggerEvent>, mut pick: impl FnMut(&DebuggerEvent) -> Option<T>) -> T
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        let event = events.recv_timeout(left).expect("timed out waiting for an event");
        if let Some(value) = pick(&event) {
            return value;
        }
    }
}

pub fn wait_for_stop(events: &Receiver<DebuggerEvent>) -> Stop
{
    wait_for(events, |event| match event {
        DebuggerEvent::TargetEvent {
            thread,
            event: TargetEvent::Stopped { reason, frame },
        } => Some(Stop {
            thread: *thread,
            reason: *reason,
            frame: frame.clone(),
        }),
        _ => None,
    })
}

pub fn wait_for_target_exit(events: &Receiver<DebuggerEvent>)
{
    wait_for(events, |event| matches!(event, DebuggerEvent::TargetExited).then_some(()));
}
