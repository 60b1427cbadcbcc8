//! ptrace connection to one native thread.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex};

use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::trace;

use super::wait::StatusTranslator;
use crate::arch::x86_64::X86_64Register;
use crate::error::{StrandError, StrandResult};
use crate::inferior::{InferiorConnection, ServerCommand, ServerReply, TargetMemoryAccess};
use crate::manager::lock;
use crate::types::{AddressDomain, ProcessId, Registers, TargetAddress, ThreadId};

/// `AT_ENTRY` in the auxiliary vector.
const AT_ENTRY: u64 = 9;

pub struct PtraceInferior
{
    process: Pid,
    thread: Pid,
    memory: File,
    signal: Option<Signal>,
    translator: Arc<Mutex<StatusTranslator>>,
}

impl PtraceInferior
{
    pub(crate) fn new(process: Pid, thread: Pid, translator: Arc<Mutex<StatusTranslator>>) -> StrandResult<Self>
    {
        let memory = File::options()
            .read(true)
            .write(true)
            .open(format!("/proc/{process}/mem"))?;
        lock(&translator).track(raw_tid(thread));
        Ok(Self {
            process,
            thread,
            memory,
            signal: None,
            translator,
        })
    }

    fn user_regs(&self) -> StrandResult<libc::user_regs_struct>
    {
        ptrace::getregs(self.thread).map_err(|errno| match errno {
            nix::errno::Errno::ESRCH => StrandError::NotStopped(self.thread_id()),
            other => StrandError::Nix(other),
        })
    }
}

fn raw_tid(pid: Pid) -> u64
{
    u64::try_from(pid.as_raw()).unwrap_or_default()
}

/// Register values in [`X86_64Register`] order.
fn register_values(regs: &libc::user_regs_struct) -> [u64; X86_64Register::COUNT]
{
    [
        regs.r15,
        regs.r14,
        regs.r13,
        regs.r12,
        regs.rbp,
        regs.rbx,
        regs.r11,
        regs.r10,
        regs.r9,
        regs.r8,
        regs.rax,
        regs.rcx,
        regs.rdx,
        regs.rsi,
        regs.rdi,
        regs.orig_rax,
        regs.rip,
        regs.cs,
        regs.eflags,
        regs.rsp,
        regs.ss,
        regs.fs_base,
        regs.gs_base,
        regs.ds,
        regs.es,
        regs.fs,
        regs.gs,
    ]
}

impl TargetMemoryAccess for PtraceInferior
{
    fn read_memory(&self, address: TargetAddress, len: usize) -> StrandResult<Vec<u8>>
    {
        let mut buffer = vec![0; len];
        self.memory
            .read_exact_at(&mut buffer, address.value())
            .map_err(|error| StrandError::memory(address.value(), error.to_string()))?;
        Ok(buffer)
    }

    fn write_memory(&mut self, address: TargetAddress, data: &[u8]) -> StrandResult<()>
    {
        self.memory
            .write_all_at(data, address.value())
            .map_err(|error| StrandError::memory(address.value(), error.to_string()))
    }

    fn registers(&self) -> StrandResult<Registers>
    {
        Ok(Registers::from_values(&register_values(&self.user_regs()?)))
    }

    fn local_domain(&self) -> AddressDomain
    {
        AddressDomain::ThreadLocal(self.thread_id())
    }
}

impl InferiorConnection for PtraceInferior
{
    fn thread_id(&self) -> ThreadId
    {
        ThreadId(raw_tid(self.thread))
    }

    fn process_id(&self) -> ProcessId
    {
        ProcessId(u32::try_from(self.process.as_raw()).unwrap_or_default())
    }

    fn send_command(&mut self, command: ServerCommand) -> StrandResult<ServerReply>
    {
        trace!(thread = %self.thread, ?command, "ptrace command");
        match command {
            ServerCommand::GetPc => Ok(ServerReply::Pc(self.user_regs()?.rip)),
            ServerCommand::Continue => {
                ptrace::cont(self.thread, self.signal.take())?;
                Ok(ServerReply::Done)
            }
            ServerCommand::Step => {
                ptrace::step(self.thread, self.signal.take())?;
                Ok(ServerReply::Done)
            }
            ServerCommand::Detach => {
                ptrace::detach(self.thread, self.signal.take())?;
                lock(&self.translator).forget(raw_tid(self.thread));
                Ok(ServerReply::Done)
            }
            ServerCommand::Shutdown => {
                // The thread may already be gone.
                let _ = ptrace::detach(self.thread, None);
                lock(&self.translator).forget(raw_tid(self.thread));
                Ok(ServerReply::Done)
            }
            ServerCommand::Kill => {
                signal::kill(self.process, Signal::SIGKILL)?;
                Ok(ServerReply::Done)
            }
        }
    }

    fn set_pc(&mut self, pc: TargetAddress) -> StrandResult<()>
    {
        let mut regs = self.user_regs()?;
        regs.rip = pc.value();
        ptrace::setregs(self.thread, regs)?;
        Ok(())
    }

    fn set_signal(&mut self, signal: Option<i32>) -> StrandResult<()>
    {
        self.signal = match signal {
            Some(raw) => Some(Signal::try_from(raw)?),
            None => None,
        };
        Ok(())
    }

    fn stop(&mut self) -> StrandResult<()>
    {
        // SAFETY: tgkill takes plain integers and has no memory effects.
        let result = unsafe {
            libc::syscall(
                libc::SYS_tgkill,
                self.process.as_raw(),
                self.thread.as_raw(),
                libc::SIGSTOP,
            )
        };
        if result == -1 {
            return Err(StrandError::Nix(nix::errno::Errno::last()));
        }
        Ok(())
    }

    fn create_thread(&self, thread: ThreadId) -> StrandResult<Box<dyn InferiorConnection>>
    {
        let raw = i32::try_from(thread.raw())
            .map_err(|_| StrandError::InvalidArgument(format!("thread id {thread} out of range")))?;
        Ok(Box::new(PtraceInferior::new(
            self.process,
            Pid::from_raw(raw),
            Arc::clone(&self.translator),
        )?))
    }

    fn entry_address(&self) -> StrandResult<Option<TargetAddress>>
    {
        let auxv = std::fs::read(format!("/proc/{}/auxv", self.process))?;
        let entry = auxv
            .chunks_exact(16)
            .map(|pair| {
                let (key, value) = pair.split_at(8);
                (
                    u64::from_ne_bytes(key.try_into().unwrap_or_default()),
                    u64::from_ne_bytes(value.try_into().unwrap_or_default()),
                )
            })
            .find(|(key, _)| *key == AT_ENTRY)
            .map(|(_, value)| TargetAddress::global(value));
        Ok(entry)
    }
}
