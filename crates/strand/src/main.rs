mod commands;

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::process;
use std::sync::mpsc::TryRecvError;
use std::sync::{Arc, Weak};

use clap::{Parser, Subcommand};
use commands::{Help, ReplCommand};
use strand_core::breakpoints::BreakpointHandle;
use strand_core::{
    Architecture, DebuggerEvent, DebuggerEventReceiver, LaunchTarget, NoSymbols, ProcessHandle, ProcessId,
    SessionConfig, SpawnSpec, StrandError, TargetEvent, ThreadManager, X86_64Architecture,
};
use strand_utils::{info, init_logging_with, warn, LogFormat, LogLevel, LoggingConfig};

/// A debugger for multi-threaded native processes.
#[derive(Parser, Debug)]
#[command(name = "strand")]
#[command(version)]
#[command(about = "A debugger for multi-threaded native processes", long_about = None)]
struct Cli
{
    #[command(subcommand)]
    command: Commands,

    /// Log level (overrides RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    /// Log format: pretty or json (overrides STRAND_LOG_FORMAT)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Stop at the initial stop instead of running to the program's main
    #[arg(long, global = true, default_value_t = false)]
    no_stop_at_main: bool,

    /// Debugger command to run after startup; may be repeated
    #[arg(long = "step", value_name = "COMMAND", global = true)]
    steps: Vec<String>,

    /// Exit after the --step commands instead of prompting
    #[arg(long, global = true, default_value_t = false)]
    batch: bool,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Launch a new process under debugger control
    Launch
    {
        /// Path to the executable to launch
        program: String,
        /// Arguments to pass to the program
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Attach to a running process by PID
    Attach
    {
        /// Process ID (PID) to attach to
        pid: u32,
    },
}

fn main()
{
    let cli = Cli::parse();

    let mut logging = match LoggingConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };
    if let Some(level) = cli.log_level {
        logging = logging.with_level(level);
    }
    if let Some(format) = cli.log_format {
        logging = logging.with_format(format);
    }
    // Keeps the file sink flushing until main returns.
    let _guard = match init_logging_with(&logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

#[cfg(target_os = "linux")]
fn transport() -> Result<Arc<dyn strand_core::InferiorTransport>, Box<dyn std::error::Error>>
{
    Ok(Arc::new(strand_core::PtraceTransport::new()))
}

#[cfg(not(target_os = "linux"))]
fn transport() -> Result<Arc<dyn strand_core::InferiorTransport>, Box<dyn std::error::Error>>
{
    Err("strand only ships a native transport for Linux".into())
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>>
{
    let config = SessionConfig::default().with_stop_at_main(!cli.no_stop_at_main);
    let manager = Arc::new(ThreadManager::new(
        transport()?,
        Arc::new(X86_64Architecture::new()),
        Arc::new(NoSymbols),
        config,
    ));
    let events = manager.subscribe();

    let target = match cli.command {
        Commands::Launch { program, args } => {
            info!("Launching program: {} with args: {:?}", program, args);
            // Paths relative to the current directory are made absolute,
            // bare names are left for PATH lookup.
            let program_path = Path::new(&program);
            let program = if program_path.exists() {
                program_path.canonicalize()?.to_string_lossy().into_owned()
            } else {
                program
            };
            LaunchTarget::Spawn(SpawnSpec::new(program).args(args))
        }
        Commands::Attach { pid } => {
            info!("Attaching to process {}", pid);
            LaunchTarget::Attach(ProcessId(pid))
        }
    };

    let main = manager.start_session(target)?;
    println!("Target started, main thread {}", main.thread_id());

    let weak: Weak<ThreadManager> = Arc::downgrade(&manager);
    ctrlc::set_handler(move || {
        if let Some(manager) = weak.upgrade() {
            manager.interrupt();
        }
    })?;

    let mut repl = Repl {
        manager: Arc::clone(&manager),
        events,
        selected: main,
    };

    let mut quit = false;
    for line in &cli.steps {
        println!("(strand) {line}");
        if repl.run_line(line) == Flow::Quit {
            quit = true;
            break;
        }
    }

    if !quit && !cli.batch {
        repl.interactive()?;
    }

    manager.dispose();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow
{
    Continue,
    Quit,
}

struct Repl
{
    manager: Arc<ThreadManager>,
    events: DebuggerEventReceiver,
    selected: ProcessHandle,
}

impl Repl
{
    fn interactive(&mut self) -> io::Result<()>
    {
        let stdin = io::stdin();
        let mut lines = stdin.lock().lines();
        loop {
            self.drain_events();
            print!("(strand) ");
            io::stdout().flush()?;
            let Some(line) = lines.next() else {
                return Ok(());
            };
            if self.run_line(&line?) == Flow::Quit {
                return Ok(());
            }
        }
    }

    fn run_line(&mut self, line: &str) -> Flow
    {
        let command = match line.parse::<ReplCommand>() {
            Ok(command) => command,
            Err(e) => {
                println!("{e}");
                return Flow::Continue;
            }
        };
        match self.execute(command) {
            Ok(flow) => flow,
            Err(e) => {
                println!("error: {e}");
                Flow::Continue
            }
        }
    }

    fn execute(&mut self, command: ReplCommand) -> Result<Flow, StrandError>
    {
        match command {
            ReplCommand::Step(operation) => {
                self.selected.step(operation)?;
                self.wait_for_stop();
            }
            ReplCommand::Backtrace(limit) => {
                let backtrace = match limit {
                    Some(max_frames) => self.selected.backtrace_with_limit(max_frames)?,
                    None => self.selected.backtrace()?,
                };
                print!("{backtrace}");
            }
            ReplCommand::Registers => {
                let registers = self.selected.registers()?;
                let names = X86_64Architecture::new().register_names();
                for (name, register) in names.iter().zip(registers.iter()) {
                    if register.valid {
                        println!("{name:<10} 0x{:016x}", register.value);
                    }
                }
            }
            ReplCommand::Examine { address, len } => {
                let bytes = self.selected.read_memory(address, len)?;
                for (row, chunk) in bytes.chunks(16).enumerate() {
                    let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                    println!("0x{:016x}: {}", address.value() + (row as u64) * 16, hex.join(" "));
                }
            }
            ReplCommand::Break(address) => {
                let handle = self.selected.insert_breakpoint(address)?;
                println!("Breakpoint {handle} at {address}");
            }
            ReplCommand::Delete(raw) => {
                self.selected.remove_breakpoint(BreakpointHandle::from_raw(raw))?;
            }
            ReplCommand::Breakpoints => {
                for info in self.selected.breakpoints()? {
                    println!("{} at {} ({:?}, {} hits)", info.handle, info.address, info.scope, info.hit_count);
                }
            }
            ReplCommand::Threads => {
                for thread in self.manager.threads() {
                    let marker = if thread == self.selected { '*' } else { ' ' };
                    let state = thread.state().map_or_else(|e| e.to_string(), |state| state.to_string());
                    let main = if thread.is_main() { " (main)" } else { "" };
                    println!("{marker} {}{main}: {state}", thread.thread_id());
                }
            }
            ReplCommand::SelectThread(thread) => match self.find(thread) {
                Some(handle) => {
                    self.selected = handle;
                    println!("Selected thread {thread}");
                }
                None => println!("no thread {thread}"),
            },
            ReplCommand::Stop => self.selected.stop()?,
            ReplCommand::Kill => {
                self.manager.kill();
                self.wait_for_stop();
                return Ok(Flow::Quit);
            }
            ReplCommand::Detach => {
                self.selected.detach()?;
                return Ok(Flow::Quit);
            }
            ReplCommand::Help => print!("{Help}"),
            ReplCommand::Quit => return Ok(Flow::Quit),
            ReplCommand::Nothing => {}
        }
        Ok(Flow::Continue)
    }

    fn find(&self, thread: strand_core::ThreadId) -> Option<ProcessHandle>
    {
        self.manager.threads().into_iter().find(|handle| handle.thread_id() == thread)
    }

    /// Print events until some thread stops or the target is gone. A stop of
    /// another thread selects that thread.
    fn wait_for_stop(&mut self)
    {
        while let Ok(event) = self.events.recv() {
            println!("{}", event.describe());
            match event {
                DebuggerEvent::TargetEvent {
                    thread,
                    event: TargetEvent::Stopped { .. },
                } => {
                    if thread != self.selected.thread_id() {
                        if let Some(handle) = self.find(thread) {
                            self.selected = handle;
                        }
                    }
                    return;
                }
                DebuggerEvent::TargetEvent { thread, .. } if thread == self.selected.thread_id() => return,
                DebuggerEvent::TargetExited => return,
                DebuggerEvent::DebuggerError { .. } => {
                    warn!("stopped waiting after a debugger error");
                    return;
                }
                _ => {}
            }
        }
    }

    fn drain_events(&mut self)
    {
        loop {
            match self.events.try_recv() {
                Ok(event) => println!("{}", event.describe()),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return,
            }
        }
    }
}
