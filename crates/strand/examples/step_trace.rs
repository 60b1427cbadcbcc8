//! Drive a session from code instead of the prompt
//!
//! Launches a program, single-steps the main thread a number of times, and
//! prints every frame it passes through. Thread creation and exit are reported
//! by an observer running on the engine thread.
//!
//! ```text
//! RUST_LOG=strand_core=debug cargo run --example step_trace -- /bin/true 20
//! ```

use std::error::Error;
use std::sync::Arc;

use strand_core::{
    DebuggerEvent, DebuggerEventReceiver, LaunchTarget, NoSymbols, SessionConfig, SpawnSpec, TargetEvent, ThreadId,
    ThreadManager, X86_64Architecture,
};
use strand_utils::{info, init_logging};

#[cfg(target_os = "linux")]
fn main() -> Result<(), Box<dyn Error>>
{
    let _guard = init_logging()?;

    let mut args = std::env::args().skip(1);
    let program = args.next().unwrap_or_else(|| "/bin/true".to_string());
    let steps: usize = args.next().and_then(|arg| arg.parse().ok()).unwrap_or(10);

    let manager = ThreadManager::new(
        Arc::new(strand_core::PtraceTransport::new()),
        Arc::new(X86_64Architecture::new()),
        Arc::new(NoSymbols),
        SessionConfig::default().with_stop_at_main(false),
    );
    manager.observe(Arc::new(|event: &DebuggerEvent| match event {
        DebuggerEvent::ThreadCreated(handle) => println!("+ thread {}", handle.thread_id()),
        DebuggerEvent::ThreadExited(handle) => println!("- thread {}", handle.thread_id()),
        _ => {}
    }));

    let events = manager.subscribe();
    let main = manager.start_session(LaunchTarget::Spawn(SpawnSpec::new(program.as_str())))?;
    info!(thread = %main.thread_id(), "session started");
    // Startup events are not interesting here.
    while events.try_recv().is_ok() {}

    for _ in 0..steps {
        main.step_instruction()?;
        if !wait_for_stop(&events, main.thread_id()) {
            println!("target exited");
            manager.dispose();
            return Ok(());
        }
        println!("{}", main.current_frame()?);
    }

    println!("{}", main.backtrace()?);
    manager.kill();
    manager.dispose();
    Ok(())
}

/// Block until `thread` stops. False once the target is gone.
#[cfg(target_os = "linux")]
fn wait_for_stop(events: &DebuggerEventReceiver, thread: ThreadId) -> bool
{
    for event in events {
        match event {
            DebuggerEvent::TargetEvent {
                thread: stopped,
                event: TargetEvent::Stopped { .. },
            } if stopped == thread => return true,
            DebuggerEvent::TargetExited => return false,
            _ => {}
        }
    }
    false
}

#[cfg(not(target_os = "linux"))]
fn main()
{
    eprintln!("step_trace needs the ptrace transport, which is Linux only");
}
