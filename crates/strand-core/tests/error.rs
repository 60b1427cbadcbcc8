//! Tests for error handling

use strand_core::breakpoints::BreakpointHandle;
use strand_core::{CommandResult, CommandValue, StrandError, StrandResult, ThreadId};

#[test]
fn test_strand_error_display()
{
    let error = StrandError::NotStopped(ThreadId(12));
    assert_eq!(error.to_string(), "Thread 12 is not stopped");

    let error = StrandError::memory(0xdead, "unmapped");
    assert_eq!(error.to_string(), "Cannot access target memory at 0xdead: unmapped");

    let error = StrandError::UnknownBreakpoint(BreakpointHandle::from_raw(3));
    assert_eq!(error.to_string(), "Unknown breakpoint: #3");

    let error = StrandError::InvalidArgument("test arg".to_string());
    let message = format!("{}", error);
    assert!(message.contains("Invalid argument"));
    assert!(message.contains("test arg"));
}

#[test]
fn test_fatal_classification()
{
    assert!(StrandError::ProtocolViolation("first event".into()).is_fatal());
    assert!(StrandError::Internal("slot occupied".into()).is_fatal());
    assert!(StrandError::Transport("wait failed".into()).is_fatal());

    assert!(!StrandError::Busy.is_fatal());
    assert!(!StrandError::Startup("no main".into()).is_fatal());
    assert!(!StrandError::NotStopped(ThreadId(1)).is_fatal());
    assert!(!StrandError::memory(0, "unmapped").is_fatal());
}

#[test]
fn test_io_error_conversion()
{
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ptrace scope");
    let error: StrandError = io.into();
    assert!(matches!(error, StrandError::Io(_)));
    assert!(error.to_string().contains("ptrace scope"));
}

#[test]
fn test_command_result_into_result()
{
    assert!(matches!(CommandResult::Busy.into_result(), Err(StrandError::Busy)));
    assert!(matches!(
        CommandResult::Interrupted.into_result(),
        Err(StrandError::Interrupted)
    ));
    assert!(matches!(
        CommandResult::Ok(CommandValue::None).into_result(),
        Ok(CommandValue::None)
    ));
}

#[test]
fn test_command_result_from_result()
{
    let busy: CommandResult = StrandResult::<CommandValue>::Err(StrandError::Busy).into();
    assert!(busy.is_busy());

    let interrupted: CommandResult = StrandResult::<CommandValue>::Err(StrandError::Interrupted).into();
    assert!(matches!(interrupted, CommandResult::Interrupted));

    let failed: CommandResult = StrandResult::<CommandValue>::Err(StrandError::SessionClosed).into();
    assert!(matches!(failed, CommandResult::Error(StrandError::SessionClosed)));
}

#[test]
fn test_result_type()
{
    // Test that Result type is properly aliased
    let _result: StrandResult<()> = Ok(());
    let _error_result: StrandResult<()> = Err(StrandError::UnknownThread(ThreadId(9)));
}
