//! Interactive command language of the `strand` front end.

use std::fmt;
use std::str::FromStr;

use strand_core::{Operation, TargetAddress, ThreadId};

/// Parse failure for one input line.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError
{
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),

    #[error("`{command}` needs {what}")]
    MissingArgument
    {
        command: &'static str,
        what: &'static str,
    },

    #[error("invalid number `{0}`")]
    InvalidNumber(String),
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand
{
    /// A stepping operation on the selected thread.
    Step(Operation),
    Backtrace(Option<usize>),
    Registers,
    /// Dump `len` bytes of memory.
    Examine
    {
        address: TargetAddress,
        len: usize,
    },
    Break(TargetAddress),
    Delete(u64),
    Breakpoints,
    Threads,
    SelectThread(ThreadId),
    Stop,
    Kill,
    Detach,
    Help,
    Quit,
    /// Empty line.
    Nothing,
}

impl FromStr for ReplCommand
{
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err>
    {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else {
            return Ok(Self::Nothing);
        };
        let first = words.next();

        let command = match name {
            "c" | "continue" => Self::Step(Operation::Continue),
            "s" | "step" => Self::Step(Operation::StepInto),
            "n" | "next" => Self::Step(Operation::StepOver),
            "si" | "stepi" => Self::Step(Operation::StepInstruction),
            "ni" | "nexti" => Self::Step(Operation::NextInstruction),
            "finish" | "fin" => Self::Step(Operation::StepOut),
            "until" | "u" => Self::Step(Operation::RunTo(required_address(first, "until")?)),
            "bt" | "backtrace" => Self::Backtrace(first.map(parse_number).transpose()?.map(to_usize)),
            "regs" | "registers" => Self::Registers,
            "x" => {
                let address = required_address(first, "x")?;
                let len = words.next().map(parse_number).transpose()?.map_or(16, to_usize);
                Self::Examine { address, len }
            }
            "b" | "break" => Self::Break(required_address(first, "break")?),
            "d" | "delete" => Self::Delete(parse_number(first.ok_or(CommandError::MissingArgument {
                command: "delete",
                what: "a breakpoint number",
            })?)?),
            "info" if first == Some("breakpoints") => Self::Breakpoints,
            "breakpoints" => Self::Breakpoints,
            "threads" => Self::Threads,
            "thread" | "t" => Self::SelectThread(ThreadId(parse_number(first.ok_or(
                CommandError::MissingArgument {
                    command: "thread",
                    what: "a thread id",
                },
            )?)?)),
            "stop" => Self::Stop,
            "kill" => Self::Kill,
            "detach" => Self::Detach,
            "help" | "h" | "?" => Self::Help,
            "q" | "quit" | "exit" => Self::Quit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(command)
    }
}

fn to_usize(value: u64) -> usize
{
    usize::try_from(value).unwrap_or(usize::MAX)
}

/// Decimal, or hexadecimal with a `0x` prefix.
pub fn parse_number(word: &str) -> Result<u64, CommandError>
{
    let parsed = match word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => word.parse(),
    };
    parsed.map_err(|_| CommandError::InvalidNumber(word.to_string()))
}

fn required_address(word: Option<&str>, command: &'static str) -> Result<TargetAddress, CommandError>
{
    let word = word.ok_or(CommandError::MissingArgument {
        command,
        what: "an address",
    })?;
    Ok(TargetAddress::global(parse_number(word)?))
}

/// Help text printed by `help`.
pub struct Help;

impl fmt::Display for Help
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        writeln!(f, "Stepping (selected thread):")?;
        writeln!(f, "  c, continue        resume until the next stop")?;
        writeln!(f, "  s, step            step into the next line")?;
        writeln!(f, "  n, next            step over the next line")?;
        writeln!(f, "  si, stepi          execute one instruction")?;
        writeln!(f, "  ni, nexti          execute one instruction, stepping over calls")?;
        writeln!(f, "  finish             run until the current function returns")?;
        writeln!(f, "  until <addr>       run until <addr> is reached")?;
        writeln!(f, "Inspection:")?;
        writeln!(f, "  bt [n]             backtrace, at most n frames")?;
        writeln!(f, "  regs               registers")?;
        writeln!(f, "  x <addr> [len]     dump memory")?;
        writeln!(f, "Breakpoints:")?;
        writeln!(f, "  b <addr>           insert a breakpoint")?;
        writeln!(f, "  d <n>              delete breakpoint n")?;
        writeln!(f, "  breakpoints        list breakpoints")?;
        writeln!(f, "Threads and process:")?;
        writeln!(f, "  threads            list threads")?;
        writeln!(f, "  thread <tid>       select a thread")?;
        writeln!(f, "  stop               stop the selected thread")?;
        writeln!(f, "  kill, detach, quit")
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn parse(line: &str) -> Result<ReplCommand, CommandError>
    {
        line.parse()
    }

    #[test]
    fn stepping_aliases()
    {
        assert_eq!(parse("c").unwrap(), ReplCommand::Step(Operation::Continue));
        assert_eq!(parse("next").unwrap(), ReplCommand::Step(Operation::StepOver));
        assert_eq!(parse("  si ").unwrap(), ReplCommand::Step(Operation::StepInstruction));
        assert_eq!(parse("finish").unwrap(), ReplCommand::Step(Operation::StepOut));
        assert_eq!(
            parse("until 0x401000").unwrap(),
            ReplCommand::Step(Operation::RunTo(TargetAddress::global(0x40_1000)))
        );
    }

    #[test]
    fn arguments()
    {
        assert_eq!(
            parse("x 0x1000 32").unwrap(),
            ReplCommand::Examine {
                address: TargetAddress::global(0x1000),
                len: 32
            }
        );
        assert_eq!(
            parse("x 4096").unwrap(),
            ReplCommand::Examine {
                address: TargetAddress::global(4096),
                len: 16
            }
        );
        assert_eq!(parse("bt").unwrap(), ReplCommand::Backtrace(None));
        assert_eq!(parse("bt 5").unwrap(), ReplCommand::Backtrace(Some(5)));
        assert_eq!(parse("d 3").unwrap(), ReplCommand::Delete(3));
        assert_eq!(parse("thread 4242").unwrap(), ReplCommand::SelectThread(ThreadId(4242)));
        assert_eq!(parse("info breakpoints").unwrap(), ReplCommand::Breakpoints);
        assert_eq!(parse("").unwrap(), ReplCommand::Nothing);
    }

    #[test]
    fn errors()
    {
        assert_eq!(parse("frobnicate"), Err(CommandError::Unknown("frobnicate".to_string())));
        assert_eq!(
            parse("b"),
            Err(CommandError::MissingArgument {
                command: "break",
                what: "an address"
            })
        );
        assert_eq!(parse("b 0xzz"), Err(CommandError::InvalidNumber("0xzz".to_string())));
    }
}
