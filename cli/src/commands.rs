use std::{
    num::ParseIntError,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use elfdbg::{
    DebuggerError, DecodedInstruction, FunctionSymbol, ProcessState, RegisterSnapshot, StopEvent,
    VariableValue,
};
use rustyline::{error::ReadlineError, history::DefaultHistory};
use thiserror::Error;
use tracing::debug;

use crate::helper;

const PROMPT: &str = "elfdbg> ";
const BYTES_PER_ROW: usize = 16;

pub struct CommandInfo {
    pub names: &'static [&'static str],
    pub usage: &'static str,
    pub about: &'static str,
}

pub const COMMANDS: &[CommandInfo] = &[
    CommandInfo {
        names: &["start", "run"],
        usage: "start",
        about: "launch the program and stop before its first instruction",
    },
    CommandInfo {
        names: &["continue", "c"],
        usage: "continue",
        about: "resume until a breakpoint, a signal or exit",
    },
    CommandInfo {
        names: &["break", "b"],
        usage: "break <addr>",
        about: "set a breakpoint",
    },
    CommandInfo {
        names: &["delete"],
        usage: "delete <addr>",
        about: "remove a breakpoint",
    },
    CommandInfo {
        names: &["breakpoints"],
        usage: "breakpoints",
        about: "list breakpoints",
    },
    CommandInfo {
        names: &["step", "s"],
        usage: "step",
        about: "execute one instruction",
    },
    CommandInfo {
        names: &["next", "n"],
        usage: "next",
        about: "execute one instruction, running calls to their return",
    },
    CommandInfo {
        names: &["functions"],
        usage: "functions",
        about: "list functions from debug info",
    },
    CommandInfo {
        names: &["disas"],
        usage: "disas",
        about: "disassemble the current function",
    },
    CommandInfo {
        names: &["regs", "ir"],
        usage: "regs",
        about: "dump registers",
    },
    CommandInfo {
        names: &["set"],
        usage: "set <reg> <value>",
        about: "write a register",
    },
    CommandInfo {
        names: &["locals", "il"],
        usage: "locals",
        about: "show local variables of the current function",
    },
    CommandInfo {
        names: &["print"],
        usage: "print <name>",
        about: "show one local variable",
    },
    CommandInfo {
        names: &["x"],
        usage: "x <addr> <len>",
        about: "dump memory",
    },
    CommandInfo {
        names: &["poke"],
        usage: "poke <addr> <value>",
        about: "write one machine word",
    },
    CommandInfo {
        names: &["kill"],
        usage: "kill",
        about: "terminate the program",
    },
    CommandInfo {
        names: &["help"],
        usage: "help",
        about: "show this list",
    },
    CommandInfo {
        names: &["exit", "quit"],
        usage: "exit",
        about: "leave the debugger",
    },
];

/// Every spelling the shell accepts, for completion.
pub fn command_names() -> Vec<String> {
    COMMANDS
        .iter()
        .flat_map(|info| info.names.iter().map(|name| name.to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Continue,
    Break(u64),
    Delete(u64),
    Breakpoints,
    Step,
    Next,
    Functions,
    Disassemble,
    Registers,
    SetRegister { reg: String, value: u64 },
    Locals,
    Print(String),
    Examine { addr: u64, len: usize },
    Poke { addr: u64, value: u64 },
    Kill,
    Help,
    Exit,
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("unknown command: {0}, try `help`")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid number {value:?}: {source}")]
    Number {
        value: String,
        #[source]
        source: ParseIntError,
    },

    #[error(transparent)]
    Debugger(#[from] DebuggerError),
}

impl CommandError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CommandError::Debugger(e) if e.is_fatal())
    }
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("failed to read line: {0}")]
    Readline(#[from] ReadlineError),

    #[error("failed to install interrupt handler: {0}")]
    Interrupt(#[from] ctrlc::Error),

    #[error(transparent)]
    Debugger(#[from] DebuggerError),

    #[error(transparent)]
    Command(#[from] CommandError),
}

/// Parses one input line. `Ok(None)` for a blank line.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let args: Vec<&str> = words.collect();

    let command = match (name, args.as_slice()) {
        ("start" | "run", []) => Command::Start,
        ("continue" | "c", []) => Command::Continue,
        ("break" | "b", [addr]) => Command::Break(parse_number(addr)?),
        ("delete", [addr]) => Command::Delete(parse_number(addr)?),
        ("breakpoints", []) => Command::Breakpoints,
        ("step" | "s", []) => Command::Step,
        ("next" | "n", []) => Command::Next,
        ("functions", []) => Command::Functions,
        ("disas", []) => Command::Disassemble,
        ("regs" | "ir", []) => Command::Registers,
        ("set", [reg, value]) => Command::SetRegister {
            reg: reg.to_string(),
            value: parse_number(value)?,
        },
        ("locals" | "il", []) => Command::Locals,
        ("print", [variable]) => Command::Print(variable.to_string()),
        ("x", [addr, len]) => Command::Examine {
            addr: parse_number(addr)?,
            len: parse_number(len)? as usize,
        },
        ("poke", [addr, value]) => Command::Poke {
            addr: parse_number(addr)?,
            value: parse_number(value)?,
        },
        ("kill", []) => Command::Kill,
        ("help", []) => Command::Help,
        ("exit" | "quit", []) => Command::Exit,
        _ => {
            return Err(match COMMANDS.iter().find(|info| info.names.contains(&name)) {
                Some(info) => CommandError::Usage(info.usage),
                None => CommandError::Unknown(name.to_owned()),
            })
        }
    };
    Ok(Some(command))
}

/// Hex with a `0x` prefix, decimal otherwise.
fn parse_number(value: &str) -> Result<u64, CommandError> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map_err(|source| CommandError::Number {
        value: value.to_owned(),
        source,
    })
}

pub fn run_command_loop(
    editor: &mut rustyline::Editor<helper::CliHelper, DefaultHistory>,
    debugger: &mut elfdbg::Debugger,
    target_pid: &Arc<AtomicI32>,
) -> Result<(), CliError> {
    loop {
        let readline = editor.readline(PROMPT);
        match readline {
            Ok(line) => {
                if !line.trim().is_empty() {
                    editor.add_history_entry(line.as_str())?;
                }

                let outcome = parse_command(&line)
                    .and_then(|command| match command {
                        Some(command) => handle_command(debugger, command),
                        None => Ok(true),
                    });
                // only interrupt a process that is still ours
                let pid = match debugger.state() {
                    ProcessState::Stopped | ProcessState::Running => {
                        debugger.interrupter().map_or(0, |i| i.pid().as_raw())
                    }
                    _ => 0,
                };
                target_pid.store(pid, Ordering::SeqCst);

                match outcome {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => eprintln!("error: {}", e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Runs one command. `Ok(false)` ends the session.
fn handle_command(debugger: &mut elfdbg::Debugger, command: Command) -> Result<bool, CommandError> {
    debug!(?command, "handling command");
    match command {
        Command::Start => {
            let pid = debugger.start()?;
            println!("Starting debugging process {}.", pid);
        }
        Command::Continue => println!("{}", format_stop(&debugger.continue_execution()?)),
        Command::Break(addr) => {
            debugger.set_breakpoint(addr)?;
            println!("Breakpoint set at {:#x}", addr);
        }
        Command::Delete(addr) => {
            debugger.clear_breakpoint(addr)?;
            println!("Breakpoint at {:#x} deleted", addr);
        }
        Command::Breakpoints => {
            let breakpoints = debugger.breakpoints();
            if breakpoints.is_empty() {
                println!("No breakpoints.");
            }
            for (i, addr) in breakpoints.into_iter().enumerate() {
                println!("#{}\t{:#x}", i, addr);
            }
        }
        Command::Step => println!("{}", format_stop(&debugger.step()?)),
        Command::Next => println!("{}", format_stop(&debugger.step_over()?)),
        Command::Functions => {
            let functions = debugger.list_functions()?;
            if functions.is_empty() && !debugger.has_symbols() {
                println!("No debug info.");
            }
            for function in functions {
                println!("{}", format_function(&function));
            }
        }
        Command::Disassemble => {
            for instruction in debugger.disassemble_current_function()? {
                println!("{}", format_instruction(&instruction));
            }
        }
        Command::Registers => print!("{}", format_registers(&debugger.info_registers()?)),
        Command::SetRegister { reg, value } => debugger.write_register(&reg, value)?,
        Command::Locals => {
            for variable in debugger.info_locals()? {
                println!("{}", format_variable(&variable));
            }
        }
        Command::Print(name) => println!("{} = {:#x}", name, debugger.print_variable(&name)?),
        Command::Examine { addr, len } => {
            let bytes = debugger.read_memory(addr, len)?;
            print!("{}", format_memory(addr, &bytes));
        }
        Command::Poke { addr, value } => debugger.write_memory(addr, value)?,
        Command::Kill => {
            debugger.kill_target()?;
            println!("Process killed.");
        }
        Command::Help => print!("{}", help_text()),
        Command::Exit => return Ok(false),
    }
    Ok(true)
}

pub fn format_stop(event: &StopEvent) -> String {
    match event {
        StopEvent::Breakpoint { address } => format!("Breakpoint hit at {:#x}", address),
        StopEvent::Trap { pc } => format!("Stopped at {:#x}", pc),
        StopEvent::Signal { signal, pc } => format!("Received {} at {:#x}", signal, pc),
        StopEvent::Exited { code } => format!("Process exited with status: {}", code),
        StopEvent::Killed { signal } => format!("Process killed by {}", signal),
    }
}

pub fn format_registers(snapshot: &RegisterSnapshot) -> String {
    snapshot
        .iter()
        .map(|(reg, value)| format!("{:<8}{:#018x}\n", reg.name(), value))
        .collect()
}

pub fn format_instruction(instruction: &DecodedInstruction) -> String {
    let bytes = instruction
        .bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{:#x}:\t{}\t{}\t{}",
        instruction.address, bytes, instruction.mnemonic, instruction.operands
    )
}

pub fn format_function(function: &FunctionSymbol) -> String {
    format!(
        "{:#x}-{:#x}\t{}",
        function.low_pc, function.high_pc, function.name
    )
}

pub fn format_variable(variable: &VariableValue) -> String {
    match (variable.address, variable.value) {
        (_, Some(value)) => format!("{} = {:#x}", variable.name, value),
        (Some(addr), None) => format!("{} = <unreadable at {:#x}>", variable.name, addr),
        (None, None) => format!("{} = <unsupported location>", variable.name),
    }
}

pub fn format_memory(addr: u64, bytes: &[u8]) -> String {
    bytes
        .chunks(BYTES_PER_ROW)
        .enumerate()
        .map(|(row, chunk)| {
            let hex = chunk
                .iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{:#x}: {}\n", addr + (row * BYTES_PER_ROW) as u64, hex)
        })
        .collect()
}

fn help_text() -> String {
    COMMANDS
        .iter()
        .map(|info| {
            let aliases = info.names[1..].join(", ");
            if aliases.is_empty() {
                format!("{:<20}{}\n", info.usage, info.about)
            } else {
                format!("{:<20}{} (alias: {})\n", info.usage, info.about, aliases)
            }
        })
        .collect()
}
