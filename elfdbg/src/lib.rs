pub mod breakpoint;
pub mod config;
mod debugger;
pub mod disasm;
pub mod dwarf;
pub mod error;
pub mod linux_maps;
pub mod memory;
pub mod reg;
pub mod tracee;

#[cfg(test)]
mod testing;

pub use config::DebuggerConfig;
pub use debugger::{Debugger, ProcessState, StopEvent, VariableValue};
pub use disasm::DecodedInstruction;
pub use dwarf::{DebugInfo, FunctionSymbol};
pub use error::{DebuggerError, Result};
pub use reg::{Reg, RegisterSnapshot};
pub use tracee::{Interrupter, PtraceTracee, Tracee};
