use thiserror::Error;

/// Everything a debugger operation can fail with.
///
/// Launch failures are the only fatal ones; see [`DebuggerError::is_fatal`].
/// The rest are reported to the operator and the session goes on.
#[derive(Error, Debug)]
pub enum DebuggerError {
    #[error("target not started")]
    NotStarted,

    #[error("target is already in run")]
    AlreadyStarted,

    #[error("target process has exited")]
    ProcessExited,

    #[error("target is running")]
    ProcessRunning,

    #[error("unknown register: {0}")]
    UnknownRegister(String),

    #[error("breakpoint limit of {0} reached")]
    BreakpointLimit(usize),

    #[error("no breakpoint at {0:#x}")]
    NoBreakpoint(u64),

    #[error("requested {requested} bytes, at most {max} can be read at once")]
    ReadTooLong { requested: usize, max: usize },

    #[error("ptrace {op} failed: {source}")]
    Ptrace {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("failed to launch target: {0}")]
    Launch(String),

    #[error("debug information is not available")]
    DebugInfoUnavailable,

    #[error("no function contains address {0:#x}")]
    NoFunction(u64),

    #[error("no local variable named {0}")]
    UnknownVariable(String),

    #[error("variable {0} has an unsupported location")]
    UnsupportedLocation(String),

    #[error("failed to parse DWARF: {0}")]
    Dwarf(#[from] gimli::Error),

    #[error("failed to parse object file: {0}")]
    Object(#[from] object::Error),

    #[error("failed to find load address of {0}")]
    LoadAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DebuggerError {
    pub(crate) fn ptrace(op: &'static str) -> impl FnOnce(nix::Error) -> DebuggerError {
        move |source| DebuggerError::Ptrace { op, source }
    }

    /// Whether the whole program has to stop after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DebuggerError::Launch(_))
    }
}

pub type Result<T> = std::result::Result<T, DebuggerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_launch_failures_are_fatal() {
        assert!(DebuggerError::Launch("fork failed".to_owned()).is_fatal());
        assert!(!DebuggerError::NotStarted.is_fatal());
        assert!(!DebuggerError::UnknownRegister("xyz".to_owned()).is_fatal());
    }

    #[test]
    fn ptrace_error_names_the_operation() {
        let err = DebuggerError::ptrace("peek")(nix::errno::Errno::ESRCH);
        let message = err.to_string();
        assert!(message.contains("peek"));
    }
}
