use std::{ffi::CString, os::raw::c_void, os::unix::ffi::OsStrExt, path::Path};

use nix::{
    libc::user_regs_struct,
    sys::{
        personality, ptrace,
        signal::{self, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::{execv, fork, ForkResult, Pid},
};
use tracing::{debug, info};

use crate::error::{DebuggerError, Result};

/// Kernel tracing primitives for one stopped process.
///
/// Every method maps to a single ptrace/wait request. Resume requests
/// (`cont`, `step`) return immediately; `wait` blocks until the kernel
/// reports the next stop or exit.
pub trait Tracee {
    fn pid(&self) -> Pid;

    /// Reads the machine word at `addr`.
    fn peek(&self, addr: u64) -> Result<u64>;

    /// Overwrites the machine word at `addr`.
    fn poke(&mut self, addr: u64, word: u64) -> Result<()>;

    fn get_regs(&self) -> Result<user_regs_struct>;

    fn set_regs(&mut self, regs: user_regs_struct) -> Result<()>;

    fn cont(&mut self) -> Result<()>;

    fn step(&mut self) -> Result<()>;

    fn wait(&mut self) -> Result<WaitStatus>;

    fn kill(&mut self) -> Result<()>;

    fn detach(&mut self) -> Result<()>;
}

/// A process traced through the real `ptrace(2)` interface.
#[derive(Debug)]
pub struct PtraceTracee {
    pid: Pid,
}

impl PtraceTracee {
    /// Forks and executes `program` under tracing.
    ///
    /// Returns once the child reports its first trap after `execv`, so the
    /// target has not executed a single instruction of its own yet.
    pub fn launch(program: &Path) -> Result<PtraceTracee> {
        let c_path = CString::new(program.as_os_str().as_bytes())
            .map_err(|e| DebuggerError::Launch(format!("bad program path: {}", e)))?;

        // SAFETY: the child only performs async-signal-safe calls before execv.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                info!(pid = child.as_raw(), program = %program.display(), "spawned target");
                let tracee = PtraceTracee { pid: child };
                match waitpid(child, None).map_err(DebuggerError::ptrace("wait"))? {
                    WaitStatus::Stopped(_, Signal::SIGTRAP) => Ok(tracee),
                    WaitStatus::Exited(_, code) => Err(DebuggerError::Launch(format!(
                        "target exited with status {} before the first trap",
                        code
                    ))),
                    status => Err(DebuggerError::Launch(format!(
                        "unexpected first stop: {:?}",
                        status
                    ))),
                }
            }
            Ok(ForkResult::Child) => exec_traced(&c_path),
            Err(e) => Err(DebuggerError::Launch(format!("failed to fork: {}", e))),
        }
    }

    /// Takes control of an already running process.
    pub fn attach(pid: Pid) -> Result<PtraceTracee> {
        ptrace::attach(pid).map_err(DebuggerError::ptrace("attach"))?;
        match waitpid(pid, None).map_err(DebuggerError::ptrace("wait"))? {
            WaitStatus::Stopped(_, _) => {
                info!(pid = pid.as_raw(), "attached to process");
                Ok(PtraceTracee { pid })
            }
            status => Err(DebuggerError::Launch(format!(
                "process {} did not stop after attach: {:?}",
                pid, status
            ))),
        }
    }
}

fn exec_traced(c_path: &CString) -> ! {
    if ptrace::traceme().is_err() {
        eprintln!("failed to run traceme");
        // SAFETY: _exit is async-signal-safe and skips the parent's atexit handlers.
        unsafe { nix::libc::_exit(126) }
    }
    // keep addresses stable between runs so breakpoints can be reused
    let _ = personality::set(personality::Persona::ADDR_NO_RANDOMIZE);

    let err = match execv(c_path, &[c_path]) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    eprintln!("failed to execute {:?}: {}", c_path, err);
    // SAFETY: see above.
    unsafe { nix::libc::_exit(127) }
}

impl Tracee for PtraceTracee {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn peek(&self, addr: u64) -> Result<u64> {
        ptrace::read(self.pid, addr as *mut c_void)
            .map(|word| word as u64)
            .map_err(DebuggerError::ptrace("peek"))
    }

    fn poke(&mut self, addr: u64, word: u64) -> Result<()> {
        // SAFETY: addr is an address inside the tracee, word is data, not a pointer.
        unsafe {
            ptrace::write(self.pid, addr as *mut c_void, word as *mut c_void)
                .map_err(DebuggerError::ptrace("poke"))
        }
    }

    fn get_regs(&self) -> Result<user_regs_struct> {
        ptrace::getregs(self.pid).map_err(DebuggerError::ptrace("getregs"))
    }

    fn set_regs(&mut self, regs: user_regs_struct) -> Result<()> {
        ptrace::setregs(self.pid, regs).map_err(DebuggerError::ptrace("setregs"))
    }

    fn cont(&mut self) -> Result<()> {
        debug!(pid = self.pid.as_raw(), "cont");
        ptrace::cont(self.pid, None).map_err(DebuggerError::ptrace("cont"))
    }

    fn step(&mut self) -> Result<()> {
        debug!(pid = self.pid.as_raw(), "singlestep");
        ptrace::step(self.pid, None).map_err(DebuggerError::ptrace("singlestep"))
    }

    fn wait(&mut self) -> Result<WaitStatus> {
        let status = waitpid(self.pid, None).map_err(DebuggerError::ptrace("wait"))?;
        debug!(pid = self.pid.as_raw(), ?status, "wait returned");
        Ok(status)
    }

    fn kill(&mut self) -> Result<()> {
        ptrace::kill(self.pid).map_err(DebuggerError::ptrace("kill"))
    }

    fn detach(&mut self) -> Result<()> {
        ptrace::detach(self.pid, None).map_err(DebuggerError::ptrace("detach"))
    }
}

/// Asks the kernel to stop a traced process from outside the command path.
///
/// Cheap to copy; the embedding program hands it to its signal handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupter {
    pid: Pid,
}

impl Interrupter {
    pub fn new(pid: Pid) -> Interrupter {
        Interrupter { pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// PTRACE_INTERRUPT only works on seized tracees; plain SIGSTOP covers
    /// the rest and still lands in the controller's pending wait.
    pub fn interrupt(&self) -> Result<()> {
        match ptrace::interrupt(self.pid) {
            Ok(()) => Ok(()),
            Err(_) => {
                signal::kill(self.pid, Signal::SIGSTOP).map_err(DebuggerError::ptrace("interrupt"))
            }
        }
    }
}
