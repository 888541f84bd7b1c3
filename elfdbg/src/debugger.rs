use std::path::{Path, PathBuf};

use nix::{
    sys::{signal::Signal, wait::WaitStatus},
    unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::{
    breakpoint::{Breakpoint, BreakpointTable},
    config::DebuggerConfig,
    disasm::{self, DecodedInstruction},
    dwarf::{DebugInfo, FunctionSymbol},
    error::{DebuggerError, Result},
    linux_maps,
    memory,
    reg::{Reg, RegisterSnapshot},
    tracee::{Interrupter, PtraceTracee, Tracee},
};

/// Lifecycle of the traced process.
///
/// `NotStarted -> Stopped <-> Running -> Exited`; `Exited` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Stopped,
    Running,
    Exited,
}

/// Why a resume-type operation returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// A recorded breakpoint was hit. The trapping instruction has already
    /// been executed and the trap re-armed.
    Breakpoint { address: u64 },
    /// A trap that is not one of ours, e.g. the end of a single step.
    Trap { pc: u64 },
    Signal { signal: Signal, pc: u64 },
    Exited { code: i32 },
    Killed { signal: Signal },
}

/// A local variable with its live value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableValue {
    pub name: String,
    /// `None` for locations that are not frame-base relative.
    pub address: Option<u64>,
    /// `None` when there is no address or the word could not be read.
    pub value: Option<u64>,
}

/// Owns one traced process and everything needed to drive it.
pub struct Debugger<T: Tracee = PtraceTracee> {
    program: PathBuf,
    config: DebuggerConfig,
    state: ProcessState,
    tracee: Option<T>,
    attached: bool,
    breakpoints: BreakpointTable,
    symbols: Option<DebugInfo>,
    /// Runtime address minus file address of the main executable.
    load_bias: u64,
}

impl Debugger<PtraceTracee> {
    /// Forks and executes the target, stopping before its first instruction.
    /// Returns the pid so the caller can route interrupts to it.
    pub fn start(&mut self) -> Result<Pid> {
        self.start_with(PtraceTracee::launch)
    }

    /// Takes control of a running process instead of launching one.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        if self.state != ProcessState::NotStarted {
            return Err(DebuggerError::AlreadyStarted);
        }
        let tracee = PtraceTracee::attach(pid)?;
        self.attached = true;
        self.install(tracee);
        Ok(())
    }
}

impl<T: Tracee> Debugger<T> {
    pub fn new(program: impl Into<PathBuf>, config: DebuggerConfig) -> Debugger<T> {
        Debugger {
            program: program.into(),
            config,
            state: ProcessState::NotStarted,
            tracee: None,
            attached: false,
            breakpoints: BreakpointTable::new(config.max_breakpoints),
            symbols: None,
            load_bias: 0,
        }
    }

    /// Uses already loaded debug info instead of reading it from the program
    /// on start.
    pub fn with_symbols(mut self, symbols: DebugInfo) -> Debugger<T> {
        self.symbols = Some(symbols);
        self
    }

    /// Starts the target through `spawn`, which must return a tracee stopped
    /// at its first trap.
    pub fn start_with<F>(&mut self, spawn: F) -> Result<Pid>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        if self.state != ProcessState::NotStarted {
            return Err(DebuggerError::AlreadyStarted);
        }
        let tracee = spawn(&self.program)?;
        Ok(self.install(tracee))
    }

    fn install(&mut self, tracee: T) -> Pid {
        let pid = tracee.pid();
        if self.symbols.is_none() {
            match DebugInfo::open(&self.program) {
                Ok(symbols) => self.symbols = Some(symbols),
                Err(e) => warn!(
                    program = %self.program.display(),
                    "symbol queries disabled, failed to load debug info: {}", e
                ),
            }
        }
        if self
            .symbols
            .as_ref()
            .map_or(false, DebugInfo::is_position_independent)
        {
            match linux_maps::get_load_addr(pid.as_raw(), &self.program) {
                Ok(addr) => self.load_bias = addr,
                Err(e) => warn!("assuming zero load bias: {}", e),
            }
        }

        info!(pid = pid.as_raw(), load_bias = self.load_bias, "target stopped at entry");
        self.tracee = Some(tracee);
        self.state = ProcessState::Stopped;
        pid
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn pid(&self) -> Option<Pid> {
        self.tracee.as_ref().map(Tracee::pid)
    }

    /// Capability to stop the target from a signal handler or another thread.
    pub fn interrupter(&self) -> Option<Interrupter> {
        self.pid().map(Interrupter::new)
    }

    pub fn has_symbols(&self) -> bool {
        self.symbols.is_some()
    }

    /// Active breakpoint addresses in ascending order.
    pub fn breakpoints(&self) -> Vec<u64> {
        self.breakpoints.iter().map(Breakpoint::addr).collect()
    }

    #[cfg(test)]
    pub(crate) fn tracee(&self) -> Option<&T> {
        self.tracee.as_ref()
    }

    fn require_stopped(&self) -> Result<()> {
        match self.state {
            ProcessState::Stopped => Ok(()),
            ProcessState::NotStarted => Err(DebuggerError::NotStarted),
            ProcessState::Running => Err(DebuggerError::ProcessRunning),
            ProcessState::Exited => Err(DebuggerError::ProcessExited),
        }
    }

    fn stopped_tracee(&mut self) -> Result<&mut T> {
        self.require_stopped()?;
        self.tracee.as_mut().ok_or(DebuggerError::NotStarted)
    }

    /// Resumes the target and blocks until it stops or exits.
    pub fn continue_execution(&mut self) -> Result<StopEvent> {
        match self.resume()? {
            StopEvent::Trap { pc } if self.breakpoints.contains(pc.wrapping_sub(1)) => {
                self.step_past_hit(pc.wrapping_sub(1))
            }
            event => Ok(event),
        }
    }

    /// Lets the target run until the next kernel report, without looking at
    /// which trap it was.
    fn resume(&mut self) -> Result<StopEvent> {
        self.require_stopped()?;
        if let Some(event) = self.step_off_breakpoint()? {
            return Ok(event);
        }

        self.stopped_tracee()?.cont()?;
        self.state = ProcessState::Running;
        let status = self.wait()?;
        self.settle(status)
    }

    /// Executes exactly one machine instruction.
    pub fn step(&mut self) -> Result<StopEvent> {
        let pc = self.info_registers()?.pc();
        if self.breakpoints.contains(pc) {
            return self.step_disarmed(pc);
        }

        self.stopped_tracee()?.step()?;
        self.state = ProcessState::Running;
        let status = self.wait()?;
        self.settle(status)
    }

    /// Steps over a call by running to its return site; any other
    /// instruction is single stepped.
    pub fn step_over(&mut self) -> Result<StopEvent> {
        let tracee = self.stopped_tracee()?;
        let pc = tracee.get_regs()?.rip;
        let mut window = memory::read_bytes(&*tracee, pc, disasm::CALL_WINDOW)?;
        self.breakpoints.mask_traps(pc, &mut window);

        let Some(return_site) = disasm::next_instruction_address_if_call(&window, pc) else {
            return self.step();
        };
        debug!(pc, return_site, "stepping over call");

        if self.breakpoints.contains(return_site) {
            return self.continue_execution();
        }

        self.set_breakpoint(return_site)?;
        let outcome = self.run_to_return_site(return_site);
        let discarded = self.discard_breakpoint(return_site);
        let event = outcome?;
        discarded?;
        Ok(event)
    }

    /// Continues with a temporary breakpoint at `return_site`. Arriving there
    /// leaves the pc on the return site with nothing executed past it.
    fn run_to_return_site(&mut self, return_site: u64) -> Result<StopEvent> {
        match self.resume()? {
            StopEvent::Trap { pc } if pc.wrapping_sub(1) == return_site => {
                self.set_register(Reg::Rip, return_site)?;
                Ok(StopEvent::Trap { pc: return_site })
            }
            StopEvent::Trap { pc } if self.breakpoints.contains(pc.wrapping_sub(1)) => {
                self.step_past_hit(pc.wrapping_sub(1))
            }
            event => Ok(event),
        }
    }

    /// Drops the breakpoint at `addr` if it is still recorded, restoring code
    /// only while there is a stopped process to restore it in.
    fn discard_breakpoint(&mut self, addr: u64) -> Result<()> {
        if !self.breakpoints.contains(addr) {
            return Ok(());
        }
        if self.state == ProcessState::Stopped {
            return self.clear_breakpoint(addr);
        }
        self.breakpoints.remove(addr);
        Ok(())
    }

    /// Patches a trap opcode in at `addr`. Setting a breakpoint where one
    /// already exists changes nothing.
    pub fn set_breakpoint(&mut self, addr: u64) -> Result<()> {
        self.require_stopped()?;
        if self.breakpoints.contains(addr) {
            debug!(addr, "breakpoint already set");
            return Ok(());
        }

        let tracee = self.stopped_tracee()?;
        let resident = tracee.peek(addr)?;
        // neighbouring traps inside this word are not part of the original code
        let original_word = self.breakpoints.mask_word(addr, resident);
        self.breakpoints.insert(Breakpoint::new(addr, original_word))?;

        let patched = self.breakpoints.overlay_traps(addr, original_word);
        if let Err(e) = self.write_word(addr, patched) {
            self.breakpoints.remove(addr);
            return Err(e);
        }
        info!(addr, "breakpoint set");
        Ok(())
    }

    /// Removes the breakpoint at `addr` and puts the original word back.
    pub fn clear_breakpoint(&mut self, addr: u64) -> Result<()> {
        self.require_stopped()?;
        let bp = self
            .breakpoints
            .remove(addr)
            .ok_or(DebuggerError::NoBreakpoint(addr))?;

        let restored = self.breakpoints.overlay_traps(addr, bp.original_word());
        if let Err(e) = self.write_word(addr, restored) {
            let _ = self.breakpoints.insert(bp);
            return Err(e);
        }
        info!(addr, "breakpoint cleared");
        Ok(())
    }

    /// Terminates the target. Does nothing if there is no live process.
    pub fn kill_target(&mut self) -> Result<()> {
        if !matches!(self.state, ProcessState::Stopped | ProcessState::Running) {
            return Ok(());
        }
        if let Some(tracee) = self.tracee.as_mut() {
            tracee.kill()?;
            // reap it so no zombie is left behind
            if let Err(e) = tracee.wait() {
                warn!(pid = tracee.pid().as_raw(), "failed to reap killed target: {}", e);
            }
            info!(pid = tracee.pid().as_raw(), "target killed");
        }
        self.state = ProcessState::Exited;
        Ok(())
    }

    pub fn info_registers(&self) -> Result<RegisterSnapshot> {
        self.require_stopped()?;
        let tracee = self.tracee.as_ref().ok_or(DebuggerError::NotStarted)?;
        Ok(RegisterSnapshot::from_regs(&tracee.get_regs()?))
    }

    /// Sets one register by name; the rest of the register file is written
    /// back unchanged.
    pub fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        self.require_stopped()?;
        let reg: Reg = name.parse()?;
        self.set_register(reg, value)
    }

    pub fn set_register(&mut self, reg: Reg, value: u64) -> Result<()> {
        let tracee = self.stopped_tracee()?;
        let mut regs = tracee.get_regs()?;
        let mut snapshot = RegisterSnapshot::from_regs(&regs);
        snapshot.set(reg, value);
        snapshot.apply(&mut regs);
        tracee.set_regs(regs)?;
        debug!(%reg, value, "register written");
        Ok(())
    }

    /// Reads `len` raw bytes; trap bytes of breakpoints are returned as they
    /// are in memory.
    pub fn read_memory(&self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.require_stopped()?;
        if len > self.config.max_read_len {
            return Err(DebuggerError::ReadTooLong {
                requested: len,
                max: self.config.max_read_len,
            });
        }
        let tracee = self.tracee.as_ref().ok_or(DebuggerError::NotStarted)?;
        memory::read_bytes(tracee, addr, len)
    }

    /// Overwrites one machine word.
    pub fn write_memory(&mut self, addr: u64, word: u64) -> Result<()> {
        self.require_stopped()?;
        self.write_word(addr, word)
    }

    /// Functions known to the debug info, at runtime addresses. Empty when
    /// debug info could not be loaded.
    pub fn list_functions(&self) -> Result<Vec<FunctionSymbol>> {
        self.require_stopped()?;
        let Some(symbols) = self.symbols.as_ref() else {
            return Ok(Vec::new());
        };
        Ok(symbols
            .functions()
            .into_iter()
            .map(|function| function.rebased(self.load_bias))
            .collect())
    }

    /// The function the program counter is in, at runtime addresses.
    pub fn current_function(&self) -> Result<FunctionSymbol> {
        let pc = self.info_registers()?.pc();
        self.function_at(pc)
    }

    fn function_at(&self, pc: u64) -> Result<FunctionSymbol> {
        let symbols = self
            .symbols
            .as_ref()
            .ok_or(DebuggerError::DebugInfoUnavailable)?;
        symbols
            .function_containing(pc.wrapping_sub(self.load_bias))
            .map(|function| function.rebased(self.load_bias))
            .ok_or(DebuggerError::NoFunction(pc))
    }

    /// Disassembly of the whole current function as the program has it,
    /// without breakpoint traps.
    pub fn disassemble_current_function(&self) -> Result<Vec<DecodedInstruction>> {
        let function = self.current_function()?;
        let tracee = self.tracee.as_ref().ok_or(DebuggerError::NotStarted)?;

        let mut code = memory::read_bytes(tracee, function.low_pc, function.len() as usize)?;
        self.breakpoints.mask_traps(function.low_pc, &mut code);
        Ok(disasm::disassemble(&code, function.low_pc))
    }

    /// Variables of the current function with their values in the current
    /// frame.
    pub fn info_locals(&self) -> Result<Vec<VariableValue>> {
        let regs = self.info_registers()?;
        let function = self.function_at(regs.pc())?;
        let tracee = self.tracee.as_ref().ok_or(DebuggerError::NotStarted)?;
        let symbols = self
            .symbols
            .as_ref()
            .ok_or(DebuggerError::DebugInfoUnavailable)?;

        let rbp = regs.get(Reg::Rbp);
        Ok(symbols
            .locals_of(&function.name)
            .into_iter()
            .map(|variable| {
                let address = variable.address(rbp);
                let value = address.and_then(|addr| match tracee.peek(addr) {
                    Ok(word) => Some(word),
                    Err(e) => {
                        debug!(name = %variable.name, addr, "unreadable local: {}", e);
                        None
                    }
                });
                VariableValue {
                    name: variable.name,
                    address,
                    value,
                }
            })
            .collect())
    }

    /// Value of the local variable called `name` in the current frame.
    pub fn print_variable(&self, name: &str) -> Result<u64> {
        let variable = self
            .info_locals()?
            .into_iter()
            .find(|variable| variable.name == name)
            .ok_or_else(|| DebuggerError::UnknownVariable(name.to_owned()))?;
        variable
            .value
            .ok_or(DebuggerError::UnsupportedLocation(variable.name))
    }

    fn write_word(&mut self, addr: u64, word: u64) -> Result<()> {
        self.tracee
            .as_mut()
            .ok_or(DebuggerError::NotStarted)?
            .poke(addr, word)
    }

    fn wait(&mut self) -> Result<WaitStatus> {
        let tracee = self.tracee.as_mut().ok_or(DebuggerError::NotStarted)?;
        match tracee.wait() {
            Ok(status) => Ok(status),
            Err(e) => {
                // nothing left to wait for, the process is gone
                self.state = ProcessState::Exited;
                Err(e)
            }
        }
    }

    /// Moves the state machine to wherever `status` leaves the process.
    fn settle(&mut self, status: WaitStatus) -> Result<StopEvent> {
        let event = match status {
            WaitStatus::Exited(_, code) => {
                info!(code, "target exited");
                self.state = ProcessState::Exited;
                return Ok(StopEvent::Exited { code });
            }
            WaitStatus::Signaled(_, signal, _) => {
                info!(?signal, "target killed by signal");
                self.state = ProcessState::Exited;
                return Ok(StopEvent::Killed { signal });
            }
            WaitStatus::Stopped(_, signal) | WaitStatus::PtraceEvent(_, signal, _)
                if signal != Signal::SIGTRAP =>
            {
                self.state = ProcessState::Stopped;
                let pc = self.info_registers()?.pc();
                StopEvent::Signal { signal, pc }
            }
            _ => {
                self.state = ProcessState::Stopped;
                let pc = self.info_registers()?.pc();
                StopEvent::Trap { pc }
            }
        };
        debug!(?event, "target stopped");
        Ok(event)
    }

    /// Handles a trap reported right after the breakpoint at `addr`: puts the
    /// original word back, rewinds the pc onto it, executes that single
    /// instruction and re-arms the trap.
    fn step_past_hit(&mut self, addr: u64) -> Result<StopEvent> {
        info!(addr, "breakpoint hit");
        let tracee = self.stopped_tracee()?;
        let mut regs = tracee.get_regs()?;
        regs.rip = addr;
        tracee.set_regs(regs)?;

        match self.step_disarmed(addr)? {
            StopEvent::Trap { .. } => Ok(StopEvent::Breakpoint { address: addr }),
            event => Ok(event),
        }
    }

    /// If the pc sits on a breakpoint, that instruction has to run with its
    /// original byte. Returns an event only if the process did not come to a
    /// plain stop.
    fn step_off_breakpoint(&mut self) -> Result<Option<StopEvent>> {
        let pc = self.info_registers()?.pc();
        if !self.breakpoints.contains(pc) {
            return Ok(None);
        }
        match self.step_disarmed(pc)? {
            StopEvent::Trap { .. } => Ok(None),
            event => Ok(Some(event)),
        }
    }

    /// Single steps with the breakpoint at `addr` lifted, then re-arms it if
    /// the process is still there.
    fn step_disarmed(&mut self, addr: u64) -> Result<StopEvent> {
        let bp = *self
            .breakpoints
            .get(addr)
            .ok_or(DebuggerError::NoBreakpoint(addr))?;
        // traps of neighbours in the same word stay armed
        let armed = self.breakpoints.overlay_traps(addr, bp.original_word());
        let disarmed = (armed & !0xFF) | u64::from(bp.original_byte());
        self.write_word(addr, disarmed)?;

        self.stopped_tracee()?.step()?;
        self.state = ProcessState::Running;
        let status = self.wait()?;
        let event = self.settle(status)?;

        if self.state == ProcessState::Stopped {
            self.write_word(addr, armed)?;
        }
        Ok(event)
    }

    fn teardown(&mut self) {
        if !matches!(self.state, ProcessState::Stopped | ProcessState::Running) {
            return;
        }
        if !self.attached {
            if let Err(e) = self.kill_target() {
                warn!("failed to kill target: {}", e);
            }
            return;
        }

        let Some(tracee) = self.tracee.as_mut() else {
            return;
        };
        for bp in self.breakpoints.iter() {
            if let Err(e) = tracee.poke(bp.addr(), bp.original_word()) {
                warn!(addr = bp.addr(), "failed to restore code: {}", e);
            }
        }
        match tracee.detach() {
            Ok(()) => info!(pid = tracee.pid().as_raw(), "detached from target"),
            Err(e) => warn!("failed to detach: {}", e),
        }
        self.state = ProcessState::Exited;
    }
}

impl<T: Tracee> Drop for Debugger<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}
