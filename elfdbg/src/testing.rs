//! In-memory stand-in for a traced process.

use std::{
    cell::Cell,
    collections::{HashMap, VecDeque},
};

use nix::{
    errno::Errno,
    libc::user_regs_struct,
    sys::{signal::Signal, wait::WaitStatus},
    unistd::Pid,
};

use crate::{
    error::{DebuggerError, Result},
    reg::zeroed_regs,
    tracee::Tracee,
};

pub(crate) const FAKE_PID: i32 = 4242;

/// What the fake reports on the next `wait`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FakeStop {
    /// SIGTRAP with rip moved to `pc`.
    Trap { pc: u64 },
    Signal { signal: Signal, pc: u64 },
    Exit(i32),
}

/// Memory is byte addressed, so words at neighbouring addresses overlap the
/// way they do in a real process. Unknown bytes read as zero.
pub(crate) struct FakeTracee {
    pub memory: HashMap<u64, u8>,
    pub regs: user_regs_struct,
    /// Consumed by `cont`; an empty queue makes the process exit with 0.
    pub cont_stops: VecDeque<FakeStop>,
    /// Consumed by `step`; an empty queue advances rip by one byte.
    pub step_stops: VecDeque<FakeStop>,
    pub fail_peek_at: Option<u64>,
    /// Makes every `wait` fail as if the child had vanished.
    pub fail_wait: bool,
    /// Word at rip each time `step` was requested.
    pub stepped_words: Vec<u64>,
    pub killed: bool,
    pub detached: bool,
    pending: Option<WaitStatus>,
    syscalls: Cell<usize>,
}

impl FakeTracee {
    pub fn new() -> FakeTracee {
        FakeTracee {
            memory: HashMap::new(),
            regs: zeroed_regs(),
            cont_stops: VecDeque::new(),
            step_stops: VecDeque::new(),
            fail_peek_at: None,
            fail_wait: false,
            stepped_words: Vec::new(),
            killed: false,
            detached: false,
            pending: None,
            syscalls: Cell::new(0),
        }
    }

    pub fn with_word(mut self, addr: u64, word: u64) -> FakeTracee {
        self.store(addr, word);
        self
    }

    pub fn with_pc(mut self, pc: u64) -> FakeTracee {
        self.regs.rip = pc;
        self
    }

    pub fn byte(&self, addr: u64) -> u8 {
        self.memory.get(&addr).copied().unwrap_or(0)
    }

    pub fn word(&self, addr: u64) -> u64 {
        let mut bytes = [0; 8];
        for (offset, byte) in (0..).zip(bytes.iter_mut()) {
            *byte = self.byte(addr + offset);
        }
        u64::from_le_bytes(bytes)
    }

    fn store(&mut self, addr: u64, word: u64) {
        for (offset, byte) in (0..).zip(word.to_le_bytes()) {
            self.memory.insert(addr + offset, byte);
        }
    }

    pub fn syscalls(&self) -> usize {
        self.syscalls.get()
    }

    fn count(&self) {
        self.syscalls.set(self.syscalls.get() + 1);
    }

    fn apply(&mut self, stop: FakeStop) {
        let pid = self.pid();
        let status = match stop {
            FakeStop::Trap { pc } => {
                self.regs.rip = pc;
                WaitStatus::Stopped(pid, Signal::SIGTRAP)
            }
            FakeStop::Signal { signal, pc } => {
                self.regs.rip = pc;
                WaitStatus::Stopped(pid, signal)
            }
            FakeStop::Exit(code) => WaitStatus::Exited(pid, code),
        };
        self.pending = Some(status);
    }
}

impl Tracee for FakeTracee {
    fn pid(&self) -> Pid {
        Pid::from_raw(FAKE_PID)
    }

    fn peek(&self, addr: u64) -> Result<u64> {
        self.count();
        if self.fail_peek_at == Some(addr) {
            return Err(DebuggerError::ptrace("peek")(Errno::EIO));
        }
        Ok(self.word(addr))
    }

    fn poke(&mut self, addr: u64, word: u64) -> Result<()> {
        self.count();
        self.store(addr, word);
        Ok(())
    }

    fn get_regs(&self) -> Result<user_regs_struct> {
        self.count();
        Ok(self.regs)
    }

    fn set_regs(&mut self, regs: user_regs_struct) -> Result<()> {
        self.count();
        self.regs = regs;
        Ok(())
    }

    fn cont(&mut self) -> Result<()> {
        self.count();
        let stop = self.cont_stops.pop_front().unwrap_or(FakeStop::Exit(0));
        self.apply(stop);
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        self.count();
        self.stepped_words.push(self.word(self.regs.rip));
        let next_pc = self.regs.rip + 1;
        let stop = self
            .step_stops
            .pop_front()
            .unwrap_or(FakeStop::Trap { pc: next_pc });
        self.apply(stop);
        Ok(())
    }

    fn wait(&mut self) -> Result<WaitStatus> {
        self.count();
        if self.fail_wait {
            return Err(DebuggerError::ptrace("wait")(Errno::ECHILD));
        }
        self.pending
            .take()
            .ok_or_else(|| DebuggerError::ptrace("wait")(Errno::ECHILD))
    }

    fn kill(&mut self) -> Result<()> {
        self.count();
        self.killed = true;
        self.pending = Some(WaitStatus::Signaled(self.pid(), Signal::SIGKILL, false));
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        self.count();
        self.detached = true;
        Ok(())
    }
}
