use std::{fmt, str::FromStr};

use nix::libc::user_regs_struct;

use crate::error::DebuggerError;

const REG_COUNT: usize = 18;

/// General purpose registers the debugger exposes to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    Rbp,
    Rsp,
    Rip,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Eflags,
}

impl Reg {
    pub const ALL: [Reg; REG_COUNT] = [
        Reg::Rax,
        Reg::Rbx,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rsi,
        Reg::Rdi,
        Reg::Rbp,
        Reg::Rsp,
        Reg::Rip,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
        Reg::Eflags,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Reg::Rax => "rax",
            Reg::Rbx => "rbx",
            Reg::Rcx => "rcx",
            Reg::Rdx => "rdx",
            Reg::Rsi => "rsi",
            Reg::Rdi => "rdi",
            Reg::Rbp => "rbp",
            Reg::Rsp => "rsp",
            Reg::Rip => "rip",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R10 => "r10",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R13 => "r13",
            Reg::R14 => "r14",
            Reg::R15 => "r15",
            Reg::Eflags => "eflags",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn slot(self, regs: &mut user_regs_struct) -> &mut u64 {
        match self {
            Reg::Rax => &mut regs.rax,
            Reg::Rbx => &mut regs.rbx,
            Reg::Rcx => &mut regs.rcx,
            Reg::Rdx => &mut regs.rdx,
            Reg::Rsi => &mut regs.rsi,
            Reg::Rdi => &mut regs.rdi,
            Reg::Rbp => &mut regs.rbp,
            Reg::Rsp => &mut regs.rsp,
            Reg::Rip => &mut regs.rip,
            Reg::R8 => &mut regs.r8,
            Reg::R9 => &mut regs.r9,
            Reg::R10 => &mut regs.r10,
            Reg::R11 => &mut regs.r11,
            Reg::R12 => &mut regs.r12,
            Reg::R13 => &mut regs.r13,
            Reg::R14 => &mut regs.r14,
            Reg::R15 => &mut regs.r15,
            Reg::Eflags => &mut regs.eflags,
        }
    }
}

impl FromStr for Reg {
    type Err = DebuggerError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        // "efl" is the short spelling register dumps use for eflags
        let name = match name.trim() {
            "efl" => "eflags",
            other => other,
        };
        Reg::ALL
            .into_iter()
            .find(|reg| reg.name().eq_ignore_ascii_case(name))
            .ok_or_else(|| DebuggerError::UnknownRegister(name.to_owned()))
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Full copy of the general purpose register file at one stop.
///
/// Every slot is always populated. The kernel transfers the register file as
/// a whole, so a snapshot is read in full and written back in full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterSnapshot {
    values: [u64; REG_COUNT],
}

impl RegisterSnapshot {
    pub fn from_regs(regs: &user_regs_struct) -> RegisterSnapshot {
        // slot() wants a mutable struct, the copy keeps the caller's untouched
        let mut regs = *regs;
        let mut values = [0; REG_COUNT];
        for reg in Reg::ALL {
            values[reg.index()] = *reg.slot(&mut regs);
        }
        RegisterSnapshot { values }
    }

    /// Writes every slot into `regs`. Fields the snapshot does not model
    /// (segment selectors, fs/gs base, orig_rax) are left as they are.
    pub fn apply(&self, regs: &mut user_regs_struct) {
        for reg in Reg::ALL {
            *reg.slot(regs) = self.values[reg.index()];
        }
    }

    pub fn get(&self, reg: Reg) -> u64 {
        self.values[reg.index()]
    }

    pub fn set(&mut self, reg: Reg, value: u64) {
        self.values[reg.index()] = value;
    }

    pub fn pc(&self) -> u64 {
        self.get(Reg::Rip)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Reg, u64)> + '_ {
        Reg::ALL.into_iter().map(|reg| (reg, self.get(reg)))
    }
}

#[cfg(test)]
pub(crate) fn zeroed_regs() -> user_regs_struct {
    // SAFETY: user_regs_struct is plain integers, all-zero is a valid value.
    unsafe { std::mem::zeroed() }
}
