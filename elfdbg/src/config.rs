/// Resource limits for one debugging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebuggerConfig {
    /// Maximum number of software breakpoints alive at once.
    pub max_breakpoints: usize,
    /// Maximum number of bytes a single operator memory read may return.
    pub max_read_len: usize,
}

pub const DEFAULT_MAX_BREAKPOINTS: usize = 100;
pub const DEFAULT_MAX_READ_WORDS: usize = 8;

impl Default for DebuggerConfig {
    fn default() -> Self {
        DebuggerConfig {
            max_breakpoints: DEFAULT_MAX_BREAKPOINTS,
            max_read_len: DEFAULT_MAX_READ_WORDS * crate::memory::WORD_SIZE,
        }
    }
}
