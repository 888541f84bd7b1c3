use elfdbg::DebuggerConfig;

#[derive(clap::Parser)]
#[command(name = "elfdbg", about = "Interactive debugger for x86-64 ELF executables")]
pub struct Args {
    #[command(subcommand)]
    pub commands: Commands,

    #[command(flatten)]
    pub options: Options,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    #[command(about = "run program in child process")]
    Run {
        /// Executable file to run
        #[arg(value_name = "FILE")]
        program_path: String,
    },
    #[command(about = "attach to process")]
    Attach {
        /// Executable file the process was started from
        #[arg(value_name = "FILE")]
        program_path: String,

        /// Pid of process to attach
        #[arg(value_name = "PID")]
        pid: i32,
    },
}

#[derive(clap::Args)]
pub struct Options {
    /// Maximum number of breakpoints alive at once
    #[arg(long, global = true, value_name = "N")]
    pub max_breakpoints: Option<usize>,

    /// Maximum number of bytes a single `x` command may read
    #[arg(long, global = true, value_name = "BYTES")]
    pub max_read_len: Option<usize>,

    /// Log filter, takes precedence over RUST_LOG
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl Commands {
    pub fn program_path(&self) -> &str {
        match self {
            Commands::Run { program_path } | Commands::Attach { program_path, .. } => program_path,
        }
    }
}

impl Options {
    pub fn config(&self) -> DebuggerConfig {
        let defaults = DebuggerConfig::default();
        DebuggerConfig {
            max_breakpoints: self.max_breakpoints.unwrap_or(defaults.max_breakpoints),
            max_read_len: self.max_read_len.unwrap_or(defaults.max_read_len),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn run_uses_default_limits() {
        let args = Args::try_parse_from(["elfdbg", "run", "./target"]).unwrap();
        assert_eq!(args.commands.program_path(), "./target");
        assert_eq!(args.options.config(), DebuggerConfig::default());
    }

    #[test]
    fn flags_override_limits() {
        let args = Args::try_parse_from([
            "elfdbg",
            "attach",
            "./target",
            "1234",
            "--max-breakpoints",
            "3",
            "--max-read-len",
            "16",
        ])
        .unwrap();
        assert!(matches!(args.commands, Commands::Attach { pid: 1234, .. }));
        let config = args.options.config();
        assert_eq!(config.max_breakpoints, 3);
        assert_eq!(config.max_read_len, 16);
    }

    #[test]
    fn missing_program_is_rejected() {
        assert!(Args::try_parse_from(["elfdbg", "run"]).is_err());
    }
}
