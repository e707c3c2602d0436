mod language;
mod limits;
mod process;

use std::{
    fmt,
    path::PathBuf,
    time::Duration,
};

use async_trait::async_trait;

use crate::engine::config::MemoryEnforcement;

pub use language::{Artifact, CompileError, LanguageAdapter, LanguageSpec};
pub use process::RlimitProcessRunner;

/// Substrings a runtime prints when an allocation fails under the ceiling.
const MEMORY_MARKERS: &[&str] = &[
    "MemoryError",
    "std::bad_alloc",
    "java.lang.OutOfMemoryError",
    "Cannot allocate memory",
];

const SIGKILL: i32 = 9;
const SIGXCPU: i32 = 24;
const SIGXFSZ: i32 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub wall_time: Duration,
    pub memory_bytes: u64,
    /// How much captured output is read back.
    pub max_output_bytes: u64,
    /// Kernel ceiling on bytes the child may write to any file.
    pub max_file_bytes: u64,
    pub memory_enforcement: MemoryEnforcement,
}

#[derive(Debug, Clone)]
pub struct RunSpec {
    pub command: CommandSpec,
    pub working_dir: PathBuf,
    pub stdin_path: PathBuf,
    pub output_path: PathBuf,
    pub limits: ResourceLimits,
}

/// How a child process ended, before any memory/timeout interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Code(code) => write!(f, "exit code {code}"),
            ExitKind::Signal(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Normal,
    TimedOut,
    MemoryExceeded,
    OutputLimitExceeded,
    RuntimeError { exit: ExitKind },
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// Merged stdout and stderr.
    pub output: String,
    pub termination: Termination,
    pub duration_ms: u128,
}

impl ExecutionOutcome {
    /// Text a grader sees for a crashed program: its own output, or the exit
    /// cause when it printed nothing.
    pub fn runtime_detail(&self) -> String {
        match &self.termination {
            Termination::RuntimeError { exit } if self.output.trim().is_empty() => {
                exit.to_string()
            }
            _ => self.output.clone(),
        }
    }
}

/// Prioritised termination heuristic.
///
/// Exit codes and signals do not reliably say "out of memory", so a SIGKILL
/// we did not send, the shell convention 137, or an allocator message in the
/// output all count as a memory kill. Timeouts always win because the runner
/// itself sends SIGKILL on the deadline; SIGXCPU from the CPU-time rlimit is
/// a timeout too. Output comes next: a file that reached the disk ceiling, or
/// SIGXFSZ, means the program was cut off mid-write.
pub fn classify(
    timed_out: bool,
    memory_breached: bool,
    output_overflowed: bool,
    exit: ExitKind,
    output: &str,
) -> Termination {
    if timed_out || exit == ExitKind::Signal(SIGXCPU) {
        return Termination::TimedOut;
    }
    if memory_breached {
        return Termination::MemoryExceeded;
    }
    if output_overflowed || exit == ExitKind::Signal(SIGXFSZ) {
        return Termination::OutputLimitExceeded;
    }
    match exit {
        ExitKind::Code(0) => Termination::Normal,
        ExitKind::Signal(SIGKILL) | ExitKind::Code(137) => Termination::MemoryExceeded,
        _ if MEMORY_MARKERS.iter().any(|marker| output.contains(marker)) => {
            Termination::MemoryExceeded
        }
        exit => Termination::RuntimeError { exit },
    }
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    fn name(&self) -> &'static str;
    async fn run_once(&self, spec: RunSpec) -> anyhow::Result<ExecutionOutcome>;
}
