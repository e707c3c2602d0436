use std::{env, net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use crate::engine::models::ExecutionLimits;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    pub workspace_root: PathBuf,
    pub compile_timeout: Duration,
    pub default_limits: ExecutionLimits,
    pub max_output_bytes: usize,
    /// Disk ceiling for a single run's writes. Kept well above
    /// `max_output_bytes` so long but correct output is only truncated on read.
    pub max_file_bytes: u64,
    pub max_concurrent_runs: usize,
    pub memory_enforcement: MemoryEnforcement,
    pub watchdog_poll: Duration,
    pub toolchain: ToolchainConfig,
    pub log_level: String,
}

/// Binaries and flags used to compile and launch submissions.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    pub cxx: String,
    pub cxx_flags: Vec<String>,
    pub java: String,
    pub java_heap_mb: u64,
    pub jvm_overhead_mb: u64,
    pub python: String,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("BIND_ADDR", defaults.bind_addr),
            workspace_root: env::var("WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            compile_timeout: Duration::from_secs(env_parse("COMPILE_TIMEOUT_SECS", 10u64)),
            default_limits: ExecutionLimits {
                time_limit_secs: env_parse(
                    "DEFAULT_TIME_LIMIT_SECS",
                    defaults.default_limits.time_limit_secs,
                ),
                memory_limit_mb: env_parse(
                    "DEFAULT_MEMORY_LIMIT_MB",
                    defaults.default_limits.memory_limit_mb,
                ),
            },
            max_output_bytes: env_parse("MAX_OUTPUT_BYTES", defaults.max_output_bytes),
            max_file_bytes: env_parse("MAX_FILE_BYTES", defaults.max_file_bytes),
            max_concurrent_runs: env_parse("MAX_CONCURRENT_RUNS", defaults.max_concurrent_runs),
            memory_enforcement: env_parse("MEMORY_ENFORCEMENT", defaults.memory_enforcement),
            watchdog_poll: Duration::from_millis(env_parse("WATCHDOG_POLL_MS", 20u64)),
            toolchain: ToolchainConfig {
                cxx: env::var("CXX").unwrap_or(defaults.toolchain.cxx),
                cxx_flags: env::var("CXXFLAGS")
                    .map(|raw| raw.split_whitespace().map(ToString::to_string).collect())
                    .unwrap_or(defaults.toolchain.cxx_flags),
                java: env::var("JAVA").unwrap_or(defaults.toolchain.java),
                java_heap_mb: env_parse("JAVA_HEAP_MB", defaults.toolchain.java_heap_mb),
                jvm_overhead_mb: env_parse("JVM_OVERHEAD_MB", defaults.toolchain.jvm_overhead_mb),
                python: env::var("PYTHON").unwrap_or(defaults.toolchain.python),
            },
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            workspace_root: PathBuf::from("/tmp/online_judge"),
            compile_timeout: Duration::from_secs(10),
            default_limits: ExecutionLimits {
                time_limit_secs: 5,
                memory_limit_mb: 128,
            },
            max_output_bytes: 1024 * 1024,
            max_file_bytes: 64 * 1024 * 1024,
            max_concurrent_runs: 4,
            memory_enforcement: MemoryEnforcement::Rlimit,
            watchdog_poll: Duration::from_millis(20),
            toolchain: ToolchainConfig {
                cxx: "g++".to_string(),
                cxx_flags: vec!["-O2".to_string()],
                java: "java".to_string(),
                java_heap_mb: 256,
                jvm_overhead_mb: 256,
                python: "python3".to_string(),
            },
            log_level: "info".to_string(),
        }
    }
}

/// How the memory ceiling is enforced on a child process.
///
/// `Rlimit` caps the address space before exec. `Watchdog` samples resident
/// memory from procfs and kills the process group on breach; it is the
/// fallback where an address-space limit is unusable, such as the JVM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemoryEnforcement {
    #[default]
    Rlimit,
    Watchdog,
}

impl FromStr for MemoryEnforcement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "rlimit" => Ok(Self::Rlimit),
            "watchdog" => Ok(Self::Watchdog),
            _ => Err(format!("unsupported memory enforcement: {s}")),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}
