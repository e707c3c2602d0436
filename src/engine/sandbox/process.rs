use std::{
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Stdio},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use async_trait::async_trait;
use tokio::{
    io::AsyncReadExt,
    process::{Child, Command},
    task::JoinHandle,
};

use crate::engine::{
    config::MemoryEnforcement,
    metrics::MetricsRegistry,
    sandbox::{
        ExecutionOutcome, ExitKind, ProcessRunner, RunSpec, classify,
        limits::{ChildLimits, GroupGuard, kill_group},
    },
};

/// Runs each command as a fresh process group under setrlimit ceilings, with
/// an optional RSS watchdog for runtimes that cannot live under an
/// address-space limit.
pub struct RlimitProcessRunner {
    watchdog_poll: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl RlimitProcessRunner {
    pub fn new(watchdog_poll: Duration, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            watchdog_poll,
            metrics,
        }
    }
}

#[async_trait]
impl ProcessRunner for RlimitProcessRunner {
    fn name(&self) -> &'static str {
        "rlimit"
    }

    async fn run_once(&self, spec: RunSpec) -> anyhow::Result<ExecutionOutcome> {
        let limits = spec.limits;
        let child_limits = ChildLimits {
            address_space_bytes: match limits.memory_enforcement {
                MemoryEnforcement::Rlimit => Some(limits.memory_bytes),
                MemoryEnforcement::Watchdog => None,
            },
            cpu_secs: limits.wall_time.as_secs().saturating_add(1),
            file_size_bytes: limits.max_file_bytes,
        };

        let stdin = std::fs::File::open(&spec.stdin_path)
            .with_context(|| format!("failed to open staged input {}", spec.stdin_path.display()))?;
        let stdout = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&spec.output_path)
            .with_context(|| format!("failed to open output {}", spec.output_path.display()))?;
        let stderr = stdout.try_clone().context("failed to merge stderr into output")?;

        let mut cmd = Command::new(&spec.command.program);
        cmd.args(&spec.command.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env_clear()
            .env("PATH", host_path())
            .kill_on_drop(true);
        // SAFETY: the hook only issues setpgid/setrlimit syscalls on copied values.
        unsafe {
            cmd.pre_exec(move || child_limits.apply());
        }

        let started = Instant::now();
        let mut child = SupervisedChild::spawn(cmd, &spec.command.program)?;
        self.metrics.process_spawned();

        let breached = Arc::new(AtomicBool::new(false));
        let watchdog = match limits.memory_enforcement {
            MemoryEnforcement::Watchdog => Some(spawn_watchdog(
                child.pid(),
                limits.memory_bytes,
                self.watchdog_poll,
                breached.clone(),
            )),
            MemoryEnforcement::Rlimit => None,
        };

        let waited = child.wait(limits.wall_time).await;
        if let Some(handle) = watchdog {
            handle.abort();
        }
        // The leader is gone; take down anything it left running in its group.
        child.kill();
        let waited = waited?;

        let duration_ms = started.elapsed().as_millis();
        let written = tokio::fs::metadata(&spec.output_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        let file = tokio::fs::File::open(&spec.output_path)
            .await
            .context("failed to read captured output")?;
        let raw = read_limited(file, limits.max_output_bytes as usize).await;
        let output = String::from_utf8_lossy(&raw).to_string();

        let termination = classify(
            waited.deadline_exceeded,
            breached.load(Ordering::SeqCst),
            written >= limits.max_file_bytes,
            exit_kind(waited.status),
            &output,
        );
        tracing::debug!(
            command = %spec.command,
            duration_ms = duration_ms as u64,
            termination = ?termination,
            "process finished"
        );

        Ok(ExecutionOutcome {
            output,
            termination,
            duration_ms,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) struct WaitOutcome {
    pub status: ExitStatus,
    pub deadline_exceeded: bool,
}

/// A spawned child that leads its own process group. Waiting is bounded by a
/// deadline, and killing always targets the whole group, including when the
/// supervisor is dropped before the child finished.
pub(super) struct SupervisedChild {
    child: Child,
    pid: u32,
}

impl SupervisedChild {
    pub(super) fn spawn(mut cmd: Command, program: &str) -> anyhow::Result<Self> {
        let child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {program}"))?;
        let pid = child.id().context("spawned child has no pid")?;
        Ok(Self { child, pid })
    }

    pub(super) fn pid(&self) -> u32 {
        self.pid
    }

    pub(super) async fn wait(&mut self, deadline: Duration) -> anyhow::Result<WaitOutcome> {
        match tokio::time::timeout(deadline, self.child.wait()).await {
            Ok(status) => Ok(WaitOutcome {
                status: status.context("failed to wait for child")?,
                deadline_exceeded: false,
            }),
            Err(_) => {
                self.kill();
                let status = self
                    .child
                    .wait()
                    .await
                    .context("failed to reap child after deadline")?;
                Ok(WaitOutcome {
                    status,
                    deadline_exceeded: true,
                })
            }
        }
    }

    pub(super) fn kill(&mut self) {
        kill_group(self.pid);
        let _ = self.child.start_kill();
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        kill_group(self.pid);
    }
}

fn spawn_watchdog(
    pid: u32,
    limit_bytes: u64,
    poll: Duration,
    breached: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            let Some(rss) = resident_bytes(pid).await else {
                break;
            };
            if rss > limit_bytes {
                tracing::debug!(pid, rss, limit_bytes, "memory watchdog tripped");
                breached.store(true, Ordering::SeqCst);
                kill_group(pid);
                break;
            }
        }
    })
}

async fn resident_bytes(pid: u32) -> Option<u64> {
    let status = tokio::fs::read_to_string(format!("/proc/{pid}/status"))
        .await
        .ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse::<u64>()
        .ok()?;
    Some(kib * 1024)
}

fn exit_kind(status: ExitStatus) -> ExitKind {
    match (status.code(), status.signal()) {
        (Some(code), _) => ExitKind::Code(code),
        (None, Some(signal)) => ExitKind::Signal(signal),
        (None, None) => ExitKind::Code(-1),
    }
}

fn host_path() -> String {
    std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/usr/bin:/bin".to_string())
}

async fn read_limited<R>(mut reader: R, limit: usize) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut out = Vec::with_capacity(limit.min(8192));
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if out.len() < limit {
                    let remaining = limit - out.len();
                    out.extend_from_slice(&chunk[..remaining.min(n)]);
                } else {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    out
}

pub(super) async fn compile_with_deadline(
    mut cmd: Command,
    program: &str,
    deadline: Duration,
) -> anyhow::Result<Option<std::process::Output>> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: setpgid only.
    unsafe {
        cmd.pre_exec(super::limits::own_process_group);
    }
    let child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn compiler {program}"))?;
    // Dropping the wait future kills only the compiler driver; its helpers
    // (cc1plus, as, ld) share the group and go down with the guard.
    let _group = child.id().map(GroupGuard::new);

    match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(output) => Ok(Some(output.context("failed to collect compiler output")?)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc, time::Duration};

    use super::{RlimitProcessRunner, compile_with_deadline, parse_vm_rss};
    use crate::engine::{
        config::MemoryEnforcement,
        metrics::MetricsRegistry,
        sandbox::{CommandSpec, ExitKind, ProcessRunner, ResourceLimits, RunSpec, Termination},
    };

    fn runner() -> RlimitProcessRunner {
        RlimitProcessRunner::new(
            Duration::from_millis(10),
            Arc::new(MetricsRegistry::new()),
        )
    }

    fn spec(dir: &Path, command: CommandSpec, input: &str, wall_secs: u64) -> RunSpec {
        std::fs::write(dir.join("input.txt"), input).unwrap();
        RunSpec {
            command,
            working_dir: dir.to_path_buf(),
            stdin_path: dir.join("input.txt"),
            output_path: dir.join("output.txt"),
            limits: ResourceLimits {
                wall_time: Duration::from_secs(wall_secs),
                memory_bytes: 128 * 1024 * 1024,
                max_output_bytes: 64 * 1024,
                max_file_bytes: 1024 * 1024,
                memory_enforcement: MemoryEnforcement::Rlimit,
            },
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("/bin/sh").arg("-c").arg(script)
    }

    fn has_python() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn merges_stdout_and_stderr_and_feeds_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(
            tmp.path(),
            sh("read line; echo \"got $line\"; echo oops 1>&2"),
            "hello\n",
            5,
        );

        let outcome = runner().run_once(spec).await.unwrap();
        assert_eq!(outcome.termination, Termination::Normal);
        assert!(outcome.output.contains("got hello"));
        assert!(outcome.output.contains("oops"));
    }

    #[tokio::test]
    async fn sleeping_past_the_deadline_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path(), sh("sleep 10"), "", 1);

        let started = std::time::Instant::now();
        let outcome = runner().run_once(spec).await.unwrap();
        assert_eq!(outcome.termination, Termination::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_runtime_error() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path(), sh("echo boom; exit 3"), "", 5);

        let outcome = runner().run_once(spec).await.unwrap();
        assert_eq!(
            outcome.termination,
            Termination::RuntimeError {
                exit: ExitKind::Code(3)
            }
        );
        assert_eq!(outcome.runtime_detail().trim(), "boom");
    }

    #[tokio::test]
    async fn background_children_do_not_outlive_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path(), sh("(sleep 1; touch escaped) & exit 0"), "", 5);

        let outcome = runner().run_once(spec).await.unwrap();
        assert_eq!(outcome.termination, Termination::Normal);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!tmp.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn abandoned_run_takes_its_process_group_down() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(
            tmp.path(),
            sh("(sleep 1; touch escaped) & sleep 10"),
            "",
            30,
        );

        let abandoned =
            tokio::time::timeout(Duration::from_millis(300), runner().run_once(spec)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!tmp.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn abandoned_compile_takes_its_process_group_down() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cmd = tokio::process::Command::new("/bin/sh");
        cmd.arg("-c")
            .arg("(sleep 1; touch escaped) & sleep 10")
            .current_dir(tmp.path());

        let abandoned = tokio::time::timeout(
            Duration::from_millis(300),
            compile_with_deadline(cmd, "/bin/sh", Duration::from_secs(30)),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(1800)).await;
        assert!(!tmp.path().join("escaped").exists());
    }

    #[tokio::test]
    async fn long_output_is_truncated_on_read_but_still_normal() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = spec(
            tmp.path(),
            sh("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done"),
            "",
            5,
        );
        spec.limits.max_output_bytes = 1024;

        let outcome = runner().run_once(spec).await.unwrap();
        assert_eq!(outcome.termination, Termination::Normal);
        assert_eq!(outcome.output.len(), 1024);
    }

    #[tokio::test]
    async fn writing_past_the_disk_ceiling_is_an_output_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = spec(
            tmp.path(),
            sh("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done"),
            "",
            5,
        );
        spec.limits.max_output_bytes = 1024;
        spec.limits.max_file_bytes = 4096;

        let outcome = runner().run_once(spec).await.unwrap();
        assert_eq!(outcome.termination, Termination::OutputLimitExceeded);
        assert!(outcome.output.len() <= 1024);
    }

    #[tokio::test]
    async fn missing_program_is_an_error_not_an_outcome() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(tmp.path(), CommandSpec::new("/nonexistent/judge-bin"), "", 1);
        assert!(runner().run_once(spec).await.is_err());
    }

    #[tokio::test]
    async fn allocation_beyond_rlimit_is_memory_exceeded() {
        if !has_python() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let spec = spec(
            tmp.path(),
            CommandSpec::new("python3")
                .arg("-c")
                .arg("x = b'a' * (1024 * 1024 * 1024)"),
            "",
            5,
        );

        let outcome = runner().run_once(spec).await.unwrap();
        assert_eq!(outcome.termination, Termination::MemoryExceeded);
    }

    #[tokio::test]
    async fn watchdog_kills_on_resident_memory_breach() {
        if !has_python() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let mut spec = spec(
            tmp.path(),
            CommandSpec::new("python3")
                .arg("-c")
                .arg("import time\nx = b'a' * (300 * 1024 * 1024)\ntime.sleep(5)"),
            "",
            5,
        );
        spec.limits.memory_enforcement = MemoryEnforcement::Watchdog;
        spec.limits.memory_bytes = 64 * 1024 * 1024;

        let outcome = runner().run_once(spec).await.unwrap();
        assert_eq!(outcome.termination, Termination::MemoryExceeded);
    }

    #[test]
    fn parses_resident_set_from_proc_status() {
        let status = "Name:\tpython3\nVmPeak:\t  20000 kB\nVmRSS:\t   1500 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(1500 * 1024));
        assert_eq!(parse_vm_rss("Name:\tzombie\n"), None);
    }
}
