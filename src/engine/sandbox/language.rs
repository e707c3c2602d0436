use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use thiserror::Error;
use tokio::process::Command;

use crate::engine::{
    config::{MemoryEnforcement, ToolchainConfig},
    models::{Language, LanguageKind},
    sandbox::{CommandSpec, process::compile_with_deadline},
    workspace::Workspace,
};

#[derive(Debug, Clone)]
pub struct LanguageSpec {
    pub source_name: &'static str,
    pub artifact_name: Option<&'static str>,
}

impl LanguageSpec {
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Cpp => Self {
                source_name: "main.cpp",
                artifact_name: Some("main.out"),
            },
            // The single-file source launcher compiles in memory, so the
            // source itself is the artifact.
            Language::Java => Self {
                source_name: "Main.java",
                artifact_name: None,
            },
            Language::Python => Self {
                source_name: "main.py",
                artifact_name: None,
            },
        }
    }

    pub fn source_path(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(self.source_name)
    }
}

/// Runnable form of a submission. Shared read-only across test cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub language: Language,
    pub path: PathBuf,
}

#[derive(Debug, Error)]
pub enum CompileError {
    /// The compiler ran and rejected the source; carries its diagnostics.
    #[error("{0}")]
    Rejected(String),
    #[error("Timeout")]
    Timeout,
    /// The compiler could not be run at all. Not the submitter's fault.
    #[error("toolchain failure: {0:#}")]
    Toolchain(#[from] anyhow::Error),
}

pub struct LanguageAdapter {
    toolchain: ToolchainConfig,
    compile_timeout: Duration,
}

impl LanguageAdapter {
    pub fn new(toolchain: ToolchainConfig, compile_timeout: Duration) -> Self {
        Self {
            toolchain,
            compile_timeout,
        }
    }

    /// Expects the source to already be written at
    /// `LanguageSpec::source_path(workspace.dir())`.
    pub async fn compile(
        &self,
        language: Language,
        workspace: &Workspace,
    ) -> Result<Artifact, CompileError> {
        let spec = LanguageSpec::for_language(language);
        let source_path = spec.source_path(workspace.dir());

        let Some(artifact_name) = spec.artifact_name else {
            return Ok(Artifact {
                language,
                path: source_path,
            });
        };
        let artifact_path = workspace.dir().join(artifact_name);

        let mut cmd = Command::new(&self.toolchain.cxx);
        cmd.args(&self.toolchain.cxx_flags)
            .arg(&source_path)
            .arg("-o")
            .arg(&artifact_path)
            .current_dir(workspace.dir());

        let output = compile_with_deadline(cmd, &self.toolchain.cxx, self.compile_timeout)
            .await?
            .ok_or(CompileError::Timeout)?;

        if !output.status.success() {
            let mut diagnostics = String::from_utf8_lossy(&output.stderr).to_string();
            if diagnostics.trim().is_empty() {
                diagnostics = String::from_utf8_lossy(&output.stdout).to_string();
            }
            return Err(CompileError::Rejected(diagnostics));
        }

        Ok(Artifact {
            language,
            path: artifact_path,
        })
    }

    pub fn build_run_command(&self, artifact: &Artifact) -> CommandSpec {
        let path = artifact.path.to_string_lossy().into_owned();
        match artifact.language.kind() {
            LanguageKind::Native => CommandSpec::new(path),
            LanguageKind::Managed => CommandSpec::new(&self.toolchain.java)
                .arg(format!("-Xmx{}m", self.toolchain.java_heap_mb))
                .arg(path),
            LanguageKind::Interpreted => CommandSpec::new(&self.toolchain.python).arg(path),
        }
    }

    /// Memory enforcement mode and ceiling in bytes for one execution.
    ///
    /// The JVM reserves far more virtual memory than it touches, so it is
    /// always watched by resident size, with headroom for the runtime itself.
    ///
    /// The Java heap is fixed at `JAVA_HEAP_MB` by [`Self::build_run_command`]
    /// and does not follow the requested limit. A program that outgrows that
    /// heap gets `OutOfMemoryError`, reported as Memory Limit Exceeded, even
    /// when the requested memory limit is larger.
    pub fn memory_ceiling(
        &self,
        language: Language,
        memory_limit_mb: u64,
        configured: MemoryEnforcement,
    ) -> (MemoryEnforcement, u64) {
        match language.kind() {
            LanguageKind::Managed => (
                MemoryEnforcement::Watchdog,
                mib(memory_limit_mb + self.toolchain.jvm_overhead_mb),
            ),
            _ => (configured, mib(memory_limit_mb)),
        }
    }
}

fn mib(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use uuid::Uuid;

    use super::{CompileError, LanguageAdapter, LanguageSpec};
    use crate::engine::{
        config::{EngineConfig, MemoryEnforcement},
        metrics::MetricsRegistry,
        models::Language,
        workspace::{Workspace, WorkspaceManager},
    };

    fn adapter_with_cxx(flags: &[&str], timeout: Duration) -> LanguageAdapter {
        let mut toolchain = EngineConfig::default().toolchain;
        toolchain.cxx = "/bin/sh".to_string();
        toolchain.cxx_flags = flags.iter().map(|f| f.to_string()).collect();
        LanguageAdapter::new(toolchain, timeout)
    }

    async fn workspace(root: &std::path::Path, language: Language) -> Workspace {
        let manager = WorkspaceManager::new(root.to_path_buf(), Arc::new(MetricsRegistry::new()));
        let ws = manager.allocate(Uuid::new_v4()).await.unwrap();
        let source = LanguageSpec::for_language(language).source_path(ws.dir());
        ws.write_source(&source, "int main() {}").await.unwrap();
        ws
    }

    #[tokio::test]
    async fn interpreted_sources_are_their_own_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path(), Language::Python).await;
        let adapter = LanguageAdapter::new(EngineConfig::default().toolchain, Duration::from_secs(1));

        let artifact = adapter.compile(Language::Python, &ws).await.unwrap();
        assert_eq!(artifact.path, ws.dir().join("main.py"));

        let command = adapter.build_run_command(&artifact);
        assert_eq!(command.program, "python3");
        assert_eq!(command.args, vec![artifact.path.to_string_lossy().into_owned()]);
    }

    #[tokio::test]
    async fn java_runs_with_a_fixed_heap_ceiling() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path(), Language::Java).await;
        let adapter = LanguageAdapter::new(EngineConfig::default().toolchain, Duration::from_secs(1));

        let artifact = adapter.compile(Language::Java, &ws).await.unwrap();
        let command = adapter.build_run_command(&artifact);
        assert_eq!(command.program, "java");
        assert_eq!(command.args[0], "-Xmx256m");
        assert!(command.args[1].ends_with("Main.java"));
    }

    #[tokio::test]
    async fn successful_native_compile_yields_a_binary_artifact() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path(), Language::Cpp).await;
        let adapter = adapter_with_cxx(&["-c", "touch \"$3\"", "sh"], Duration::from_secs(5));

        let artifact = adapter.compile(Language::Cpp, &ws).await.unwrap();
        assert_eq!(artifact.path, ws.dir().join("main.out"));
        assert!(artifact.path.exists());
        assert_eq!(
            adapter.build_run_command(&artifact).program,
            artifact.path.to_string_lossy()
        );
    }

    #[tokio::test]
    async fn compiler_rejection_carries_diagnostics() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path(), Language::Cpp).await;
        let adapter = adapter_with_cxx(
            &["-c", "echo \"main.cpp:1:1: error: expected ';'\" >&2; exit 1", "sh"],
            Duration::from_secs(5),
        );

        match adapter.compile(Language::Cpp, &ws).await {
            Err(CompileError::Rejected(detail)) => assert!(detail.contains("expected ';'")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_compiler_is_a_compile_timeout() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path(), Language::Cpp).await;
        let adapter = adapter_with_cxx(&["-c", "sleep 10", "sh"], Duration::from_secs(1));

        let started = std::time::Instant::now();
        let err = adapter.compile(Language::Cpp, &ws).await.unwrap_err();
        assert!(matches!(err, CompileError::Timeout));
        assert_eq!(err.to_string(), "Timeout");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn missing_compiler_is_a_toolchain_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = workspace(tmp.path(), Language::Cpp).await;
        let mut toolchain = EngineConfig::default().toolchain;
        toolchain.cxx = "/nonexistent/g++".to_string();
        let adapter = LanguageAdapter::new(toolchain, Duration::from_secs(1));

        let err = adapter.compile(Language::Cpp, &ws).await.unwrap_err();
        assert!(matches!(err, CompileError::Toolchain(_)));
    }

    #[test]
    fn jvm_is_always_watched_with_headroom() {
        let adapter = LanguageAdapter::new(EngineConfig::default().toolchain, Duration::from_secs(1));
        assert_eq!(
            adapter.memory_ceiling(Language::Java, 128, MemoryEnforcement::Rlimit),
            (MemoryEnforcement::Watchdog, 384 * 1024 * 1024)
        );
        assert_eq!(
            adapter.memory_ceiling(Language::Cpp, 128, MemoryEnforcement::Rlimit),
            (MemoryEnforcement::Rlimit, 128 * 1024 * 1024)
        );
    }
}
