use std::sync::Arc;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::engine::{
    config::{EngineConfig, MemoryEnforcement},
    error::EngineError,
    metrics::MetricsRegistry,
    models::{ExecutionLimits, Language, TestCase},
    sandbox::{
        Artifact, CompileError, LanguageAdapter, LanguageSpec, ProcessRunner, ResourceLimits,
        RunSpec, Termination,
    },
    verdict::Verdict,
    workspace::{Workspace, WorkspaceManager},
};

/// Drives ad-hoc runs and graded submissions.
///
/// Every entry point allocates one workspace and releases it exactly once on
/// the way out, whatever happened in between.
pub struct Judge {
    workspaces: WorkspaceManager,
    adapter: LanguageAdapter,
    runner: Arc<dyn ProcessRunner>,
    metrics: Arc<MetricsRegistry>,
    permits: Semaphore,
    default_limits: ExecutionLimits,
    memory_enforcement: MemoryEnforcement,
    max_output_bytes: u64,
    max_file_bytes: u64,
}

impl Judge {
    pub fn new(
        config: &EngineConfig,
        runner: Arc<dyn ProcessRunner>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            workspaces: WorkspaceManager::new(config.workspace_root.clone(), metrics.clone()),
            adapter: LanguageAdapter::new(config.toolchain.clone(), config.compile_timeout),
            runner,
            metrics,
            permits: Semaphore::new(config.max_concurrent_runs.max(1)),
            default_limits: config.default_limits,
            memory_enforcement: config.memory_enforcement,
            max_output_bytes: config.max_output_bytes as u64,
            max_file_bytes: config.max_file_bytes.max(config.max_output_bytes as u64),
        }
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Fills in defaults for omitted limits and clamps into safe bounds.
    pub fn limits(&self, time_limit: Option<u64>, memory_limit: Option<u64>) -> ExecutionLimits {
        ExecutionLimits {
            time_limit_secs: time_limit.unwrap_or(self.default_limits.time_limit_secs),
            memory_limit_mb: memory_limit.unwrap_or(self.default_limits.memory_limit_mb),
        }
        .normalized()
    }

    /// Ad-hoc run: returns the program's output, or a human-readable label
    /// when it failed to compile or run.
    pub async fn run(
        &self,
        language: &str,
        code: &str,
        input: &str,
        limits: ExecutionLimits,
    ) -> Result<String, EngineError> {
        let language: Language = language.parse()?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Internal("judge is shutting down".to_string()))?;
        self.metrics.run_started();

        let run_id = Uuid::new_v4();
        tracing::info!(run_id = %run_id, language = %language, "run started");

        let mut workspace = self.workspaces.allocate(run_id).await.inspect_err(|_| {
            self.metrics.internal_error();
        })?;
        let result = self
            .execute_run(&workspace, language, code, input, limits)
            .await;
        workspace.release().await;

        if let Err(err) = &result {
            self.metrics.internal_error();
            tracing::error!(run_id = %run_id, error = %err, "run failed internally");
        }
        result
    }

    async fn execute_run(
        &self,
        workspace: &Workspace,
        language: Language,
        code: &str,
        input: &str,
        limits: ExecutionLimits,
    ) -> Result<String, EngineError> {
        let artifact = match self.prepare(workspace, language, code).await? {
            Ok(artifact) => artifact,
            Err(detail) => {
                self.metrics.compile_failed();
                return Ok(format!("Compilation Error: {detail}"));
            }
        };

        workspace.stage_input(input).await?;
        let outcome = self
            .runner
            .run_once(self.run_spec(workspace, &artifact, limits))
            .await?;

        tracing::info!(
            run_id = %workspace.run_id(),
            termination = ?outcome.termination,
            elapsed_ms = outcome.duration_ms as u64,
            "run finished"
        );

        Ok(match outcome.termination {
            Termination::Normal => outcome.output,
            Termination::TimedOut => "Time Limit Exceeded".to_string(),
            Termination::MemoryExceeded => "Memory Limit Exceeded".to_string(),
            Termination::OutputLimitExceeded => "Output Limit Exceeded".to_string(),
            Termination::RuntimeError { .. } => {
                format!("RunTime Error: {}", outcome.runtime_detail())
            }
        })
    }

    /// Graded run: compiles once, then executes test cases in order and stops
    /// at the first one that fails.
    pub async fn submit(
        &self,
        language: &str,
        code: &str,
        test_cases: &[TestCase],
        limits: ExecutionLimits,
    ) -> Result<Verdict, EngineError> {
        let language: Language = language.parse()?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| EngineError::Internal("judge is shutting down".to_string()))?;
        self.metrics.submission_started();

        let run_id = Uuid::new_v4();
        tracing::info!(
            run_id = %run_id,
            language = %language,
            test_cases = test_cases.len(),
            "submission started"
        );

        let mut workspace = self.workspaces.allocate(run_id).await.inspect_err(|_| {
            self.metrics.internal_error();
        })?;
        let result = self
            .execute_submission(&workspace, language, code, test_cases, limits)
            .await;
        workspace.release().await;

        match &result {
            Ok(verdict) => {
                self.metrics.verdict(verdict);
                tracing::info!(run_id = %run_id, verdict = %verdict, "submission judged");
            }
            Err(err) => {
                self.metrics.internal_error();
                tracing::error!(run_id = %run_id, error = %err, "submission failed internally");
            }
        }
        result
    }

    async fn execute_submission(
        &self,
        workspace: &Workspace,
        language: Language,
        code: &str,
        test_cases: &[TestCase],
        limits: ExecutionLimits,
    ) -> Result<Verdict, EngineError> {
        let artifact = match self.prepare(workspace, language, code).await? {
            Ok(artifact) => artifact,
            Err(detail) => return Ok(Verdict::CompileError(detail)),
        };

        for (offset, case) in test_cases.iter().enumerate() {
            let index = offset + 1;
            workspace.stage_input(&case.input).await?;
            let outcome = self
                .runner
                .run_once(self.run_spec(workspace, &artifact, limits))
                .await?;

            tracing::debug!(
                run_id = %workspace.run_id(),
                test_case = index,
                termination = ?outcome.termination,
                elapsed_ms = outcome.duration_ms as u64,
                "test case executed"
            );

            if let Some(verdict) = Verdict::evaluate(index, &outcome, &case.output) {
                return Ok(verdict);
            }
        }

        Ok(Verdict::Accepted)
    }

    /// Writes the source and compiles it. The inner `Err` is a compile error
    /// to report to the user; the outer one is an internal fault.
    async fn prepare(
        &self,
        workspace: &Workspace,
        language: Language,
        code: &str,
    ) -> Result<Result<Artifact, String>, EngineError> {
        let source_path = LanguageSpec::for_language(language).source_path(workspace.dir());
        workspace.write_source(&source_path, code).await?;

        match self.adapter.compile(language, workspace).await {
            Ok(artifact) => Ok(Ok(artifact)),
            Err(CompileError::Toolchain(err)) => Err(err.into()),
            Err(err) => {
                tracing::info!(run_id = %workspace.run_id(), "compilation failed");
                Ok(Err(err.to_string()))
            }
        }
    }

    fn run_spec(&self, workspace: &Workspace, artifact: &Artifact, limits: ExecutionLimits) -> RunSpec {
        let (memory_enforcement, memory_bytes) = self.adapter.memory_ceiling(
            artifact.language,
            limits.memory_limit_mb,
            self.memory_enforcement,
        );
        RunSpec {
            command: self.adapter.build_run_command(artifact),
            working_dir: workspace.dir().to_path_buf(),
            stdin_path: workspace.input_path(),
            output_path: workspace.output_path(),
            limits: ResourceLimits {
                wall_time: std::time::Duration::from_secs(limits.time_limit_secs),
                memory_bytes,
                max_output_bytes: self.max_output_bytes,
                max_file_bytes: self.max_file_bytes,
                memory_enforcement,
            },
        }
    }
}
