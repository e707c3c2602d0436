use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use uuid::Uuid;

use crate::engine::metrics::MetricsRegistry;

const INPUT_FILE: &str = "input.txt";
const OUTPUT_FILE: &str = "output.txt";

/// Hands out one private directory per run under a shared root.
#[derive(Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    metrics: Arc<MetricsRegistry>,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf, metrics: Arc<MetricsRegistry>) -> Self {
        Self { root, metrics }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn allocate(&self, run_id: Uuid) -> anyhow::Result<Workspace> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create workspace root {}", self.root.display()))?;

        let dir = self.root.join(run_id.as_simple().to_string());
        // create_dir (not create_dir_all) so a reused run id is an error.
        tokio::fs::create_dir(&dir)
            .await
            .with_context(|| format!("failed to create workspace {}", dir.display()))?;

        self.metrics.workspace_allocated();
        tracing::debug!(run_id = %run_id, dir = %dir.display(), "workspace allocated");

        Ok(Workspace {
            run_id,
            dir,
            metrics: self.metrics.clone(),
            released: false,
        })
    }

    /// Removes run directories left behind by a process that died mid-run.
    /// Only call this before any run is in flight.
    pub async fn purge_stale(&self) -> anyhow::Result<usize> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err).context("failed to scan workspace root"),
        };

        let mut purged = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let is_run_dir = name
                .to_str()
                .map(|n| Uuid::try_parse(n).is_ok())
                .unwrap_or(false);
            if !is_run_dir {
                continue;
            }
            match tokio::fs::remove_dir_all(entry.path()).await {
                Ok(()) => purged += 1,
                Err(err) => {
                    tracing::warn!(path = %entry.path().display(), error = %err, "failed to purge stale workspace")
                }
            }
        }
        Ok(purged)
    }
}

/// Filesystem locations backing a single run.
///
/// Teardown happens exactly once: either through an explicit [`Workspace::release`]
/// or when the value is dropped, whichever comes first.
#[derive(Debug)]
pub struct Workspace {
    run_id: Uuid,
    dir: PathBuf,
    metrics: Arc<MetricsRegistry>,
    released: bool,
}

impl Workspace {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input_path(&self) -> PathBuf {
        self.dir.join(INPUT_FILE)
    }

    pub fn output_path(&self) -> PathBuf {
        self.dir.join(OUTPUT_FILE)
    }

    pub async fn write_source(&self, path: &Path, code: &str) -> anyhow::Result<()> {
        tokio::fs::write(path, code.as_bytes())
            .await
            .with_context(|| format!("failed to write source {}", path.display()))
    }

    /// Writes the next stdin payload and truncates the output file from any
    /// previous execution.
    pub async fn stage_input(&self, input: &str) -> anyhow::Result<()> {
        tokio::fs::write(self.input_path(), input.as_bytes())
            .await
            .context("failed to stage input")?;
        tokio::fs::write(self.output_path(), b"")
            .await
            .context("failed to reset output file")?;
        Ok(())
    }

    pub async fn release(&mut self) {
        if self.released {
            return;
        }
        // Marked only once removal finished, so a release abandoned mid-await
        // still leaves the work to `Drop`.
        let removed = tokio::fs::remove_dir_all(&self.dir).await;
        self.mark_released();
        self.log_removal(removed);
    }

    /// Returns false when teardown already happened.
    fn mark_released(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        self.metrics.workspace_released();
        true
    }

    fn log_removal(&self, removed: std::io::Result<()>) {
        match removed {
            Ok(()) => tracing::debug!(run_id = %self.run_id, "workspace released"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                run_id = %self.run_id,
                dir = %self.dir.display(),
                error = %err,
                "failed to remove workspace"
            ),
        }
    }
}

impl Drop for Workspace {
    // A no-op after an explicit release; otherwise the run was abandoned.
    fn drop(&mut self) {
        if self.mark_released() {
            let removed = std::fs::remove_dir_all(&self.dir);
            self.log_removal(removed);
        }
    }
}
