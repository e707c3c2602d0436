use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::verdict::Verdict;

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    runs_total: AtomicU64,
    submissions_total: AtomicU64,
    compile_errors_total: AtomicU64,
    internal_errors_total: AtomicU64,
    processes_spawned_total: AtomicU64,
    accepted_total: AtomicU64,
    wrong_answer_total: AtomicU64,
    time_limit_total: AtomicU64,
    memory_limit_total: AtomicU64,
    output_limit_total: AtomicU64,
    runtime_error_total: AtomicU64,
    active_workspaces: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_started(&self) {
        self.runs_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn submission_started(&self) {
        self.submissions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn compile_failed(&self) {
        self.compile_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn internal_error(&self) {
        self.internal_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn process_spawned(&self) {
        self.processes_spawned_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn verdict(&self, verdict: &Verdict) {
        let counter = match verdict {
            Verdict::Accepted => &self.accepted_total,
            Verdict::CompileError(_) => &self.compile_errors_total,
            Verdict::WrongAnswer(_) => &self.wrong_answer_total,
            Verdict::TimeLimitExceeded(_) => &self.time_limit_total,
            Verdict::MemoryLimitExceeded(_) => &self.memory_limit_total,
            Verdict::OutputLimitExceeded(_) => &self.output_limit_total,
            Verdict::RuntimeError { .. } => &self.runtime_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workspace_allocated(&self) {
        self.active_workspaces.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workspace_released(&self) {
        let mut current = self.active_workspaces.load(Ordering::Relaxed);
        while current > 0 {
            match self.active_workspaces.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active_workspaces(&self) -> u64 {
        self.active_workspaces.load(Ordering::Relaxed)
    }

    pub fn render_prometheus(&self) -> String {
        format!(
            concat!(
                "# TYPE judge_runs_total counter\n",
                "judge_runs_total {}\n",
                "# TYPE judge_submissions_total counter\n",
                "judge_submissions_total {}\n",
                "# TYPE judge_compile_errors_total counter\n",
                "judge_compile_errors_total {}\n",
                "# TYPE judge_internal_errors_total counter\n",
                "judge_internal_errors_total {}\n",
                "# TYPE judge_processes_spawned_total counter\n",
                "judge_processes_spawned_total {}\n",
                "# TYPE judge_verdicts_total counter\n",
                "judge_verdicts_total{{verdict=\"accepted\"}} {}\n",
                "judge_verdicts_total{{verdict=\"wrong_answer\"}} {}\n",
                "judge_verdicts_total{{verdict=\"time_limit_exceeded\"}} {}\n",
                "judge_verdicts_total{{verdict=\"memory_limit_exceeded\"}} {}\n",
                "judge_verdicts_total{{verdict=\"output_limit_exceeded\"}} {}\n",
                "judge_verdicts_total{{verdict=\"runtime_error\"}} {}\n",
                "# TYPE judge_active_workspaces gauge\n",
                "judge_active_workspaces {}\n"
            ),
            self.runs_total.load(Ordering::Relaxed),
            self.submissions_total.load(Ordering::Relaxed),
            self.compile_errors_total.load(Ordering::Relaxed),
            self.internal_errors_total.load(Ordering::Relaxed),
            self.processes_spawned_total.load(Ordering::Relaxed),
            self.accepted_total.load(Ordering::Relaxed),
            self.wrong_answer_total.load(Ordering::Relaxed),
            self.time_limit_total.load(Ordering::Relaxed),
            self.memory_limit_total.load(Ordering::Relaxed),
            self.output_limit_total.load(Ordering::Relaxed),
            self.runtime_error_total.load(Ordering::Relaxed),
            self.active_workspaces.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::MetricsRegistry;
    use crate::engine::verdict::Verdict;

    #[test]
    fn active_workspaces_does_not_underflow() {
        let metrics = MetricsRegistry::new();
        metrics.workspace_released();
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("judge_active_workspaces 0"));
    }

    #[test]
    fn counts_verdicts_by_category() {
        let metrics = MetricsRegistry::new();
        metrics.verdict(&Verdict::Accepted);
        metrics.verdict(&Verdict::WrongAnswer(2));
        metrics.verdict(&Verdict::WrongAnswer(1));
        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("judge_verdicts_total{verdict=\"accepted\"} 1"));
        assert!(rendered.contains("judge_verdicts_total{verdict=\"wrong_answer\"} 2"));
    }
}
