use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Root of the durable area: job records and logs live under
    /// `<data_dir>/jobs`, finalized results under `<data_dir>/results`.
    pub data_dir: PathBuf,
    /// Interpreter used to launch stage modules (`<interpreter> -m <module>`).
    /// Overridable through the `PYTHON_EXE` environment variable.
    pub interpreter: String,
    /// Worker pool size; distinct jobs execute in parallel up to this bound.
    pub workers: usize,
    /// Optional per-stage wall-clock limit. `None` means a hung stage blocks
    /// its worker indefinitely.
    pub stage_timeout: Option<Duration>,
}

impl OrchestratorConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            interpreter: default_interpreter(),
            workers: default_workers(),
            stage_timeout: None,
        }
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::new("data")
    }
}

fn default_interpreter() -> String {
    std::env::var("PYTHON_EXE").unwrap_or_else(|_| "python3".to_string())
}

fn default_workers() -> usize {
    std::cmp::max(2, num_cpus::get() / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_has_at_least_two_workers() {
        let config = OrchestratorConfig::default();
        assert!(config.workers >= 2);
    }

    #[test]
    fn test_dirs_derive_from_data_dir() {
        let config = OrchestratorConfig::new("/srv/qgen");
        assert_eq!(config.jobs_dir(), PathBuf::from("/srv/qgen/jobs"));
        assert_eq!(config.results_dir(), PathBuf::from("/srv/qgen/results"));
    }

    #[test]
    fn test_no_stage_timeout_by_default() {
        assert!(OrchestratorConfig::default().stage_timeout.is_none());
    }
}
