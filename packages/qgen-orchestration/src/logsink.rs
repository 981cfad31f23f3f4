use crate::error::{OrchestratorError, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

/// Largest tail a single read may request.
pub const MAX_TAIL_LINES: usize = 5000;

/// Append-only per-job text stream.
///
/// One `.log` file per job id; lines are appended in order and never
/// reordered or truncated. Reads are bounded tail views and never block a
/// running worker.
pub struct LogSink {
    jobs_dir: PathBuf,
}

impl LogSink {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Result<Self> {
        let jobs_dir = jobs_dir.into();
        fs::create_dir_all(&jobs_dir)?;
        Ok(Self { jobs_dir })
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}.log", job_id))
    }

    /// Append `line`, newline-terminated. Multi-line text is appended as-is.
    pub fn append(&self, job_id: &str, line: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(job_id))?;
        file.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            file.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Last `tail_n` lines of the job's log; `tail_n` is clamped to
    /// 1..=MAX_TAIL_LINES.
    pub fn tail(&self, job_id: &str, tail_n: usize) -> Result<Vec<String>> {
        let path = self.log_path(job_id);
        if !path.exists() {
            return Err(OrchestratorError::not_found(format!(
                "log not found for job_id: {}",
                job_id
            )));
        }
        let bytes = fs::read(&path)?;
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<String> = text.lines().map(str::to_string).collect();

        let tail_n = tail_n.clamp(1, MAX_TAIL_LINES);
        let skip = lines.len().saturating_sub(tail_n);
        Ok(lines.into_iter().skip(skip).collect())
    }
}
