use crate::error::{OrchestratorError, Result};
use crate::job::{JobPatch, JobRecord, JobSummary};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// Durable key/value store of job records.
///
/// An in-memory cache fronts one JSON file per job id; every mutation is
/// merge-then-persist under a single coarse lock, and persistence is atomic
/// (write to a temporary file, rename into place) so a reader never observes
/// a partially written record. A cold cache falls back to the on-disk record,
/// which is how a restarted process recovers job state.
pub struct JobRegistry {
    jobs_dir: PathBuf,
    cache: Mutex<HashMap<String, JobRecord>>,
}

impl JobRegistry {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Result<Self> {
        let jobs_dir = jobs_dir.into();
        fs::create_dir_all(&jobs_dir)?;
        Ok(Self {
            jobs_dir,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn state_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(format!("{}.json", job_id))
    }

    /// Create the initial record for a fresh job id and persist it.
    pub fn insert(&self, record: JobRecord) -> Result<()> {
        let mut cache = self.cache.lock();
        self.persist(&record)?;
        cache.insert(record.job_id.clone(), record);
        Ok(())
    }

    /// Merge only the fields present in `patch` into the existing record and
    /// persist the merged record atomically. Status regressions are rejected.
    pub fn put(&self, job_id: &str, patch: &JobPatch) -> Result<JobRecord> {
        let mut cache = self.cache.lock();

        let mut record = match cache.get(job_id) {
            Some(record) => record.clone(),
            None => self.load_from_disk(job_id).ok_or_else(|| {
                OrchestratorError::not_found(format!("job_id not found: {}", job_id))
            })?,
        };

        if let Some(next) = patch.status {
            if !record.status.can_advance_to(next) {
                return Err(OrchestratorError::validation(format!(
                    "job {}: invalid status transition {} -> {}",
                    job_id, record.status, next
                )));
            }
        }

        record.apply(patch);
        self.persist(&record)?;
        cache.insert(job_id.to_string(), record.clone());
        Ok(record)
    }

    /// Freshest known record: in-memory cache first, on-disk record when the
    /// cache is cold, repopulating the cache on success.
    pub fn get(&self, job_id: &str) -> Result<JobRecord> {
        let mut cache = self.cache.lock();
        if let Some(record) = cache.get(job_id) {
            return Ok(record.clone());
        }
        match self.load_from_disk(job_id) {
            Some(record) => {
                cache.insert(job_id.to_string(), record.clone());
                Ok(record)
            }
            None => Err(OrchestratorError::not_found(format!(
                "job_id not found: {}",
                job_id
            ))),
        }
    }

    /// Slim summaries of every cached job, newest submission first.
    pub fn list(&self) -> Vec<JobSummary> {
        let cache = self.cache.lock();
        let mut summaries: Vec<JobSummary> = cache.values().map(JobSummary::from).collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        summaries
    }

    fn persist(&self, record: &JobRecord) -> Result<()> {
        let path = self.state_path(&record.job_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load_from_disk(&self, job_id: &str) -> Option<JobRecord> {
        let path = self.state_path(job_id);
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("unreadable job record {}: {}", path.display(), e);
                None
            }
        }
    }

    #[cfg(test)]
    fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}
