use crate::error::{OrchestratorError, Result};
use crate::request::PipelineRequest;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stage identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageId {
    Prepare,
    TablePresence,
    TableExtract,
    SectionIndex,
    SectionPackage,
    JobBuild,
    QuestionPipeline,
}

impl StageId {
    /// Canonical, total execution order. Disabled stages are skipped with no
    /// trace; enabled stages always run in this order.
    pub const CANONICAL_ORDER: [StageId; 7] = [
        StageId::Prepare,
        StageId::TablePresence,
        StageId::TableExtract,
        StageId::SectionIndex,
        StageId::SectionPackage,
        StageId::JobBuild,
        StageId::QuestionPipeline,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Prepare => "PREPARE",
            StageId::TablePresence => "TABLE_PRESENCE",
            StageId::TableExtract => "TABLE_EXTRACT",
            StageId::SectionIndex => "SECTION_INDEX",
            StageId::SectionPackage => "SECTION_PACKAGE",
            StageId::JobBuild => "JOB_BUILD",
            StageId::QuestionPipeline => "QUESTION_PIPELINE",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PREPARE" => Ok(StageId::Prepare),
            "TABLE_PRESENCE" => Ok(StageId::TablePresence),
            "TABLE_EXTRACT" => Ok(StageId::TableExtract),
            "SECTION_INDEX" => Ok(StageId::SectionIndex),
            "SECTION_PACKAGE" => Ok(StageId::SectionPackage),
            "JOB_BUILD" => Ok(StageId::JobBuild),
            "QUESTION_PIPELINE" => Ok(StageId::QuestionPipeline),
            _ => Err(OrchestratorError::validation(format!(
                "invalid stage id: {}",
                s
            ))),
        }
    }

    /// External module invoked for this stage.
    pub fn module(&self) -> &'static str {
        match self {
            StageId::Prepare => "core.prepare",
            StageId::TablePresence => "core.run_table_presence",
            StageId::TableExtract => "core.run_table_extract_mm",
            StageId::SectionIndex => "core.section_indexer",
            StageId::SectionPackage => "core.section_context_packager",
            StageId::JobBuild => "core.job_builder",
            StageId::QuestionPipeline => "core.run_question_pipeline",
        }
    }

    /// Whether a failed argumented invocation may be retried once with no
    /// stage arguments. PREPARE cannot run without its source-document
    /// argument, and the question pipeline must never fall back to defaults.
    pub fn fallback_eligible(&self) -> bool {
        !matches!(self, StageId::Prepare | StageId::QuestionPipeline)
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job status. Transitions are monotonic along
/// QUEUED -> RUNNING -> {DONE | FAILED} and never revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Running => 1,
            JobStatus::Done | JobStatus::Failed => 2,
        }
    }

    /// A status may advance to itself or forward, never backward; terminal
    /// statuses only advance to themselves.
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            *self == next
        } else {
            next.rank() >= self.rank()
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

/// Resolved output locations for one job, recorded at submission time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputPaths {
    pub results_spec: PathBuf,
    pub verified_aggregate: PathBuf,
    pub verified_dir: PathBuf,
    pub answers_only_dir: PathBuf,
    pub generated_dir: PathBuf,
    pub log_path: PathBuf,
}

impl OutputPaths {
    pub fn for_request(request: &PipelineRequest, log_path: PathBuf) -> Self {
        let out_dir = &request.out_dir;
        Self {
            results_spec: request
                .data_dir
                .join("results")
                .join(format!("{}.questions.json", request.pdf_id)),
            verified_aggregate: out_dir.join("questions_verified_aggregate.json"),
            verified_dir: out_dir.join("questions_verified"),
            answers_only_dir: out_dir.join("answers_only"),
            generated_dir: out_dir.join("questions_generated"),
            log_path,
        }
    }
}

/// One persisted unit per job id; written atomically on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub pdf_id: String,
    pub status: JobStatus,
    /// Current/last stage label, or one of the markers
    /// QUEUED / START / DONE / FAILED.
    pub stage: String,
    #[serde(default)]
    pub detail_stage: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Immutable snapshot of the originating request.
    pub request: PipelineRequest,
    pub jobs_total: usize,
    pub jobs_done: usize,
    pub paths: OutputPaths,
}

impl JobRecord {
    pub fn new(
        job_id: String,
        request: PipelineRequest,
        jobs_total: usize,
        paths: OutputPaths,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            pdf_id: request.pdf_id.clone(),
            status: JobStatus::Queued,
            stage: "QUEUED".to_string(),
            detail_stage: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
            error: None,
            request,
            jobs_total,
            jobs_done: 0,
            paths,
        }
    }

    /// Overwrite only the fields present in the patch, leaving all others
    /// untouched. Applying the same patch twice yields the same record.
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(stage) = &patch.stage {
            self.stage = stage.clone();
        }
        if let Some(detail_stage) = &patch.detail_stage {
            self.detail_stage = detail_stage.clone();
        }
        if let Some(updated_at) = patch.updated_at {
            self.updated_at = updated_at;
        }
        if let Some(finished_at) = patch.finished_at {
            self.finished_at = Some(finished_at);
        }
        if let Some(error) = &patch.error {
            self.error = Some(error.clone());
        }
        if let Some(jobs_done) = patch.jobs_done {
            self.jobs_done = jobs_done;
        }
    }
}

/// Partial update for a job record; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub stage: Option<String>,
    /// `Some(None)` clears the sub-phase, `Some(Some(_))` sets it.
    pub detail_stage: Option<Option<String>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub jobs_done: Option<usize>,
}

/// Slim view of a job record for listings.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub pdf_id: String,
    pub status: JobStatus,
    pub stage: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub jobs_total: usize,
    pub jobs_done: usize,
}

impl From<&JobRecord> for JobSummary {
    fn from(record: &JobRecord) -> Self {
        Self {
            job_id: record.job_id.clone(),
            pdf_id: record.pdf_id.clone(),
            status: record.status,
            stage: record.stage.clone(),
            started_at: record.started_at,
            updated_at: record.updated_at,
            finished_at: record.finished_at,
            jobs_total: record.jobs_total,
            jobs_done: record.jobs_done,
        }
    }
}
