use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DIFFICULTIES: [&str; 4] = ["easy", "medium", "hard", "mixed"];

/// Immutable snapshot of one pipeline submission.
///
/// Field defaults mirror the operational defaults of the stage executables;
/// a submission only needs to override what differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineRequest {
    /// Source document; required when `run_prepare` is enabled.
    pub pdf_path: Option<PathBuf>,
    pub pdf_id: String,
    pub out_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Work-item file; bare file names resolve under `out_dir`.
    pub jobs_jsonl: String,

    pub overwrite: bool,
    pub max_retries: u32,
    pub flush_every: u32,

    pub presence_workers: u32,
    pub extract_workers: u32,
    pub q_workers: u32,

    pub dpi: u32,

    pub total_q: u32,
    pub no_require_table_q: bool,

    pub preview: u32,
    pub ordered_preview: bool,
    pub save_generated: bool,
    pub save_answers_only: bool,

    pub model: String,
    pub table_model: String,
    pub fallback_model: String,
    pub temperature: f64,

    pub difficulty: String,
    pub mcq_ratio: f64,
    pub saq_ratio: f64,

    pub run_prepare: bool,
    pub run_presence: bool,
    pub run_extract: bool,
    pub run_section_index: bool,
    pub run_section_package: bool,
    pub run_job_build: bool,
    pub run_question_pipeline: bool,
}

impl Default for PipelineRequest {
    fn default() -> Self {
        Self {
            pdf_path: None,
            pdf_id: "lecture".to_string(),
            out_dir: PathBuf::from("artifacts/lecture"),
            data_dir: PathBuf::from("data"),
            jobs_jsonl: "question_jobs.jsonl".to_string(),
            overwrite: true,
            max_retries: 5,
            flush_every: 1,
            presence_workers: 3,
            extract_workers: 3,
            q_workers: 2,
            dpi: 150,
            total_q: 0,
            no_require_table_q: false,
            preview: 0,
            ordered_preview: false,
            save_generated: true,
            save_answers_only: true,
            model: "gpt-4o-mini".to_string(),
            table_model: "gpt-4o-mini".to_string(),
            fallback_model: "gpt-4o-mini".to_string(),
            temperature: 0.3,
            difficulty: "mixed".to_string(),
            mcq_ratio: 1.0,
            saq_ratio: 0.0,
            run_prepare: true,
            run_presence: true,
            run_extract: true,
            run_section_index: true,
            run_section_package: true,
            run_job_build: true,
            run_question_pipeline: true,
        }
    }
}

impl PipelineRequest {
    /// Synchronous submission validation; a rejected request creates no job.
    pub fn validate(&self) -> Result<()> {
        if !DIFFICULTIES.contains(&self.difficulty.as_str()) {
            return Err(OrchestratorError::validation(format!(
                "difficulty must be one of {:?}, got {:?}",
                DIFFICULTIES, self.difficulty
            )));
        }
        for (name, value) in [("mcq_ratio", self.mcq_ratio), ("saq_ratio", self.saq_ratio)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(OrchestratorError::validation(format!(
                    "{} must lie in [0.0, 1.0], got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }

    pub fn stage_enabled(&self, stage: StageId) -> bool {
        match stage {
            StageId::Prepare => self.run_prepare,
            StageId::TablePresence => self.run_presence,
            StageId::TableExtract => self.run_extract,
            StageId::SectionIndex => self.run_section_index,
            StageId::SectionPackage => self.run_section_package,
            StageId::JobBuild => self.run_job_build,
            StageId::QuestionPipeline => self.run_question_pipeline,
        }
    }

    /// Resolve the work-item file: absolute and multi-component paths are
    /// taken as given, a bare file name lives under `out_dir`.
    pub fn resolve_jobs_path(&self) -> PathBuf {
        let jp = Path::new(&self.jobs_jsonl);
        if jp.is_absolute() || jp.components().count() > 1 {
            jp.to_path_buf()
        } else {
            self.out_dir.join(jp)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_enable_all_stages() {
        let request = PipelineRequest::default();
        for stage in StageId::CANONICAL_ORDER {
            assert!(request.stage_enabled(stage), "{} should default on", stage);
        }
    }

    #[test]
    fn test_validate_accepts_defaults() {
        assert!(PipelineRequest::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_difficulty() {
        let request = PipelineRequest {
            difficulty: "impossible".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            request.validate(),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range_ratio() {
        let request = PipelineRequest {
            mcq_ratio: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            request.validate(),
            Err(OrchestratorError::Validation(_))
        ));
    }

    #[test]
    fn test_resolve_jobs_path_bare_name_lives_under_out_dir() {
        let request = PipelineRequest {
            out_dir: PathBuf::from("artifacts/doc-7"),
            ..Default::default()
        };
        assert_eq!(
            request.resolve_jobs_path(),
            PathBuf::from("artifacts/doc-7/question_jobs.jsonl")
        );
    }

    #[test]
    fn test_resolve_jobs_path_keeps_explicit_paths() {
        let relative = PipelineRequest {
            jobs_jsonl: "elsewhere/jobs.jsonl".to_string(),
            ..Default::default()
        };
        assert_eq!(
            relative.resolve_jobs_path(),
            PathBuf::from("elsewhere/jobs.jsonl")
        );

        let absolute = PipelineRequest {
            jobs_jsonl: "/tmp/jobs.jsonl".to_string(),
            ..Default::default()
        };
        assert_eq!(absolute.resolve_jobs_path(), PathBuf::from("/tmp/jobs.jsonl"));
    }

    #[test]
    fn test_request_json_roundtrip_with_partial_body() {
        let json = r#"{"pdf_id": "doc-9", "run_prepare": false, "total_q": 12}"#;
        let request: PipelineRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.pdf_id, "doc-9");
        assert!(!request.run_prepare);
        assert_eq!(request.total_q, 12);
        assert_eq!(request.model, "gpt-4o-mini");
        assert_eq!(request.dpi, 150);
    }
}
