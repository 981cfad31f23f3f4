use crate::aggregate::{AggregateResult, QuestionView, ResultAggregator};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::job::{JobPatch, JobRecord, JobStatus, JobSummary, OutputPaths, StageId};
use crate::logsink::LogSink;
use crate::registry::JobRegistry;
use crate::request::PipelineRequest;
use crate::runner::{StageCommand, StageRunner};
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};
use uuid::Uuid;

/// Cap on the stored fault text; only the last characters of a long error
/// chain are kept.
const MAX_ERROR_CHARS: usize = 40_000;

/// Drives one job's full, fixed-order stage sequence on a background worker.
///
/// `submit` returns immediately; exactly one worker owns a job's execution
/// and is the only mutator of its `status`/`stage`/`error` fields. Status and
/// log reads go straight to the registry and log sink and never wait on a
/// worker. Concurrent jobs targeting the same output area are not
/// deduplicated or locked against one another.
#[derive(Clone)]
pub struct PipelineExecutor {
    config: OrchestratorConfig,
    registry: Arc<JobRegistry>,
    log: Arc<LogSink>,
    runner: Arc<StageRunner>,
    aggregator: ResultAggregator,
    pool: Arc<Semaphore>,
}

impl PipelineExecutor {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        fs::create_dir_all(config.results_dir())?;
        let registry = Arc::new(JobRegistry::new(config.jobs_dir())?);
        let log = Arc::new(LogSink::new(config.jobs_dir())?);
        let runner = Arc::new(StageRunner::new(log.clone(), config.stage_timeout));
        let aggregator = ResultAggregator::new(config.data_dir.clone());
        let pool = Arc::new(Semaphore::new(config.workers));
        Ok(Self {
            config,
            registry,
            log,
            runner,
            aggregator,
            pool,
        })
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    /// Create a QUEUED job record for the request and hand it to a background
    /// worker. Returns the fresh job id and the expected sub-unit count
    /// without waiting for execution.
    pub fn submit(&self, request: PipelineRequest) -> Result<(String, usize)> {
        request.validate()?;

        let job_id = Uuid::new_v4().simple().to_string();
        let jobs_path = request.resolve_jobs_path();
        let jobs_total = count_work_items(&jobs_path);

        let paths = OutputPaths::for_request(&request, self.log.log_path(&job_id));
        let record = JobRecord::new(job_id.clone(), request.clone(), jobs_total, paths);
        self.registry.insert(record)?;

        self.log
            .append(&job_id, &format!("[INIT] job_id={}", job_id))?;
        self.log.append(
            &job_id,
            &format!("[INIT] request={}", serde_json::to_string(&request)?),
        )?;
        self.log.append(
            &job_id,
            &format!(
                "[INIT] jobs_path={} jobs_total={}",
                jobs_path.display(),
                jobs_total
            ),
        )?;
        info!(
            "job {} submitted for pdf_id={} (jobs_total={})",
            job_id, request.pdf_id, jobs_total
        );

        let executor = self.clone();
        let worker_job_id = job_id.clone();
        tokio::spawn(async move {
            let _permit = match executor.pool.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            executor.run_job(&worker_job_id, &request).await;
        });

        Ok((job_id, jobs_total))
    }

    /// Freshest record for the job, with `jobs_done` recomputed from the
    /// output area. Safe to call from any process, including one that is not
    /// executing the job.
    pub fn get_status(&self, job_id: &str) -> Result<JobRecord> {
        let record = self.registry.get(job_id)?;
        let jobs_done = count_verified_units(&record.request.out_dir);
        self.registry.put(
            job_id,
            &JobPatch {
                jobs_done: Some(jobs_done),
                updated_at: Some(Utc::now()),
                ..Default::default()
            },
        )
    }

    /// Bounded tail of the job's log.
    pub fn get_log(&self, job_id: &str, tail_n: usize) -> Result<Vec<String>> {
        self.log.tail(job_id, tail_n)
    }

    pub fn list_jobs(&self) -> Vec<JobSummary> {
        self.registry.list()
    }

    /// Resolve the authoritative output for a document under source
    /// precedence; `out_dir` defaults to `artifacts/<pdf_id>`.
    pub fn get_aggregate(
        &self,
        pdf_id: &str,
        out_dir: Option<&Path>,
        view: QuestionView,
    ) -> Result<AggregateResult> {
        let default_dir;
        let out_dir = match out_dir {
            Some(dir) => dir,
            None => {
                default_dir = Path::new("artifacts").join(pdf_id);
                &default_dir
            }
        };
        self.aggregator.resolve_view(pdf_id, out_dir, view)
    }

    /// One job run, with the single conversion point from stage faults to a
    /// durable FAILED record. Every failure updates durable state before the
    /// worker exits.
    async fn run_job(&self, job_id: &str, request: &PipelineRequest) {
        let outcome = self.run_stages(job_id, request).await;
        let now = Utc::now();

        let finalize = match outcome {
            Ok(jobs_done) => {
                info!("job {} completed (jobs_done={})", job_id, jobs_done);
                self.registry.put(
                    job_id,
                    &JobPatch {
                        status: Some(JobStatus::Done),
                        stage: Some("DONE".to_string()),
                        updated_at: Some(now),
                        finished_at: Some(now),
                        jobs_done: Some(jobs_done),
                        ..Default::default()
                    },
                )
            }
            Err(e) => {
                let fault = truncate_tail(&format!("{:#}", anyhow::Error::from(e)), MAX_ERROR_CHARS);
                error!("job {} failed: {}", job_id, fault);
                let _ = self.log.append(job_id, &format!("\n[FATAL]\n{}\n", fault));
                self.registry.put(
                    job_id,
                    &JobPatch {
                        status: Some(JobStatus::Failed),
                        stage: Some("FAILED".to_string()),
                        updated_at: Some(now),
                        finished_at: Some(now),
                        error: Some(fault),
                        ..Default::default()
                    },
                )
            }
        };

        // Persistence failure here is fatal to the worker; the record on disk
        // stays at its last consistent state.
        if let Err(e) = finalize {
            error!("job {}: failed to persist terminal state: {}", job_id, e);
        }
    }

    async fn run_stages(&self, job_id: &str, request: &PipelineRequest) -> Result<usize> {
        self.registry.put(
            job_id,
            &JobPatch {
                status: Some(JobStatus::Running),
                stage: Some("START".to_string()),
                updated_at: Some(Utc::now()),
                ..Default::default()
            },
        )?;

        // Precondition: an enabled prepare stage needs a usable source
        // document, checked before any stage executes.
        if request.run_prepare {
            let usable = request
                .pdf_path
                .as_deref()
                .map(Path::is_file)
                .unwrap_or(false);
            if !usable {
                return Err(OrchestratorError::Precondition(format!(
                    "run_prepare=true but pdf_path is missing or unreadable: {:?}",
                    request.pdf_path
                )));
            }
        }

        for stage in StageId::CANONICAL_ORDER {
            if !request.stage_enabled(stage) {
                continue;
            }
            self.registry.put(
                job_id,
                &JobPatch {
                    stage: Some(stage.as_str().to_string()),
                    updated_at: Some(Utc::now()),
                    ..Default::default()
                },
            )?;

            let cmd = StageCommand::for_stage(stage, request, &self.config.interpreter)?;
            self.runner.run_with_fallback(job_id, stage, &cmd).await?;
        }

        // Recount from the output area, independent of whatever the stages
        // reported.
        let jobs_done = count_verified_units(&request.out_dir);
        self.log
            .append(job_id, &format!("[DONE] jobs_done={}", jobs_done))?;
        if let Ok(record) = self.registry.get(job_id) {
            self.log.append(
                job_id,
                &format!("[DONE] outputs={}", serde_json::to_string(&record.paths)?),
            )?;
        }
        Ok(jobs_done)
    }
}

/// Count well-formed work items: non-blank, non-comment lines. 0 when the
/// file is unavailable.
fn count_work_items(path: &Path) -> usize {
    let Ok(bytes) = fs::read(path) else {
        return 0;
    };
    let text = String::from_utf8_lossy(&bytes);
    text.trim_start_matches('\u{feff}')
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            !trimmed.is_empty() && !trimmed.starts_with('#')
        })
        .count()
}

/// Count completed sub-units in the output area.
fn count_verified_units(out_dir: &Path) -> usize {
    let dir = out_dir.join("questions_verified");
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("job_") && name.ends_with(".json")
        })
        .count()
}

/// Keep only the last `max_chars` characters of a fault text.
fn truncate_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        text.to_string()
    } else {
        text.chars().skip(total - max_chars).collect()
    }
}
