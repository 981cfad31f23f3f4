use crate::error::{OrchestratorError, Result};
use crate::job::StageId;
use crate::logsink::LogSink;
use crate::request::PipelineRequest;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

/// One stage invocation: `<program> -m <module> <args...>`.
///
/// The flag vocabulary is fixed by the stage executables; the orchestrator
/// only assembles it and treats the process output as opaque text.
#[derive(Debug, Clone)]
pub struct StageCommand {
    pub program: String,
    pub module: String,
    pub args: Vec<String>,
}

impl StageCommand {
    pub fn new(program: impl Into<String>, module: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            module: module.into(),
            args: Vec::new(),
        }
    }

    fn flag(mut self, name: &str, value: impl ToString) -> Self {
        self.args.push(name.to_string());
        self.args.push(value.to_string());
        self
    }

    fn switch(mut self, name: &str, enabled: bool) -> Self {
        if enabled {
            self.args.push(name.to_string());
        }
        self
    }

    /// The same module invocation with every stage argument dropped, letting
    /// the executable's built-in defaults apply.
    pub fn bare(&self) -> Self {
        Self {
            program: self.program.clone(),
            module: self.module.clone(),
            args: Vec::new(),
        }
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec!["-m".to_string(), self.module.clone()];
        argv.extend(self.args.iter().cloned());
        argv
    }

    pub fn display_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.argv());
        parts.join(" ")
    }

    /// Assemble the invocation for one stage of a request.
    pub fn for_stage(
        stage: StageId,
        request: &PipelineRequest,
        interpreter: &str,
    ) -> Result<Self> {
        let out_dir = request.out_dir.display().to_string();
        let cmd = StageCommand::new(interpreter, stage.module());

        let cmd = match stage {
            StageId::Prepare => {
                let pdf_path = request.pdf_path.as_ref().ok_or_else(|| {
                    OrchestratorError::Precondition(
                        "run_prepare=true but pdf_path is empty".to_string(),
                    )
                })?;
                cmd.flag("--pdf_path", pdf_path.display())
                    .flag("--pdf_id", &request.pdf_id)
                    .flag("--out_dir", &out_dir)
                    .flag("--dpi", request.dpi)
            }
            StageId::TablePresence => cmd
                .flag("--out_dir", &out_dir)
                .flag("--pdf_id", &request.pdf_id)
                .flag("--workers", request.presence_workers)
                .flag("--max_retries", request.max_retries)
                .flag("--flush_every", request.flush_every)
                .switch("--overwrite", request.overwrite),
            StageId::TableExtract => cmd
                .flag("--out_dir", &out_dir)
                .flag("--pdf_id", &request.pdf_id)
                .flag("--workers", request.extract_workers)
                .flag("--max_retries", request.max_retries)
                .flag("--flush_every", request.flush_every)
                .switch("--overwrite", request.overwrite),
            StageId::SectionIndex => cmd
                .flag("--out_dir", &out_dir)
                .flag("--pdf_id", &request.pdf_id),
            StageId::SectionPackage => cmd
                .flag("--out_dir", &out_dir)
                .flag("--pdf_id", &request.pdf_id)
                .switch("--overwrite", request.overwrite),
            StageId::JobBuild => cmd
                .flag("--out_dir", &out_dir)
                .flag("--pdf_id", &request.pdf_id)
                .flag("--total_q", request.total_q)
                .flag("--difficulty", &request.difficulty)
                .flag("--mcq_ratio", request.mcq_ratio)
                .flag("--saq_ratio", request.saq_ratio)
                .switch("--overwrite", request.overwrite)
                .switch("--no_require_table_q", request.no_require_table_q),
            StageId::QuestionPipeline => {
                let mut cmd = cmd
                    .flag("--out_dir", &out_dir)
                    .flag("--jobs", &request.jobs_jsonl)
                    .flag("--pdf_id", &request.pdf_id)
                    .flag("--workers", request.q_workers)
                    .flag("--max_retries", request.max_retries)
                    .flag("--model", &request.model)
                    .flag("--table_model", &request.table_model)
                    .flag("--fallback_model", &request.fallback_model)
                    .flag("--temperature", request.temperature)
                    .flag("--data_dir", request.data_dir.display())
                    .switch("--overwrite", request.overwrite);
                if request.preview > 0 {
                    cmd = cmd.flag("--preview", request.preview);
                }
                cmd.switch("--ordered_preview", request.ordered_preview)
                    .switch("--save_generated", request.save_generated)
                    .switch("--no_answers_only", !request.save_answers_only)
            }
        };

        Ok(cmd)
    }
}

/// Executes one external stage process, streaming its combined output into
/// the job's log so a concurrently polled tail shows live progress.
pub struct StageRunner {
    log: Arc<LogSink>,
    stage_timeout: Option<Duration>,
}

impl StageRunner {
    pub fn new(log: Arc<LogSink>, stage_timeout: Option<Duration>) -> Self {
        Self { log, stage_timeout }
    }

    /// Launch the stage process and stream each output line into the log as
    /// it is produced. Appends a START marker with the literal command and an
    /// END marker with the exit code; a non-zero exit raises a stage failure.
    pub async fn run(&self, job_id: &str, stage: StageId, cmd: &StageCommand) -> Result<()> {
        self.log
            .append(job_id, &format!("\n===== STAGE {} START =====", stage))?;
        self.log
            .append(job_id, &format!("CMD: {}", cmd.display_line()))?;
        info!("job {}: stage {} starting", job_id, stage);

        let mut child = Command::new(&cmd.program)
            .args(cmd.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OrchestratorError::StageLaunch { stage, source })?;

        let stdout_pump = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(pump_lines(self.log.clone(), job_id.to_string(), pipe)));
        let stderr_pump = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(pump_lines(self.log.clone(), job_id.to_string(), pipe)));

        let status = match self.stage_timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(waited) => waited?,
                Err(_) => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    join_pump(stdout_pump).await?;
                    join_pump(stderr_pump).await?;
                    self.log
                        .append(job_id, &format!("===== STAGE {} TIMEOUT =====\n", stage))?;
                    warn!(
                        "job {}: stage {} killed after {}s",
                        job_id,
                        stage,
                        limit.as_secs()
                    );
                    return Err(OrchestratorError::StageTimeout {
                        stage,
                        timeout_secs: limit.as_secs(),
                    });
                }
            },
            None => child.wait().await?,
        };

        join_pump(stdout_pump).await?;
        join_pump(stderr_pump).await?;

        let rc = status.code().unwrap_or(-1);
        self.log
            .append(job_id, &format!("===== STAGE {} END (rc={}) =====\n", stage, rc))?;

        if rc != 0 {
            warn!("job {}: stage {} failed with rc={}", job_id, stage, rc);
            return Err(OrchestratorError::StageFailed {
                stage,
                exit_code: rc,
            });
        }
        info!("job {}: stage {} completed", job_id, stage);
        Ok(())
    }

    /// Bounded self-healing for fallback-eligible stages: if the argumented
    /// invocation fails, retry the same module exactly once with no stage
    /// arguments. A second failure propagates; nothing ever retries twice.
    pub async fn run_with_fallback(
        &self,
        job_id: &str,
        stage: StageId,
        cmd: &StageCommand,
    ) -> Result<()> {
        let first_err = match self.run(job_id, stage, cmd).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if !stage.fallback_eligible() {
            return Err(first_err);
        }

        self.log.append(
            job_id,
            &format!("[WARN] {} first try failed: {}", stage, first_err),
        )?;
        let bare = cmd.bare();
        self.log.append(
            job_id,
            &format!("[WARN] retry without args: {}", bare.display_line()),
        )?;

        self.run(job_id, stage, &bare)
            .await
            .map_err(|second| OrchestratorError::FallbackExhausted {
                stage,
                source: Box::new(second),
            })
    }
}

async fn pump_lines<R>(log: Arc<LogSink>, job_id: String, pipe: R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    while let Some(line) = lines.next_line().await? {
        log.append(&job_id, &line)?;
    }
    Ok(())
}

async fn join_pump(pump: Option<tokio::task::JoinHandle<Result<()>>>) -> Result<()> {
    match pump {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(OrchestratorError::Other(anyhow::anyhow!(
                "log pump task failed: {}",
                e
            ))),
        },
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn runner(dir: &Path) -> (StageRunner, Arc<LogSink>) {
        let log = Arc::new(LogSink::new(dir.join("jobs")).unwrap());
        (StageRunner::new(log.clone(), None), log)
    }

    fn command_for(script: &Path) -> StageCommand {
        StageCommand::new(script.display().to_string(), "core.run_table_presence")
            .flag("--out_dir", "artifacts/x")
            .flag("--pdf_id", "x")
    }

    #[tokio::test]
    async fn test_run_streams_output_between_markers() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "ok.sh",
            "#!/bin/sh\necho line-a\necho line-b\nexit 0\n",
        );
        let (runner, log) = runner(dir.path());

        runner
            .run("job-1", StageId::TablePresence, &command_for(&script))
            .await
            .unwrap();

        let lines = log.tail("job-1", 100).unwrap();
        let start = lines
            .iter()
            .position(|l| l == "===== STAGE TABLE_PRESENCE START =====")
            .unwrap();
        let end = lines
            .iter()
            .position(|l| l == "===== STAGE TABLE_PRESENCE END (rc=0) =====")
            .unwrap();
        assert!(start < end);
        assert!(lines[start + 1].starts_with("CMD: "));
        assert!(lines.contains(&"line-a".to_string()));
        assert!(lines.contains(&"line-b".to_string()));
    }

    #[tokio::test]
    async fn test_stderr_lines_reach_the_log() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "noisy.sh",
            "#!/bin/sh\necho out-line\necho err-line >&2\nexit 0\n",
        );
        let (runner, log) = runner(dir.path());

        runner
            .run("job-2", StageId::SectionIndex, &command_for(&script))
            .await
            .unwrap();

        let lines = log.tail("job-2", 100).unwrap();
        assert!(lines.contains(&"out-line".to_string()));
        assert!(lines.contains(&"err-line".to_string()));
    }

    #[tokio::test]
    async fn test_non_zero_exit_raises_stage_failure() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "fail.sh", "#!/bin/sh\nexit 7\n");
        let (runner, log) = runner(dir.path());

        let err = runner
            .run("job-3", StageId::QuestionPipeline, &command_for(&script))
            .await
            .unwrap_err();

        match err {
            OrchestratorError::StageFailed { stage, exit_code } => {
                assert_eq!(stage, StageId::QuestionPipeline);
                assert_eq!(exit_code, 7);
            }
            other => panic!("expected StageFailed, got {:?}", other),
        }

        let lines = log.tail("job-3", 100).unwrap();
        assert!(lines
            .contains(&"===== STAGE QUESTION_PIPELINE END (rc=7) =====".to_string()));
    }

    #[tokio::test]
    async fn test_fallback_retries_bare_and_succeeds() {
        let dir = tempdir().unwrap();
        // Fails when stage flags are present, succeeds on the bare
        // `-m <module>` invocation.
        let script = write_script(
            dir.path(),
            "picky.sh",
            "#!/bin/sh\nif [ \"$#\" -gt 2 ]; then\n  echo rejecting-flags\n  exit 2\nfi\necho defaults-ok\nexit 0\n",
        );
        let (runner, log) = runner(dir.path());

        runner
            .run_with_fallback("job-4", StageId::TablePresence, &command_for(&script))
            .await
            .unwrap();

        let lines = log.tail("job-4", 200).unwrap();
        let failed_end = lines
            .iter()
            .position(|l| l == "===== STAGE TABLE_PRESENCE END (rc=2) =====")
            .unwrap();
        let warn = lines
            .iter()
            .position(|l| l.starts_with("[WARN] TABLE_PRESENCE first try failed"))
            .unwrap();
        let retry_note = lines
            .iter()
            .position(|l| l.starts_with("[WARN] retry without args:"))
            .unwrap();
        let ok_end = lines
            .iter()
            .position(|l| l == "===== STAGE TABLE_PRESENCE END (rc=0) =====")
            .unwrap();

        assert!(failed_end < warn);
        assert!(warn < retry_note);
        assert!(retry_note < ok_end);
        assert!(lines.contains(&"defaults-ok".to_string()));
    }

    #[tokio::test]
    async fn test_fallback_exhausted_after_second_failure() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "always-fail.sh", "#!/bin/sh\nexit 3\n");
        let (runner, log) = runner(dir.path());

        let err = runner
            .run_with_fallback("job-5", StageId::SectionPackage, &command_for(&script))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::FallbackExhausted {
                stage: StageId::SectionPackage,
                ..
            }
        ));

        // Exactly two attempts: argumented, then bare.
        let lines = log.tail("job-5", 200).unwrap();
        let starts = lines
            .iter()
            .filter(|l| l.as_str() == "===== STAGE SECTION_PACKAGE START =====")
            .count();
        assert_eq!(starts, 2);
    }

    #[tokio::test]
    async fn test_no_fallback_for_question_pipeline() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "fail.sh", "#!/bin/sh\nexit 1\n");
        let (runner, log) = runner(dir.path());

        let err = runner
            .run_with_fallback("job-6", StageId::QuestionPipeline, &command_for(&script))
            .await
            .unwrap_err();

        assert!(matches!(err, OrchestratorError::StageFailed { .. }));

        let lines = log.tail("job-6", 200).unwrap();
        let starts = lines
            .iter()
            .filter(|l| l.as_str() == "===== STAGE QUESTION_PIPELINE START =====")
            .count();
        assert_eq!(starts, 1);
        assert!(!lines.iter().any(|l| l.starts_with("[WARN]")));
    }

    #[tokio::test]
    async fn test_stage_timeout_kills_hung_process() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "hang.sh", "#!/bin/sh\nsleep 30\n");
        let log = Arc::new(LogSink::new(dir.path().join("jobs")).unwrap());
        let runner = StageRunner::new(log.clone(), Some(Duration::from_millis(200)));

        let err = runner
            .run("job-7", StageId::TableExtract, &command_for(&script))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestratorError::StageTimeout {
                stage: StageId::TableExtract,
                ..
            }
        ));
        let lines = log.tail("job-7", 100).unwrap();
        assert!(lines.contains(&"===== STAGE TABLE_EXTRACT TIMEOUT =====".to_string()));
    }

    #[test]
    fn test_for_stage_prepare_requires_pdf_path() {
        let request = PipelineRequest::default();
        let err = StageCommand::for_stage(StageId::Prepare, &request, "python3").unwrap_err();
        assert!(matches!(err, OrchestratorError::Precondition(_)));
    }

    #[test]
    fn test_for_stage_builds_flag_vocabulary() {
        let request = PipelineRequest {
            pdf_path: Some(PathBuf::from("data/pdfs/doc/source.pdf")),
            ..Default::default()
        };

        let prepare = StageCommand::for_stage(StageId::Prepare, &request, "python3").unwrap();
        assert_eq!(prepare.program, "python3");
        assert_eq!(prepare.argv()[..2], ["-m", "core.prepare"]);
        assert!(prepare.args.contains(&"--dpi".to_string()));

        let presence =
            StageCommand::for_stage(StageId::TablePresence, &request, "python3").unwrap();
        assert!(presence.args.contains(&"--workers".to_string()));
        assert!(presence.args.contains(&"--overwrite".to_string()));

        let qp = StageCommand::for_stage(StageId::QuestionPipeline, &request, "python3").unwrap();
        assert!(qp.args.contains(&"--model".to_string()));
        assert!(qp.args.contains(&"--save_generated".to_string()));
        // save_answers_only=true means no --no_answers_only switch.
        assert!(!qp.args.contains(&"--no_answers_only".to_string()));
        // preview=0 emits no --preview flag.
        assert!(!qp.args.contains(&"--preview".to_string()));
    }

    #[test]
    fn test_bare_drops_stage_args_keeps_module() {
        let cmd = StageCommand::new("python3", "core.job_builder")
            .flag("--out_dir", "artifacts/x")
            .switch("--overwrite", true);
        let bare = cmd.bare();
        assert_eq!(bare.argv(), vec!["-m", "core.job_builder"]);
        assert_eq!(bare.display_line(), "python3 -m core.job_builder");
    }
}
