/*
 * QGen Orchestration - Durable Question-Generation Pipeline Orchestrator
 *
 * Runs a fixed-order sequence of external document-processing stages per
 * submission, on a bounded worker pool.
 *
 * Architecture:
 * - Job Registry (atomic on-disk persistence, reload-on-miss recovery)
 * - Log Sink (append-only per-job stream, bounded tail reads)
 * - Stage Runner (subprocess supervision, live log streaming, one-shot
 *   no-arg fallback retry)
 * - Pipeline Executor (job lifecycle, stage sequencing, single fault
 *   conversion point)
 * - Result Aggregator (source-precedence resolution, redacted view)
 */

// Public modules
pub mod aggregate;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod logsink;
pub mod registry;
pub mod request;
pub mod runner;

// Re-exports
pub use aggregate::{redact, AggregateResult, AggregateSource, QuestionView, ResultAggregator};
pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, Result};
pub use executor::PipelineExecutor;
pub use job::{JobPatch, JobRecord, JobStatus, JobSummary, OutputPaths, StageId};
pub use logsink::{LogSink, MAX_TAIL_LINES};
pub use registry::JobRegistry;
pub use request::PipelineRequest;
pub use runner::{StageCommand, StageRunner};
