use crate::error::{OrchestratorError, Result};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Keys removed from a payload when the restricted (student) view is
/// requested.
const SENSITIVE_KEYS: [&str; 8] = [
    "answer",
    "answers",
    "correct_answer",
    "correctAnswer",
    "solution",
    "explanation",
    "rationale",
    "reason",
];

/// Which caller-facing view of a payload to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionView {
    Teacher,
    Student,
}

/// Which source satisfied a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateSource {
    /// Finalized per-document specification file (highest authority).
    Spec(PathBuf),
    /// Verified-aggregate file written by the terminal pipeline stage.
    Aggregate(PathBuf),
    /// Live reconstruction from per-unit verified files.
    Scan(PathBuf),
}

impl std::fmt::Display for AggregateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AggregateSource::Spec(path) | AggregateSource::Aggregate(path) => {
                write!(f, "{}", path.display())
            }
            AggregateSource::Scan(dir) => write!(f, "scan:{}", dir.display()),
        }
    }
}

/// Resolved payload plus the source that satisfied it.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateResult {
    pub source: AggregateSource,
    pub data: Value,
}

/// Resolves the authoritative output for a document by source precedence:
/// finalized spec file, then verified aggregate, then a live directory scan.
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    data_dir: PathBuf,
}

impl ResultAggregator {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Try the three sources in strict precedence order. Unreadable or empty
    /// higher-precedence files fall through to the next source; the call
    /// fails with not-found only when all three are absent.
    pub fn resolve(&self, pdf_id: &str, out_dir: &Path) -> Result<AggregateResult> {
        let spec_path = self
            .data_dir
            .join("results")
            .join(format!("{}.questions.json", pdf_id));
        if let Some(data) = load_json_tolerant(&spec_path).filter(usable) {
            debug!("aggregate for {} resolved from spec file", pdf_id);
            return Ok(AggregateResult {
                source: AggregateSource::Spec(spec_path),
                data,
            });
        }

        let agg_path = out_dir.join("questions_verified_aggregate.json");
        if let Some(data) = load_json_tolerant(&agg_path).filter(usable) {
            debug!("aggregate for {} resolved from verified aggregate", pdf_id);
            return Ok(AggregateResult {
                source: AggregateSource::Aggregate(agg_path),
                data,
            });
        }

        let verified_dir = out_dir.join("questions_verified");
        if !verified_dir.exists() {
            return Err(OrchestratorError::not_found(format!(
                "questions not found for pdf_id={} (no spec, aggregate, or verified dir)",
                pdf_id
            )));
        }

        let items = scan_verified_units(&verified_dir)?;
        debug!(
            "aggregate for {} reconstructed from {} verified units",
            pdf_id,
            items.len()
        );
        Ok(AggregateResult {
            source: AggregateSource::Scan(verified_dir),
            data: json!({ "pdf_id": pdf_id, "items": items }),
        })
    }

    /// Resolve and shape for the requested view; the student view is the
    /// redacted form of the same payload.
    pub fn resolve_view(
        &self,
        pdf_id: &str,
        out_dir: &Path,
        view: QuestionView,
    ) -> Result<AggregateResult> {
        let mut resolved = self.resolve(pdf_id, out_dir)?;
        if view == QuestionView::Student {
            resolved.data = redact(&resolved.data);
        }
        Ok(resolved)
    }
}

/// Recursively remove the fixed sensitive key set at any nesting depth,
/// preserving all other structure and values. Pure function, no side
/// effects.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(key, _)| !SENSITIVE_KEYS.contains(&key.as_str()))
                .map(|(key, nested)| (key.clone(), redact(nested)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

/// Per-unit scan, sorted by file name; an unreadable unit becomes an explicit
/// error placeholder instead of aborting the whole scan.
fn scan_verified_units(verified_dir: &Path) -> Result<Vec<Value>> {
    let mut names: Vec<String> = fs::read_dir(verified_dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("job_") && name.ends_with(".json"))
        .collect();
    names.sort();

    Ok(names
        .into_iter()
        .map(|name| {
            load_json_tolerant(&verified_dir.join(&name))
                .filter(usable)
                .unwrap_or_else(|| json!({ "file": name, "error": "read_failed" }))
        })
        .collect())
}

/// Tolerant JSON load: `None` on missing, unreadable, or unparseable files.
fn load_json_tolerant(path: &Path) -> Option<Value> {
    let bytes = fs::read(path).ok()?;
    let text = String::from_utf8_lossy(&bytes);
    serde_json::from_str(text.trim_start_matches('\u{feff}')).ok()
}

/// An empty payload does not satisfy a resolution.
fn usable(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.is_empty(),
        Value::Bool(b) => *b,
        Value::Number(_) => true,
    }
}
