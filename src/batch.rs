//! Batch orchestration.
//!
//! Drives one session through many CSV records, strictly sequentially:
//! map, update field by field (each ready signal observed before the
//! next update), extract, validate, write. One record's failure never
//! halts the batch; only a raster-class failure aborts the run.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::{
    error::{LabelkitError, LabelkitResult},
    raster::PNG_SIGNATURE,
    session::{Session, Update},
};

/// One row of tabular input: domain field name → string value, in
/// column order, plus its 0-based row index. Never mutated after parse.
#[derive(Clone, Debug)]
pub struct BatchRecord {
    pub index: usize,
    fields: Vec<(String, String)>,
}

impl BatchRecord {
    pub fn new(index: usize, fields: Vec<(String, String)>) -> Self {
        Self { index, fields }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }
}

/// Read a CSV file (header row = domain field names) into records.
pub fn read_records(path: &Path) -> LabelkitResult<Vec<BatchRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row?;
        let fields = headers
            .iter()
            .zip(row.iter())
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        records.push(BatchRecord::new(index, fields));
    }
    Ok(records)
}

/// Translation from domain field names to region ids, applied in a
/// fixed caller-determined order.
#[derive(Clone, Debug, Default)]
pub struct FieldMap {
    entries: Vec<(String, String)>,
}

impl FieldMap {
    /// Column names are the region ids themselves, in template
    /// declaration order.
    pub fn identity(session: &Session) -> Self {
        let entries = session
            .region_ids()
            .into_iter()
            .map(|id| (id.clone(), id))
            .collect();
        Self { entries }
    }

    /// Route an extra domain column to a region id. Replaces an
    /// existing route to the same region.
    pub fn with_alias(mut self, column: impl Into<String>, region_id: impl Into<String>) -> Self {
        let region_id = region_id.into();
        self.entries.retain(|(_, r)| *r != region_id);
        self.entries.push((column.into(), region_id));
        self
    }

    /// Parse `column=region` override specs on top of the identity map.
    /// A spec routing to a region the template does not declare is a
    /// mapping error up front.
    pub fn from_specs(session: &Session, specs: &[String]) -> LabelkitResult<Self> {
        let known = session.region_ids();
        let mut map = Self::identity(session);
        for spec in specs {
            let (column, region) = spec.split_once('=').ok_or_else(|| {
                LabelkitError::mapping(format!("field map '{spec}' is not column=region"))
            })?;
            let region = region.trim();
            if !known.iter().any(|id| id == region) {
                return Err(LabelkitError::mapping(format!(
                    "field map '{spec}' routes to unknown region '{region}'"
                )));
            }
            map = map.with_alias(column.trim(), region);
        }
        Ok(map)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(c, r)| (c.as_str(), r.as_str()))
    }

    fn region_for_column(&self, column: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, r)| r.as_str())
    }
}

/// Stages of the per-record state machine, for failure context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStage {
    Mapped,
    Updating,
    AwaitingReady,
    Extracted,
    Validated,
    Written,
}

#[derive(Debug)]
pub enum RecordOutcome {
    Written { filename: String, bytes: usize },
    Failed { stage: RecordStage, error: LabelkitError },
}

#[derive(Debug)]
pub struct RecordResult {
    pub index: usize,
    pub outcome: RecordOutcome,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct BatchReport {
    pub results: Vec<RecordResult>,
    pub summary: BatchSummary,
}

#[derive(Clone, Debug)]
pub struct BatchOptions {
    pub out_dir: PathBuf,
}

struct RecordFailure {
    stage: RecordStage,
    error: LabelkitError,
}

/// Run every record against the session, isolating failures per record
/// and reporting an aggregate summary. The session should already be
/// primed so static regions (logos) are resolved.
pub async fn run_batch(
    session: &Session,
    records: &[BatchRecord],
    map: &FieldMap,
    opts: &BatchOptions,
) -> LabelkitResult<BatchReport> {
    tokio::fs::create_dir_all(&opts.out_dir).await?;

    if let Some(first) = records.first() {
        warn_unmatched_columns(first, map);
    }

    let started = Instant::now();
    let mut results = Vec::with_capacity(records.len());
    let mut summary = BatchSummary::default();

    for record in records {
        summary.attempted += 1;
        let outcome = match process_record(session, record, map, &opts.out_dir).await {
            Ok((filename, bytes)) => {
                summary.succeeded += 1;
                tracing::info!(record = record.index, %filename, bytes, "label written");
                RecordOutcome::Written { filename, bytes }
            }
            Err(failure) => {
                // A raster failure means the shared surface itself is
                // broken; abort the run with full context.
                if matches!(failure.error, LabelkitError::Raster(_)) {
                    return Err(LabelkitError::raster(format!(
                        "fatal at record {} ({:?}): {}",
                        record.index, failure.stage, failure.error
                    )));
                }
                summary.failed += 1;
                tracing::warn!(
                    record = record.index,
                    stage = ?failure.stage,
                    error = %failure.error,
                    "record failed"
                );
                RecordOutcome::Failed {
                    stage: failure.stage,
                    error: failure.error,
                }
            }
        };
        results.push(RecordResult {
            index: record.index,
            outcome,
        });
    }

    summary.elapsed = started.elapsed();
    tracing::info!(
        attempted = summary.attempted,
        succeeded = summary.succeeded,
        failed = summary.failed,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "batch complete"
    );
    Ok(BatchReport { results, summary })
}

/// Columns in the record that route to no known region are advisory
/// only; they are ignored, not fatal.
fn warn_unmatched_columns(first: &BatchRecord, map: &FieldMap) {
    let unmatched: Vec<&str> = first
        .columns()
        .filter(|c| map.region_for_column(c).is_none())
        .collect();
    if !unmatched.is_empty() {
        tracing::warn!(columns = ?unmatched, "CSV columns match no template region; ignored");
    }
}

async fn process_record(
    session: &Session,
    record: &BatchRecord,
    map: &FieldMap,
    out_dir: &Path,
) -> Result<(String, usize), RecordFailure> {
    let fail = |stage, error| RecordFailure { stage, error };

    // Mapped: resolve every route up front; a required region with a
    // missing or empty value fails the record before any mutation.
    let mut updates: Vec<(String, String)> = Vec::new();
    let required = session.required_region_ids();
    for (column, region_id) in map.entries() {
        match record.get(column) {
            Some(value) if !value.trim().is_empty() => {
                updates.push((region_id.to_string(), value.to_string()));
            }
            _ if required.iter().any(|r| r == region_id) => {
                return Err(fail(
                    RecordStage::Mapped,
                    LabelkitError::mapping(format!(
                        "record {}: required field '{region_id}' (column '{column}') is missing or empty",
                        record.index
                    )),
                ));
            }
            // A present-but-empty optional column still applies: it
            // clears the region so the previous record's value cannot
            // leak into this label.
            Some(_) => updates.push((region_id.to_string(), String::new())),
            None => {}
        }
    }
    for region_id in &required {
        if !map.entries().any(|(_, r)| r == region_id) {
            return Err(fail(
                RecordStage::Mapped,
                LabelkitError::mapping(format!(
                    "record {}: required field '{region_id}' has no mapping",
                    record.index
                )),
            ));
        }
    }

    // Updating / AwaitingReady: strictly sequential, one ready observed
    // per effective update before the next begins.
    for (region_id, value) in &updates {
        let seen = session.version();
        let applied = session
            .update_field(region_id, value)
            .await
            .map_err(|e| fail(RecordStage::Updating, e))?;
        match applied {
            Update::Applied => {
                session
                    .ready_after(seen)
                    .await
                    .map_err(|e| fail(RecordStage::AwaitingReady, e))?;
            }
            Update::Unchanged | Update::UnknownField => {}
        }
    }

    // Extracted.
    let artifact = session.artifact().ok_or_else(|| {
        fail(
            RecordStage::Extracted,
            LabelkitError::validation(format!(
                "record {}: no rendered artifact available",
                record.index
            )),
        )
    })?;

    // Validated: non-empty bytes carrying the canonical PNG signature.
    if artifact.png.is_empty() || !artifact.png.starts_with(&PNG_SIGNATURE) {
        return Err(fail(
            RecordStage::Validated,
            LabelkitError::validation(format!(
                "record {}: artifact is empty or not a PNG",
                record.index
            )),
        ));
    }

    // Written: derived name, collision overwrites.
    let filename = derive_filename(session.title().as_deref(), record.index);
    let path = out_dir.join(&filename);
    tokio::fs::write(&path, &artifact.png)
        .await
        .map_err(|e| fail(RecordStage::Written, LabelkitError::Io(e)))?;

    Ok((filename, artifact.png.len()))
}

/// Sanitize a human label into a filesystem-safe stem: path separators,
/// control characters and punctuation become dashes, runs of dashes
/// collapse, edge dashes are trimmed. Pure and deterministic.
pub fn sanitize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut prev_dash = false;
    for c in label.trim().chars() {
        if c.is_alphanumeric() {
            out.push(c);
            prev_dash = false;
        } else if !prev_dash {
            out.push('-');
            prev_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

fn derive_filename(title: Option<&str>, index: usize) -> String {
    let stem = title.map(sanitize_label).unwrap_or_default();
    if stem.is_empty() {
        format!("label-{:04}.png", index + 1)
    } else {
        format!("{stem}.png")
    }
}
