//! Streaming reduction of per-sample result files into gzip summary tables.
//!
//! Two reductions are provided:
//!
//! * [`filtered_union`]: concatenates tab-separated tables, prefixing every
//!   row with its sample id and keeping only rows whose value column is
//!   strictly positive. Header is taken from the first file; every other
//!   file must carry the same header.
//! * [`collate_scalar`]: pulls `n_processed` out of each sample's run-info
//!   JSON record and writes one `sample\tn_processed` row per sample.
//!
//! Inputs are visited in the order given (callers pass sorted sample
//! order) and read line by line, so memory stays bounded by the longest
//! line. Output goes to a temporary file next to the destination and is
//! renamed into place only when the reduction succeeds.

use std::fs;
use std::io::{self, BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;
use log::{debug, warn};
use serde::Deserialize;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::config::defs::{N_PROCESSED_FIELD, SAMPLE_COLUMN, TPM_FIELD_INDEX};
use crate::utils::file::open_text;

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("{path}:{line}: malformed record: {reason}")]
    MalformedRecord {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{path}: header '{found}' does not match '{expected}'")]
    HeaderMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("{path}: {error}")]
    Io { path: PathBuf, error: String },
}

impl AggregateError {
    fn io(path: &Path, error: io::Error) -> Self {
        AggregateError::Io {
            path: path.to_path_buf(),
            error: error.to_string(),
        }
    }
}

/// What to do with a malformed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggregateMode {
    /// Abort the whole reduction on the first bad record.
    #[default]
    Strict,
    /// Record the error, skip the record (or file) and keep going.
    BestEffort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOptions {
    /// Zero-based column holding the value to filter on.
    pub value_field: usize,
    pub mode: AggregateMode,
}

impl Default for AggregateOptions {
    fn default() -> Self {
        AggregateOptions {
            value_field: TPM_FIELD_INDEX,
            mode: AggregateMode::Strict,
        }
    }
}

#[derive(Debug, Default)]
pub struct AggregateReport {
    pub files: usize,
    pub rows_written: usize,
    pub rows_filtered: usize,
    pub errors: Vec<AggregateError>,
}

/// Schema of a quantifier run-info record. Only `n_processed` is required.
#[derive(Debug, Clone, Deserialize)]
pub struct RunInfo {
    pub n_processed: u64,
    #[serde(default)]
    pub n_targets: Option<u64>,
    #[serde(default)]
    pub n_pseudoaligned: Option<u64>,
    #[serde(default)]
    pub n_unique: Option<u64>,
    #[serde(default)]
    pub p_pseudoaligned: Option<f64>,
    #[serde(default)]
    pub kallisto_version: Option<String>,
}

/// A collation step, fully resolved, ready to run on a blocking thread.
#[derive(Debug, Clone)]
pub enum CollateJob {
    FilteredUnion {
        inputs: Vec<(String, PathBuf)>,
        output: PathBuf,
        options: AggregateOptions,
    },
    Scalar {
        inputs: Vec<(String, PathBuf)>,
        output: PathBuf,
        options: AggregateOptions,
    },
}

impl CollateJob {
    pub fn run(&self) -> Result<AggregateReport, AggregateError> {
        match self {
            CollateJob::FilteredUnion { inputs, output, options } => filtered_union(inputs, output, *options),
            CollateJob::Scalar { inputs, output, options } => collate_scalar(inputs, output, *options),
        }
    }

    /// One-line summary for logs and dry runs.
    pub fn describe(&self) -> String {
        match self {
            CollateJob::FilteredUnion { inputs, output, options } => format!(
                "union of {} tables where field {} > 0 -> {}",
                inputs.len(),
                options.value_field,
                output.display()
            ),
            CollateJob::Scalar { inputs, output, .. } => format!(
                "{} of {} run-info records -> {}",
                N_PROCESSED_FIELD,
                inputs.len(),
                output.display()
            ),
        }
    }
}

/// Gzip writer that lands on its destination only after `finish`.
struct GzOutput {
    path: PathBuf,
    encoder: GzEncoder<BufWriter<NamedTempFile>>,
}

impl GzOutput {
    fn create(path: &Path) -> Result<Self, AggregateError> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| AggregateError::io(path, e))?;
        let tmp = NamedTempFile::new_in(&dir).map_err(|e| AggregateError::io(path, e))?;
        Ok(GzOutput {
            path: path.to_path_buf(),
            encoder: GzEncoder::new(BufWriter::new(tmp), Compression::default()),
        })
    }

    fn write_row(&mut self, sample: &str, rest: &str) -> Result<(), AggregateError> {
        writeln!(self.encoder, "{sample}\t{rest}").map_err(|e| AggregateError::io(&self.path, e))
    }

    fn finish(self) -> Result<(), AggregateError> {
        let path = self.path;
        let buffered = self.encoder.finish().map_err(|e| AggregateError::io(&path, e))?;
        let tmp = buffered
            .into_inner()
            .map_err(|e| AggregateError::io(&path, e.into_error()))?;
        tmp.persist(&path).map_err(|e| AggregateError::io(&path, e.error))?;
        Ok(())
    }
}

fn handle(mode: AggregateMode, report: &mut AggregateReport, err: AggregateError) -> Result<(), AggregateError> {
    match mode {
        AggregateMode::Strict => Err(err),
        AggregateMode::BestEffort => {
            warn!("Skipping malformed input: {}", err);
            report.errors.push(err);
            Ok(())
        }
    }
}

/// Extracts the filter value from one data line.
fn parse_value(line: &str, field: usize) -> Result<f64, String> {
    let raw = line
        .split('\t')
        .nth(field)
        .ok_or_else(|| format!("missing field {field}"))?;
    raw.trim()
        .parse::<f64>()
        .map_err(|e| format!("field {field} '{raw}' is not a number: {e}"))
}

/// Union of per-sample tables, keeping rows whose value is strictly positive.
///
/// # Arguments
///
/// * `inputs` - (sample id, table path) pairs, in output order.
/// * `output` - Destination `.gz` path.
/// * `options` - Value column and error mode.
///
/// # Returns
/// AggregateReport with row counts and, in best-effort mode, the skipped errors.
pub fn filtered_union(
    inputs: &[(String, PathBuf)],
    output: &Path,
    options: AggregateOptions,
) -> Result<AggregateReport, AggregateError> {
    let mut out = GzOutput::create(output)?;
    let mut report = AggregateReport::default();
    let mut header: Option<String> = None;

    for (sample, path) in inputs {
        if let Err(e) = union_one(sample, path, &mut header, &mut out, options, &mut report) {
            handle(options.mode, &mut report, e)?;
        }
        report.files += 1;
    }

    out.finish()?;
    debug!(
        "Wrote {} rows ({} filtered) from {} files to {}",
        report.rows_written,
        report.rows_filtered,
        report.files,
        output.display()
    );
    Ok(report)
}

fn union_one(
    sample: &str,
    path: &Path,
    header: &mut Option<String>,
    out: &mut GzOutput,
    options: AggregateOptions,
    report: &mut AggregateReport,
) -> Result<(), AggregateError> {
    let reader = open_text(path).map_err(|e| AggregateError::io(path, e))?;
    let mut lines = reader.lines();

    let first = match lines.next() {
        Some(line) => line.map_err(|e| AggregateError::io(path, e))?,
        None => {
            return Err(AggregateError::MalformedRecord {
                path: path.to_path_buf(),
                line: 1,
                reason: "missing header".to_string(),
            });
        }
    };
    let first = first.trim_end_matches('\r');

    match header {
        None => {
            out.write_row(SAMPLE_COLUMN, first)?;
            *header = Some(first.to_string());
        }
        Some(expected) if expected != first => {
            return Err(AggregateError::HeaderMismatch {
                path: path.to_path_buf(),
                expected: expected.clone(),
                found: first.to_string(),
            });
        }
        Some(_) => {}
    }

    for (n, line) in lines.enumerate() {
        let line = line.map_err(|e| AggregateError::io(path, e))?;
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        match parse_value(line, options.value_field) {
            Ok(value) if value > 0.0 => {
                out.write_row(sample, line)?;
                report.rows_written += 1;
            }
            Ok(_) => report.rows_filtered += 1,
            Err(reason) => {
                let err = AggregateError::MalformedRecord {
                    path: path.to_path_buf(),
                    line: n + 2,
                    reason,
                };
                handle(options.mode, report, err)?;
            }
        }
    }
    Ok(())
}

/// One `sample\tn_processed` row per run-info record.
///
/// # Arguments
///
/// * `inputs` - (sample id, run-info JSON path) pairs, in output order.
/// * `output` - Destination `.gz` path.
/// * `options` - Error mode; the value column is not used here.
///
/// # Returns
/// AggregateReport with one row per readable record.
pub fn collate_scalar(
    inputs: &[(String, PathBuf)],
    output: &Path,
    options: AggregateOptions,
) -> Result<AggregateReport, AggregateError> {
    let mut out = GzOutput::create(output)?;
    let mut report = AggregateReport::default();
    out.write_row(SAMPLE_COLUMN, N_PROCESSED_FIELD)?;

    for (sample, path) in inputs {
        match read_run_info(path) {
            Ok(info) => {
                out.write_row(sample, &info.n_processed.to_string())?;
                report.rows_written += 1;
            }
            Err(e) => handle(options.mode, &mut report, e)?,
        }
        report.files += 1;
    }

    out.finish()?;
    Ok(report)
}

pub fn read_run_info(path: &Path) -> Result<RunInfo, AggregateError> {
    let reader = open_text(path).map_err(|e| AggregateError::io(path, e))?;
    serde_json::from_reader(reader).map_err(|e| AggregateError::MalformedRecord {
        path: path.to_path_buf(),
        line: e.line(),
        reason: e.to_string(),
    })
}
