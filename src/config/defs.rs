use std::path::PathBuf;
use lazy_static::lazy_static;
use log::warn;
use std::collections::HashMap;
use thiserror::Error;

use crate::cli::Arguments;
use crate::config::manifest::ManifestError;
use crate::dag::{GraphError, TemplateError};
use crate::utils::aggregate::AggregateMode;

// External software
pub const GZIP_EXT: &str = "gz";
pub const KALLISTO_TAG: &str = "kallisto";
pub const GZIP_TAG: &str = "gzip";


lazy_static! {
    /// Minimum (major, minor) version of every external tool.
    pub static ref TOOL_VERSIONS: HashMap<&'static str, (u32, u32)> = {
        let mut m = HashMap::new();
        m.insert(KALLISTO_TAG, (0, 46));
        m.insert(GZIP_TAG, (1, 6));

        m
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KallistoSubcommand {
    Index,
    Quant,
}

// Task template names
pub const DECOMPRESS_REFERENCE_TASK: &str = "decompress_reference";
pub const INDEX_TASK: &str = "index";
pub const QUANT_TASK: &str = "quant";
pub const COMPRESS_ABUNDANCE_TASK: &str = "compress_abundance";
pub const COLLATE_ABUNDANCE_TASK: &str = "collate_abundance";
pub const COLLATE_COUNTS_TASK: &str = "collate_counts";

// Static Filenames
pub const ABUNDANCE_TSV: &str = "abundance.tsv";
pub const RUN_INFO_JSON: &str = "run_info.json";
pub const ABUNDANCE_TSV_GZ: &str = "abundance.tsv.gz";
pub const N_PROCESSED_TSV_GZ: &str = "n_processed.tsv.gz";
pub const REFERENCE_DIR: &str = "reference";
pub const QUANT_DIR: &str = "quant";
pub const INDEX_EXT: &str = "idx";


// Static Parameters
pub const SAMPLE_WILDCARD: &str = "sample";
pub const SAMPLE_COLUMN: &str = "sample";
pub const N_PROCESSED_FIELD: &str = "n_processed";
pub const TPM_FIELD_INDEX: usize = 4;
pub const DEFAULT_QUANT_THREADS: usize = 4;
pub const DEFAULT_BOOTSTRAPS: u32 = 100;
pub const CAPTURE_TAIL_BYTES: usize = 4096;

pub const FASTA_EXTS: &[&'static str] = &["fasta", "fa", "fna", "ffn", "frn"];


/// Immutable settings for one pipeline invocation. Built once in `main` and
/// shared behind an `Arc`; nothing writes to it afterwards.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub cwd: PathBuf,
    pub out_dir: PathBuf,
    pub reference: PathBuf,
    pub samples_manifest: PathBuf,
    pub bootstraps: u32,
    pub quant_threads: usize,
    pub capacity: usize,
    pub memory_capacity_mb: Option<u64>,
    pub seed: Option<u64>,
    pub value_field: usize,
    pub aggregate_mode: AggregateMode,
    pub force: bool,
    pub dry_run: bool,
    pub kallisto_bin: String,
    pub gzip_bin: String,
    pub args: Arguments,
}


impl RunConfig {
    /// Freezes parsed arguments into a run configuration. Relative paths
    /// are resolved against `cwd`.
    ///
    /// # Arguments
    ///
    /// * `args` - Parsed command line.
    /// * `cwd` - Working directory.
    /// * `out_dir` - Output directory, already created.
    /// * `capacity` - Scheduler thread capacity.
    ///
    /// # Returns
    /// Result<RunConfig, PipelineError>
    pub fn from_args(args: Arguments, cwd: PathBuf, out_dir: PathBuf, capacity: usize) -> Result<Self, PipelineError> {
        if args.reference.is_empty() {
            return Err(PipelineError::InvalidConfig("--reference is required".to_string()));
        }
        if args.samples.is_empty() {
            return Err(PipelineError::InvalidConfig("--samples is required".to_string()));
        }
        if args.threads == 0 {
            return Err(PipelineError::InvalidConfig("--threads must be at least 1".to_string()));
        }

        let resolve = |p: &str| {
            let path = PathBuf::from(p);
            if path.is_absolute() { path } else { cwd.join(path) }
        };
        let capacity = capacity.max(1);
        let quant_threads = if args.threads > capacity {
            warn!(
                "--threads {} exceeds the scheduler capacity of {}; using {}",
                args.threads, capacity, capacity
            );
            capacity
        } else {
            args.threads
        };
        let aggregate_mode = if args.best_effort {
            AggregateMode::BestEffort
        } else {
            AggregateMode::Strict
        };

        Ok(RunConfig {
            reference: resolve(&args.reference),
            samples_manifest: resolve(&args.samples),
            out_dir,
            bootstraps: args.bootstraps,
            quant_threads,
            capacity,
            memory_capacity_mb: args.memory_mb,
            seed: args.seed,
            value_field: args.value_field,
            aggregate_mode,
            force: args.force,
            dry_run: args.dry_run,
            kallisto_bin: args.kallisto.clone(),
            gzip_bin: args.gzip.clone(),
            cwd,
            args,
        })
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Missing input file: {0}")]
    MissingInput(PathBuf),

    #[error("Tool {tool} failed: {error}")]
    ToolExecution { tool: String, error: String },

    #[error("I/O error: {0}")]
    IOError(String),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("Run finished with {failed} failed and {blocked} blocked task(s)")]
    RunFailed { failed: usize, blocked: usize },

    #[error("Run cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::IOError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Arguments {
        let mut argv = vec!["seqtoid-quant", "--reference", "tx.fa", "--samples", "samples.yaml"];
        argv.extend_from_slice(extra);
        Arguments::try_parse_from(argv).unwrap()
    }

    #[test]
    fn quant_threads_never_exceed_capacity() {
        let config = RunConfig::from_args(args(&["--threads", "8"]), "/work".into(), "/work/out".into(), 2).unwrap();
        assert_eq!(config.capacity, 2);
        assert_eq!(config.quant_threads, 2);

        let config = RunConfig::from_args(args(&["--threads", "3"]), "/work".into(), "/work/out".into(), 16).unwrap();
        assert_eq!(config.quant_threads, 3);
    }

    #[test]
    fn relative_paths_resolve_against_cwd() {
        let config = RunConfig::from_args(args(&["--best-effort"]), "/work".into(), "/work/out".into(), 4).unwrap();
        assert_eq!(config.reference, PathBuf::from("/work/tx.fa"));
        assert_eq!(config.samples_manifest, PathBuf::from("/work/samples.yaml"));
        assert_eq!(config.aggregate_mode, AggregateMode::BestEffort);
    }
}
