//! Reference index, per-sample kallisto quantification and collation.
//!
//! Task layout under the output directory:
//!
//! ```text
//! reference/<stem>.fa            decompress_reference (gzipped reference only)
//! reference/<stem>.idx           index
//! quant/<sample>/abundance.tsv   quant[<sample>]
//! quant/<sample>/run_info.json   quant[<sample>]
//! quant/<sample>/abundance.tsv.gz compress_abundance[<sample>]
//! abundance.tsv.gz               collate_abundance
//! n_processed.tsv.gz             collate_counts
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::config::defs::{
    PipelineError, RunConfig, ABUNDANCE_TSV, ABUNDANCE_TSV_GZ, COLLATE_ABUNDANCE_TASK, COLLATE_COUNTS_TASK,
    COMPRESS_ABUNDANCE_TASK, DECOMPRESS_REFERENCE_TASK, FASTA_EXTS, GZIP_TAG, INDEX_EXT, INDEX_TASK, KALLISTO_TAG,
    N_PROCESSED_TSV_GZ, QUANT_DIR, QUANT_TASK, REFERENCE_DIR, RUN_INFO_JSON, SAMPLE_WILDCARD,
};
use crate::config::manifest::{load_manifest, Sample};
use crate::dag::{
    expand_all, plan, CommandBuilder, DependencyGraph, ProcessExecutor, Resources, RunSummary, Scheduler,
    SchedulerOptions, Staleness, TaskTemplate,
};
use crate::utils::command::{check_versions, KallistoCommandBuilder};
use crate::utils::file::{extension_remover, file_path_manipulator, is_gzipped};

/// A task the dry run predicts will execute.
#[derive(Debug, Clone)]
pub struct PlannedTask {
    pub id: String,
    pub reason: Staleness,
    pub command: String,
}

/// Pattern text for a concrete path. Braces would be read as placeholders.
fn path_pattern(path: &Path) -> Result<String, PipelineError> {
    let text = path.to_string_lossy().to_string();
    if text.contains('{') || text.contains('}') {
        return Err(PipelineError::InvalidConfig(format!(
            "Path {} contains '{{' or '}}', which is reserved for placeholders",
            text
        )));
    }
    Ok(text)
}

fn sample_placeholder() -> String {
    format!("{{{}}}", SAMPLE_WILDCARD)
}

/// Paths of the reference artifacts.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// (decompressed FASTA if the reference is gzipped, index)
pub fn reference_paths(config: &RunConfig) -> Result<(Option<PathBuf>, PathBuf), PipelineError> {
    let reference_dir = config.out_dir.join(REFERENCE_DIR);
    let stem = PathBuf::from(extension_remover(&config.reference));

    let gzipped = is_gzipped(&config.reference)
        .map_err(|e| PipelineError::IOError(format!("{}: {}", config.reference.display(), e)))?;
    let fasta = gzipped.then(|| file_path_manipulator(&stem, Some(reference_dir.as_path()), None, Some("fa"), "."));
    let index = file_path_manipulator(&stem, Some(reference_dir.as_path()), None, Some(INDEX_EXT), ".");
    Ok((fasta, index))
}

/// Declares the pipeline's task templates, in declaration order.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// Vec<TaskTemplate>
pub fn registry(config: &RunConfig) -> Result<Vec<TaskTemplate>, PipelineError> {
    let sample_dir = config.out_dir.join(QUANT_DIR);
    let sample_dir = format!("{}/{}", path_pattern(&sample_dir)?, sample_placeholder());
    let abundance = format!("{sample_dir}/{ABUNDANCE_TSV}");
    let run_info = format!("{sample_dir}/{RUN_INFO_JSON}");
    let abundance_gz = format!("{sample_dir}/{ABUNDANCE_TSV_GZ}");

    let reference = path_pattern(&config.reference)?;
    let (fasta, index) = reference_paths(config)?;
    let index = path_pattern(&index)?;

    let mut templates = Vec::new();

    let index_input = match fasta {
        Some(fasta) => {
            let fasta = path_pattern(&fasta)?;
            templates.push(
                TaskTemplate::unparameterized(DECOMPRESS_REFERENCE_TASK)
                    .input(&reference)
                    .output(&fasta),
            );
            fasta
        }
        None => reference,
    };

    templates.push(
        TaskTemplate::unparameterized(INDEX_TASK)
            .input(index_input)
            .output(&index),
    );

    templates.push(
        TaskTemplate::per_sample(QUANT_TASK)
            .input(&index)
            .sample_reads()
            .output(&abundance)
            .output(&run_info)
            .arg(&sample_dir)
            .resources(Resources::threads(config.quant_threads)),
    );

    templates.push(
        TaskTemplate::per_sample(COMPRESS_ABUNDANCE_TASK)
            .input(&abundance)
            .output(&abundance_gz),
    );

    templates.push(
        TaskTemplate::unparameterized(COLLATE_ABUNDANCE_TASK)
            .input_each_sample(&abundance)
            .arg_each_sample(sample_placeholder())
            .output(path_pattern(&config.out_dir.join(ABUNDANCE_TSV_GZ))?),
    );

    templates.push(
        TaskTemplate::unparameterized(COLLATE_COUNTS_TASK)
            .input_each_sample(&run_info)
            .arg_each_sample(sample_placeholder())
            .output(path_pattern(&config.out_dir.join(N_PROCESSED_TSV_GZ))?),
    );

    Ok(templates)
}

/// Files the pipeline consumes but no task produces: the reference and
/// every read file. All must exist.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
/// * `samples` - Loaded manifest.
///
/// # Returns
/// HashSet of external input paths.
pub fn external_inputs(config: &RunConfig, samples: &[Sample]) -> Result<HashSet<PathBuf>, PipelineError> {
    let mut external = HashSet::new();
    let reads = samples.iter().flat_map(|s| s.interleaved_reads());
    for path in std::iter::once(config.reference.clone()).chain(reads) {
        if !path.is_file() {
            return Err(PipelineError::MissingInput(path));
        }
        external.insert(crate::utils::file::clean_path(&path));
    }
    Ok(external)
}

fn check_reference_extension(reference: &Path) {
    let name = reference.to_string_lossy();
    let name = name.strip_suffix(".gz").unwrap_or(name.as_ref());
    let known = Path::new(name)
        .extension()
        .map(|ext| FASTA_EXTS.iter().any(|fa| ext.eq_ignore_ascii_case(fa)))
        .unwrap_or(false);
    if !known {
        warn!(
            "Reference {} does not have a FASTA extension ({})",
            reference.display(),
            FASTA_EXTS.join(", ")
        );
    }
}

/// Loads the manifest, expands the registry and builds the dependency
/// graph. Nothing runs; graph errors surface here.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
///
/// # Returns
/// DependencyGraph
pub fn prepare(config: &RunConfig) -> Result<DependencyGraph, PipelineError> {
    let samples = load_manifest(&config.samples_manifest)?;
    info!(
        "Loaded {} samples from {}",
        samples.len(),
        config.samples_manifest.display()
    );
    debug!("Samples: {:?}", samples.iter().map(|s| &s.id).collect::<Vec<_>>());

    check_reference_extension(&config.reference);
    let external = external_inputs(config, &samples)?;
    let templates = registry(config)?;
    let instances = expand_all(&templates, &samples)?;
    let graph = DependencyGraph::build(instances, &external)?;
    info!("{} tasks in the dependency graph", graph.len());
    Ok(graph)
}

/// Predicts which tasks a run would execute and with which commands.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
/// * `graph` - From prepare.
///
/// # Returns
/// Vec<PlannedTask> in execution order.
pub fn dry_run(config: Arc<RunConfig>, graph: &DependencyGraph) -> Result<Vec<PlannedTask>, PipelineError> {
    let builder = KallistoCommandBuilder::new(config.clone());
    let planned = plan(graph, config.force)?;

    let mut tasks = Vec::with_capacity(planned.len());
    for (i, reason) in planned {
        let task = graph.task(i);
        let command = builder
            .invocation(task)
            .map(|inv| inv.display())
            .map_err(PipelineError::Other)?;
        info!("Would run {} ({}): {}", task.id, reason, command);
        tasks.push(PlannedTask {
            id: task.id.clone(),
            reason,
            command,
        });
    }
    info!("{} of {} tasks would run", tasks.len(), graph.len());
    Ok(tasks)
}

/// Schedules the graph with the production executor and returns the
/// summary whatever the outcome.
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
/// * `graph` - From prepare.
/// * `cancel` - Cancels the run when triggered.
///
/// # Returns
/// RunSummary
pub async fn execute(config: Arc<RunConfig>, graph: &DependencyGraph, cancel: CancellationToken) -> RunSummary {
    let mut options = SchedulerOptions::new(config.capacity);
    options.memory_capacity_mb = config.memory_capacity_mb;
    options.force = config.force;
    info!(
        "Scheduling with capacity {} threads{}",
        options.capacity,
        options
            .memory_capacity_mb
            .map(|mb| format!(" and {} MiB", mb))
            .unwrap_or_default()
    );

    let executor = Arc::new(ProcessExecutor::new(
        KallistoCommandBuilder::new(config.clone()),
        config.args.verbose,
    ));
    Scheduler::new(options).run(graph, executor, cancel).await
}

/// Run function for the kallisto quantification pipeline
///
/// # Arguments
///
/// * `config` - RunConfig struct from main.
/// * `cancel` - Cancels the run when triggered (ctrl-c in main).
///
/// # Returns
/// Result<(), PipelineError>
pub async fn run(config: Arc<RunConfig>, cancel: CancellationToken) -> Result<(), PipelineError> {
    let start = Instant::now();
    let graph = prepare(&config)?;

    if config.dry_run {
        dry_run(config, &graph)?;
        return Ok(());
    }

    // External tools check
    check_versions(&[
        (KALLISTO_TAG, config.kallisto_bin.as_str()),
        (GZIP_TAG, config.gzip_bin.as_str()),
    ])
    .await
    .map_err(|e| PipelineError::ToolExecution {
        tool: "version check".to_string(),
        error: e.to_string(),
    })?;

    let summary = execute(config.clone(), &graph, cancel).await;

    info!(
        "Executed {}, up to date {}, failed {}, blocked {} in {:.1}s (peak {} threads)",
        summary.executed.len(),
        summary.up_to_date.len(),
        summary.failed.len(),
        summary.blocked.len(),
        start.elapsed().as_secs_f64(),
        summary.peak_threads
    );
    for (id, err) in &summary.failed {
        error!("Task {} failed: {}", id, err);
    }
    if !summary.blocked.is_empty() {
        warn!("Blocked: {}", summary.blocked.join(", "));
    }

    if summary.cancelled {
        return Err(PipelineError::Cancelled);
    }
    if !summary.is_success() {
        return Err(PipelineError::RunFailed {
            failed: summary.failed.len(),
            blocked: summary.blocked.len(),
        });
    }
    Ok(())
}
