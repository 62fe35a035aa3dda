//! Functions and structs for building the command lines of the quantification pipeline

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::{debug, info};

use crate::config::defs::{
    RunConfig, COLLATE_ABUNDANCE_TASK, COLLATE_COUNTS_TASK, COMPRESS_ABUNDANCE_TASK,
    DECOMPRESS_REFERENCE_TASK, GZIP_TAG, INDEX_TASK, KALLISTO_TAG, QUANT_TASK, TOOL_VERSIONS,
    KallistoSubcommand,
};
use crate::dag::runner::{CommandBuilder, CommandLine, Invocation};
use crate::dag::template::TaskInstance;
use crate::utils::aggregate::{AggregateOptions, CollateJob};

pub mod kallisto {
    use std::path::PathBuf;

    use anyhow::{anyhow, Result};
    use tokio::process::Command;

    use crate::config::defs::{KallistoSubcommand, RunConfig};
    use crate::utils::streams::{read_child_output_to_vec, ChildStream};

    #[derive(Debug, Clone)]
    pub struct KallistoConfig {
        pub subcommand: KallistoSubcommand,
        pub index: PathBuf,
        /// Quant output directory; unused by `index`.
        pub output_dir: Option<PathBuf>,
        /// Reference FASTA for `index`, interleaved reads for `quant`.
        pub inputs: Vec<PathBuf>,
        pub threads: usize,
    }

    /// Runs `<bin> version` and returns the reported version string.
    pub async fn kallisto_presence_check(bin: &str) -> Result<String> {
        let mut child = Command::new(bin)
            .arg("version")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is kallisto installed?", bin, e))?;

        let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
        child.wait().await?;
        let first_line = lines
            .first()
            .ok_or_else(|| anyhow!("No output from {} version", bin))?;
        // "kallisto, version 0.46.2"
        let version = first_line
            .split_whitespace()
            .last()
            .ok_or_else(|| anyhow!("Invalid {} version output: {}", bin, first_line))?
            .to_string();
        Ok(version)
    }

    pub fn arg_generator(config: &RunConfig, kallisto_config: &KallistoConfig) -> Result<Vec<String>> {
        let mut args_vec: Vec<String> = Vec::new();

        match kallisto_config.subcommand {
            KallistoSubcommand::Index => {
                args_vec.push("index".to_string());
                args_vec.push("-i".to_string());
                args_vec.push(kallisto_config.index.to_string_lossy().to_string());
            }
            KallistoSubcommand::Quant => {
                let output_dir = kallisto_config
                    .output_dir
                    .as_ref()
                    .ok_or_else(|| anyhow!("kallisto quant needs an output directory"))?;
                args_vec.push("quant".to_string());
                args_vec.push("-i".to_string());
                args_vec.push(kallisto_config.index.to_string_lossy().to_string());
                args_vec.push("-o".to_string());
                args_vec.push(output_dir.to_string_lossy().to_string());
                args_vec.push("-b".to_string());
                args_vec.push(config.bootstraps.to_string());
                args_vec.push("-t".to_string());
                args_vec.push(kallisto_config.threads.to_string());
                if let Some(seed) = config.seed {
                    args_vec.push("--seed".to_string());
                    args_vec.push(seed.to_string());
                }
            }
        }

        if kallisto_config.inputs.is_empty() {
            return Err(anyhow!("kallisto {:?} called without inputs", kallisto_config.subcommand));
        }
        args_vec.extend(kallisto_config.inputs.iter().map(|p| p.to_string_lossy().to_string()));
        Ok(args_vec)
    }
}

pub mod gzip {
    use std::path::Path;

    use anyhow::{anyhow, Result};
    use tokio::process::Command;

    use crate::utils::streams::{read_child_output_to_vec, ChildStream};

    /// Runs `<bin> --version` and returns the reported version string.
    pub async fn gzip_presence_check(bin: &str) -> Result<String> {
        let mut child = Command::new(bin)
            .arg("--version")
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| anyhow!("Failed to spawn {}: {}. Is gzip installed?", bin, e))?;

        let lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
        child.wait().await?;
        let first_line = lines
            .first()
            .ok_or_else(|| anyhow!("No output from {} --version", bin))?;
        // "gzip 1.12"
        let version = first_line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| anyhow!("Invalid {} --version output: {}", bin, first_line))?
            .to_string();
        Ok(version)
    }

    /// Decompress to stdout.
    pub fn decompress_args(input: &Path) -> Vec<String> {
        vec!["-dc".to_string(), input.to_string_lossy().to_string()]
    }

    /// Compress to stdout without storing name or timestamp, so identical
    /// input gives byte-identical output.
    pub fn compress_args(input: &Path) -> Vec<String> {
        vec!["-c".to_string(), "-n".to_string(), input.to_string_lossy().to_string()]
    }
}

/// Parses the leading `major.minor` of a version string, e.g. `0.46.2`
/// or `v1.12`.
pub fn parse_version(version: &str) -> Result<(u32, u32)> {
    let trimmed = version.trim().trim_start_matches('v');
    let mut parts = trimmed.split('.');
    let major = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(|| anyhow!("Cannot parse version '{}'", version))?;
    let minor = parts
        .next()
        .map(|p| p.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
        .and_then(|p| p.parse::<u32>().ok())
        .unwrap_or(0);
    Ok((major, minor))
}

/// Presence check for one tool, identified by its tag, run through `bin`.
pub async fn check_version(tool: &str, bin: &str) -> Result<String> {
    let version = match tool {
        KALLISTO_TAG => kallisto::kallisto_presence_check(bin).await,
        GZIP_TAG => gzip::gzip_presence_check(bin).await,
        _ => return Err(anyhow!("Unknown tool: {}", tool)),
    };
    Ok(version?)
}

/// Checks that every external tool is installed and new enough.
///
/// # Arguments
///
/// * `tools` - (tag, binary) pairs.
///
/// # Returns
/// Result<()>; the error names the first tool that is missing or too old.
pub async fn check_versions(tools: &[(&str, &str)]) -> Result<()> {
    for &(tool, bin) in tools {
        let version = check_version(tool, bin).await?;
        let found = parse_version(&version)?;
        let minimum = TOOL_VERSIONS
            .get(tool)
            .copied()
            .ok_or_else(|| anyhow!("No minimum version known for {}", tool))?;
        if found < minimum {
            return Err(anyhow!(
                "{} version {} is too old; need at least {}.{}",
                tool,
                version,
                minimum.0,
                minimum.1
            ));
        }
        info!("{} version {} found", tool, version);
    }
    Ok(())
}

/// Maps the pipeline's task templates onto kallisto, gzip and the
/// in-process collations.
pub struct KallistoCommandBuilder {
    config: Arc<RunConfig>,
}

impl KallistoCommandBuilder {
    pub fn new(config: Arc<RunConfig>) -> Self {
        KallistoCommandBuilder { config }
    }

    fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            value_field: self.config.value_field,
            mode: self.config.aggregate_mode,
        }
    }
}

fn first_input(task: &TaskInstance) -> Result<&PathBuf> {
    task.inputs
        .first()
        .ok_or_else(|| anyhow!("Task {} has no inputs", task.id))
}

fn first_output(task: &TaskInstance) -> Result<&PathBuf> {
    task.outputs
        .first()
        .ok_or_else(|| anyhow!("Task {} has no outputs", task.id))
}

/// Pairs each every-sample input with the sample id carried, in the same
/// order, in the task's args.
fn sample_tagged_inputs(task: &TaskInstance) -> Result<Vec<(String, PathBuf)>> {
    if task.args.len() != task.inputs.len() {
        return Err(anyhow!(
            "Task {} has {} inputs but {} sample ids",
            task.id,
            task.inputs.len(),
            task.args.len()
        ));
    }
    Ok(task.args.iter().cloned().zip(task.inputs.iter().cloned()).collect())
}

impl CommandBuilder for KallistoCommandBuilder {
    fn invocation(&self, task: &TaskInstance) -> Result<Invocation> {
        let config = &*self.config;
        let invocation = match task.template.as_str() {
            DECOMPRESS_REFERENCE_TASK => Invocation::Process(
                CommandLine::new(&config.gzip_bin)
                    .args(gzip::decompress_args(first_input(task)?))
                    .stdout_to(first_output(task)?),
            ),
            INDEX_TASK => {
                let kallisto_config = kallisto::KallistoConfig {
                    subcommand: KallistoSubcommand::Index,
                    index: first_output(task)?.clone(),
                    output_dir: None,
                    inputs: vec![first_input(task)?.clone()],
                    threads: task.resources.threads,
                };
                Invocation::Process(
                    CommandLine::new(&config.kallisto_bin).args(kallisto::arg_generator(config, &kallisto_config)?),
                )
            }
            QUANT_TASK => {
                // inputs: index, then the interleaved reads; args: output directory
                let (index, reads) = task
                    .inputs
                    .split_first()
                    .ok_or_else(|| anyhow!("Task {} has no index input", task.id))?;
                let output_dir = task
                    .args
                    .first()
                    .map(PathBuf::from)
                    .ok_or_else(|| anyhow!("Task {} has no output directory", task.id))?;
                let kallisto_config = kallisto::KallistoConfig {
                    subcommand: KallistoSubcommand::Quant,
                    index: index.clone(),
                    output_dir: Some(output_dir),
                    inputs: reads.to_vec(),
                    threads: task.resources.threads,
                };
                Invocation::Process(
                    CommandLine::new(&config.kallisto_bin).args(kallisto::arg_generator(config, &kallisto_config)?),
                )
            }
            COMPRESS_ABUNDANCE_TASK => Invocation::Process(
                CommandLine::new(&config.gzip_bin)
                    .args(gzip::compress_args(first_input(task)?))
                    .stdout_to(first_output(task)?),
            ),
            COLLATE_ABUNDANCE_TASK => Invocation::Collate(CollateJob::FilteredUnion {
                inputs: sample_tagged_inputs(task)?,
                output: first_output(task)?.clone(),
                options: self.aggregate_options(),
            }),
            COLLATE_COUNTS_TASK => Invocation::Collate(CollateJob::Scalar {
                inputs: sample_tagged_inputs(task)?,
                output: first_output(task)?.clone(),
                options: self.aggregate_options(),
            }),
            other => return Err(anyhow!("Unknown task template: {}", other)),
        };
        debug!("{} -> {:?}", task.id, invocation);
        Ok(invocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_parse_major_minor() {
        assert_eq!(parse_version("0.46.2").unwrap(), (0, 46));
        assert_eq!(parse_version("1.12").unwrap(), (1, 12));
        assert_eq!(parse_version("v0.50.1").unwrap(), (0, 50));
        assert_eq!(parse_version("2").unwrap(), (2, 0));
        assert!(parse_version("unknown").is_err());
        assert!(parse_version("1.10").unwrap() > (1, 6));
    }

    fn collate_task(inputs: &[&str], args: &[&str]) -> TaskInstance {
        TaskInstance {
            id: COLLATE_ABUNDANCE_TASK.to_string(),
            template: COLLATE_ABUNDANCE_TASK.to_string(),
            sample: None,
            inputs: inputs.iter().map(PathBuf::from).collect(),
            outputs: vec![PathBuf::from("/out/abundance.tsv.gz")],
            args: args.iter().map(|a| a.to_string()).collect(),
            resources: Default::default(),
            declared: 0,
        }
    }

    #[test]
    fn sample_ids_come_from_task_args() {
        let task = collate_task(
            &["/out/quant/abundance.tsv", "/out/quant/B/abundance.tsv"],
            &["s.1", "B"],
        );
        let tagged = sample_tagged_inputs(&task).unwrap();
        assert_eq!(tagged[0], ("s.1".to_string(), PathBuf::from("/out/quant/abundance.tsv")));
        assert_eq!(tagged[1].0, "B");

        let mismatched = collate_task(&["/out/quant/A/abundance.tsv"], &[]);
        assert!(sample_tagged_inputs(&mismatched).is_err());
    }

    #[test]
    fn gzip_compression_is_reproducible() {
        let args = gzip::compress_args(std::path::Path::new("abundance.tsv"));
        assert_eq!(args, vec!["-c", "-n", "abundance.tsv"]);
    }
}
