#![cfg(unix)]

use std::fs;
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;

use seqtoid_quant::cli::Arguments;
use seqtoid_quant::config::defs::{PipelineError, RunConfig};
use seqtoid_quant::dag::TaskError;
use seqtoid_quant::pipelines::kallisto_quant;


/// Fake kallisto: `index` writes the record count, `quant` writes a fixed
/// two-row abundance table and a run-info record counting the read lines.
/// Any read path containing FAIL makes `quant` exit 1.
const FAKE_KALLISTO: &str = r#"#!/bin/sh
cmd="$1"; shift
case "$cmd" in
  version)
    echo "kallisto, version 0.46.2"
    ;;
  index)
    grep -c '>' "$3" > "$2"
    ;;
  quant)
    out=""; reads=""
    while [ $# -gt 0 ]; do
      case "$1" in
        -o) out="$2"; shift 2 ;;
        -i|-b|-t|--seed) shift 2 ;;
        *) reads="$reads $1"; shift ;;
      esac
    done
    case "$reads" in *FAIL*) echo "cannot read$reads" >&2; exit 1 ;; esac
    n=$(cat $reads | wc -l | tr -d ' ')
    mkdir -p "$out"
    printf 'target_id\tlength\teff_length\test_counts\ttpm\n' > "$out/abundance.tsv"
    printf 't1\t100\t90\t%s\t2.5\n' "$n" >> "$out/abundance.tsv"
    printf 't2\t100\t90\t0\t0\n' >> "$out/abundance.tsv"
    printf '{"n_processed": %s, "n_targets": 2}\n' "$n" > "$out/run_info.json"
    ;;
  *)
    exit 2
    ;;
esac
"#;

fn gunzip(path: &Path) -> Result<String> {
    let mut text = String::new();
    MultiGzDecoder::new(fs::File::open(path)?).read_to_string(&mut text)?;
    Ok(text)
}

fn write_script(path: &Path, body: &str) -> Result<()> {
    fs::write(path, body)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

/// Reference, reads, manifest and fake tool in `dir`.
fn write_inputs(dir: &Path, failing_sample: Option<&str>) -> Result<()> {
    write_script(&dir.join("fake_kallisto.sh"), FAKE_KALLISTO)?;

    let mut gz = GzEncoder::new(Vec::new(), Compression::default());
    gz.write_all(b">t1\nACGTACGT\n>t2\nTTGGCCAA\n")?;
    fs::write(dir.join("transcripts.fa.gz"), gz.finish()?)?;

    let mut manifest = String::new();
    for id in ["B", "A"] {
        let tag = if failing_sample == Some(id) { "_FAIL" } else { "" };
        let r1 = format!("reads/{id}{tag}_R1.fastq");
        let r2 = format!("reads/{id}{tag}_R2.fastq");
        fs::create_dir_all(dir.join("reads"))?;
        fs::write(dir.join(&r1), "@r1\nACGT\n+\nIIII\n")?;
        fs::write(dir.join(&r2), "@r1\nTGCA\n+\nIIII\n")?;
        manifest.push_str(&format!("{id}:\n  R1: [{r1}]\n  R2: [{r2}]\n"));
    }
    fs::write(dir.join("samples.yaml"), manifest)?;
    Ok(())
}

/// Config over the inputs in `dir`; `extra` is appended to the command line.
fn run_config(dir: &Path, extra: &[&str], capacity: usize) -> Result<Arc<RunConfig>> {
    let kallisto = dir.join("fake_kallisto.sh");
    let mut argv = vec![
        "seqtoid-quant".to_string(),
        "--reference".to_string(),
        "transcripts.fa.gz".to_string(),
        "--samples".to_string(),
        "samples.yaml".to_string(),
        "--out".to_string(),
        "out".to_string(),
        "--kallisto".to_string(),
        kallisto.to_string_lossy().to_string(),
    ];
    argv.extend(extra.iter().map(|a| a.to_string()));
    let args = Arguments::try_parse_from(argv)?;

    let out_dir = dir.join("out");
    fs::create_dir_all(&out_dir)?;
    Ok(Arc::new(RunConfig::from_args(args, dir.to_path_buf(), out_dir, capacity)?))
}

fn setup(dir: &Path, failing_sample: Option<&str>) -> Result<Arc<RunConfig>> {
    write_inputs(dir, failing_sample)?;
    run_config(dir, &["--threads", "2", "--seed", "7"], 4)
}

fn out(config: &RunConfig, rel: &str) -> PathBuf {
    config.out_dir.join(rel)
}


#[tokio::test]
async fn test_full_run_collates_every_sample() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = setup(dir.path(), None)?;

    kallisto_quant::run(config.clone(), CancellationToken::new()).await?;

    assert_eq!(fs::read_to_string(out(&config, "reference/transcripts.fa"))?, ">t1\nACGTACGT\n>t2\nTTGGCCAA\n");
    assert_eq!(fs::read_to_string(out(&config, "reference/transcripts.idx"))?.trim(), "2");
    for sample in ["A", "B"] {
        let per_sample = out(&config, &format!("quant/{sample}/abundance.tsv.gz"));
        assert_eq!(
            gunzip(&per_sample)?,
            fs::read_to_string(out(&config, &format!("quant/{sample}/abundance.tsv")))?
        );
    }

    let abundance = gunzip(&out(&config, "abundance.tsv.gz"))?;
    assert_eq!(
        abundance,
        "sample\ttarget_id\tlength\teff_length\test_counts\ttpm\n\
         A\tt1\t100\t90\t8\t2.5\n\
         B\tt1\t100\t90\t8\t2.5\n"
    );
    let counts = gunzip(&out(&config, "n_processed.tsv.gz"))?;
    assert_eq!(counts, "sample\tn_processed\nA\t8\nB\t8\n");
    Ok(())
}


#[tokio::test]
async fn test_second_run_executes_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = setup(dir.path(), None)?;
    kallisto_quant::run(config.clone(), CancellationToken::new()).await?;

    let graph = kallisto_quant::prepare(&config)?;
    assert!(kallisto_quant::dry_run(config.clone(), &graph)?.is_empty());

    let summary = kallisto_quant::execute(config.clone(), &graph, CancellationToken::new()).await;
    assert!(summary.is_success());
    assert!(summary.executed.is_empty());
    assert_eq!(summary.up_to_date.len(), graph.len());
    Ok(())
}


#[tokio::test]
async fn test_dry_run_lists_commands_without_running() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = setup(dir.path(), None)?;

    let graph = kallisto_quant::prepare(&config)?;
    let planned = kallisto_quant::dry_run(config.clone(), &graph)?;

    let ids: Vec<&str> = planned.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(
        ids,
        vec![
            "decompress_reference",
            "index",
            "quant[A]",
            "quant[B]",
            "compress_abundance[A]",
            "compress_abundance[B]",
            "collate_abundance",
            "collate_counts",
        ]
    );
    assert!(planned[0].command.starts_with("gzip -dc "));
    assert!(planned[2].command.contains(" quant -i "));
    assert!(planned[2].command.contains("-b 100 -t 2 --seed 7"));
    assert!(planned[2].command.ends_with("reads/A_R2.fastq"));
    assert!(!out(&config, "reference/transcripts.fa").exists());
    Ok(())
}


#[tokio::test]
async fn test_failed_sample_blocks_collation_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = setup(dir.path(), Some("B"))?;

    let graph = kallisto_quant::prepare(&config)?;
    let summary = kallisto_quant::execute(config.clone(), &graph, CancellationToken::new()).await;

    assert_eq!(summary.failed.len(), 1);
    let (id, err) = &summary.failed[0];
    assert_eq!(id, "quant[B]");
    match err {
        TaskError::Execution { sample, code, stderr, .. } => {
            assert_eq!(sample.as_deref(), Some("B"));
            assert_eq!(*code, Some(1));
            assert!(stderr.contains("cannot read"));
        }
        other => panic!("unexpected error {other:?}"),
    }

    let mut blocked = summary.blocked.clone();
    blocked.sort();
    assert_eq!(blocked, vec!["collate_abundance", "collate_counts", "compress_abundance[B]"]);
    assert!(summary.executed.contains(&"compress_abundance[A]".to_string()));
    assert!(out(&config, "quant/A/abundance.tsv.gz").exists());
    assert!(!out(&config, "abundance.tsv.gz").exists());
    assert!(!out(&config, "n_processed.tsv.gz").exists());

    let result = kallisto_quant::run(config, CancellationToken::new()).await;
    assert!(matches!(result, Err(PipelineError::RunFailed { failed: 1, blocked: 3 })));
    Ok(())
}


#[tokio::test]
async fn test_missing_read_file_fails_before_running() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = setup(dir.path(), None)?;
    fs::remove_file(dir.path().join("reads/A_R2.fastq"))?;

    let result = kallisto_quant::prepare(&config);
    assert!(matches!(result, Err(PipelineError::MissingInput(p)) if p.ends_with("reads/A_R2.fastq")));
    assert!(!out(&config, "reference").exists());
    Ok(())
}


#[tokio::test]
async fn test_failed_decompression_is_retried_on_rerun() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_inputs(dir.path(), None)?;
    let broken = dir.path().join("broken_gzip.sh");
    write_script(&broken, "#!/bin/sh\necho '>partial'\nexit 1\n")?;

    let broken_bin = broken.to_string_lossy().to_string();
    let config = run_config(dir.path(), &["--gzip", broken_bin.as_str()], 4)?;
    let graph = kallisto_quant::prepare(&config)?;
    let summary = kallisto_quant::execute(config.clone(), &graph, CancellationToken::new()).await;
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "decompress_reference");
    assert!(!out(&config, "reference/transcripts.fa").exists());

    // same inputs, working gzip
    let config = run_config(dir.path(), &[], 4)?;
    let graph = kallisto_quant::prepare(&config)?;
    let planned = kallisto_quant::dry_run(config.clone(), &graph)?;
    assert_eq!(planned.len(), graph.len());
    assert_eq!(planned[0].id, "decompress_reference");

    kallisto_quant::run(config.clone(), CancellationToken::new()).await?;
    assert_eq!(fs::read_to_string(out(&config, "reference/transcripts.fa"))?, ">t1\nACGTACGT\n>t2\nTTGGCCAA\n");
    Ok(())
}


#[tokio::test]
async fn test_quant_threads_are_clamped_to_capacity() -> Result<()> {
    let dir = tempfile::tempdir()?;
    write_inputs(dir.path(), None)?;
    let config = run_config(dir.path(), &["--threads", "8"], 2)?;

    let graph = kallisto_quant::prepare(&config)?;
    let planned = kallisto_quant::dry_run(config.clone(), &graph)?;
    let quant = planned.iter().find(|p| p.id == "quant[A]").unwrap();
    assert!(quant.command.contains(" -t 2 "), "{}", quant.command);
    Ok(())
}
