use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Local;
use env_logger::Builder;
use log::{LevelFilter, debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use seqtoid_quant::cli::{parse, Arguments};
use seqtoid_quant::config::defs::{PipelineError, RunConfig};
use seqtoid_quant::pipelines::kallisto_quant;
use seqtoid_quant::utils::system::{detect_cores, detect_ram, resolve_capacity};


#[tokio::main]
async fn main() -> Result<()> {
    let run_start = Instant::now();

    let args = parse();

    let log_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] {}: {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .init();

    println!("\n-------------\n SeqToID Quant\n-------------\n");

    let dir = env::current_dir()?;
    info!("The current directory is {:?}\n", dir);

    let physical_cores = detect_cores();
    let capacity = resolve_capacity(args.capacity, physical_cores);
    debug!("Detected {} physical cores; scheduler capacity {} threads", physical_cores, capacity);

    match detect_ram() {
        Ok((total_ram, available_ram)) => {
            debug!("Available RAM: {} bytes (~{} GiB)", available_ram, available_ram / 1_073_741_824);
            debug!("Total RAM: {} bytes (~{} GiB)", total_ram, total_ram / 1_073_741_824);
            if let Some(mb) = args.memory_mb {
                if mb.saturating_mul(1_048_576) > available_ram {
                    warn!("--memory-mb {} exceeds available RAM (~{} MiB)", mb, available_ram / 1_048_576);
                }
            }
        }
        Err(e) => debug!("RAM detection failed: {}", e),
    }

    let out_dir = setup_output_dir(&args, &dir)?;
    info!("Output directory: {}", out_dir.display());

    let run_config = match RunConfig::from_args(args, dir, out_dir, capacity) {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping running tasks");
            ctrl_c_token.cancel();
        }
    });

    if let Err(e) = kallisto_quant_run(run_config, cancel).await {
        error!("Pipeline failed: {} at {} milliseconds.", e, run_start.elapsed().as_millis());
        std::process::exit(1);
    }

    println!("Run complete: {} milliseconds.", run_start.elapsed().as_millis());
    Ok(())
}


async fn kallisto_quant_run(run_config: Arc<RunConfig>, cancel: CancellationToken) -> Result<(), PipelineError> {
    kallisto_quant::run(run_config, cancel).await
}


/// Sets up output directory
/// If `out_dir` is specified from args, uses it;
/// otherwise, creates a directory named `quant_YYYYMMDD`.
/// Ensures the directory exists.
///
/// # Arguments
/// * `args` - The parsed command-line arguments.
/// * `cwd` - The current working directory.
/// # Returns
/// path to the output directory.
fn setup_output_dir(args: &Arguments, cwd: &PathBuf) -> Result<PathBuf> {
    let out_dir = match &args.out_dir {
        Some(out) => {
            let path = PathBuf::from(out);
            if path.is_absolute() {
                path
            } else {
                cwd.join(path)
            }
        }
        None => {
            let timestamp = Local::now().format("%Y%m%d").to_string();
            cwd.join(format!("quant_{}", timestamp))
        }
    };
    fs::create_dir_all(&out_dir)?;
    Ok(out_dir)
}
