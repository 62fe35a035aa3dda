use clap::Parser;

use crate::config::defs::{DEFAULT_BOOTSTRAPS, DEFAULT_QUANT_THREADS, GZIP_TAG, KALLISTO_TAG, TPM_FIELD_INDEX};

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "seqtoid-quant", version, about = "Index a reference, quantify every sample with kallisto and collate the results")]
pub struct Arguments {

    #[arg(short = 'r', long, help = "Reference transcript FASTA, optionally gzipped")]
    pub reference: String,

    #[arg(short = 's', long, help = "Sample manifest (JSON or YAML): { <sample>: { R1: [..], R2: [..] } }")]
    pub samples: String,

    #[arg(short = 'o', long = "out", help = "Output directory for all generated files. If not specified, a directory named 'quant_YYYYMMDD' will be created in the current working directory.")]
    pub out_dir: Option<String>,

    #[arg(short = 'b', long, default_value_t = DEFAULT_BOOTSTRAPS)]
    pub bootstraps: u32,

    #[arg(short = 't', long, default_value_t = DEFAULT_QUANT_THREADS, help = "Threads per quantification task")]
    pub threads: usize,

    #[arg(long, help = "Total threads shared by running tasks; defaults to the physical core count")]
    pub capacity: Option<usize>,

    #[arg(long = "memory-mb", help = "Optional memory budget shared by running tasks, in MiB")]
    pub memory_mb: Option<u64>,

    #[clap(long, help = "Optional fixed seed passed to kallisto for reproducible bootstraps")]
    pub seed: Option<u64>,

    #[arg(long, default_value_t = TPM_FIELD_INDEX, help = "Zero-based column of abundance.tsv used to filter rows")]
    pub value_field: usize,

    #[arg(long, default_value_t = false, help = "Skip malformed records when collating instead of failing")]
    pub best_effort: bool,

    #[arg(long, default_value_t = false, help = "Rerun every task regardless of timestamps")]
    pub force: bool,

    #[arg(long, default_value_t = false, help = "Print the tasks that would run and exit")]
    pub dry_run: bool,

    #[arg(long, default_value = KALLISTO_TAG)]
    pub kallisto: String,

    #[arg(long, default_value = GZIP_TAG)]
    pub gzip: String,

    #[arg(short = 'v', long = "verbose", action)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = Arguments::try_parse_from(["seqtoid-quant", "-r", "ref.fa.gz", "-s", "samples.yaml"]).unwrap();
        assert_eq!(args.bootstraps, 100);
        assert_eq!(args.threads, 4);
        assert_eq!(args.value_field, 4);
        assert_eq!(args.kallisto, "kallisto");
        assert_eq!(args.gzip, "gzip");
        assert!(args.capacity.is_none());
        assert!(!args.best_effort && !args.force && !args.dry_run);
    }

    #[test]
    fn reference_and_samples_are_required() {
        assert!(Arguments::try_parse_from(["seqtoid-quant", "-r", "ref.fa"]).is_err());
        assert!(Arguments::try_parse_from(["seqtoid-quant", "-s", "samples.json"]).is_err());
    }
}
