//! Sample manifest loading.
//!
//! A manifest maps each sample identifier to its paired read lists:
//!
//! ```yaml
//! sampleA:
//!   R1: [a_L001_R1.fastq.gz, a_L002_R1.fastq.gz]
//!   R2: [a_L001_R2.fastq.gz, a_L002_R2.fastq.gz]
//! ```
//!
//! JSON and YAML are both accepted; the format is picked from the file
//! extension. Relative read paths are resolved against the manifest's
//! directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Cannot read sample manifest {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot parse sample manifest {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Sample manifest {0} lists no samples")]
    Empty(PathBuf),

    #[error("Invalid sample identifier '{0}'")]
    InvalidSampleId(String),

    #[error("Sample '{sample}' has {r1} R1 and {r2} R2 files; pairs must match")]
    UnpairedReads { sample: String, r1: usize, r2: usize },

    #[error("Sample '{0}' has no read files")]
    NoReads(String),
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "R1")]
    r1: Vec<PathBuf>,
    #[serde(rename = "R2")]
    r2: Vec<PathBuf>,
}

/// One biological sample and its paired-end read files. `r1[i]` pairs with
/// `r2[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub id: String,
    pub r1: Vec<PathBuf>,
    pub r2: Vec<PathBuf>,
}

impl Sample {
    pub fn new(id: impl Into<String>, r1: Vec<PathBuf>, r2: Vec<PathBuf>) -> Result<Self, ManifestError> {
        let sample = Sample { id: id.into(), r1, r2 };
        sample.validate()?;
        Ok(sample)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        let bad_char = |c: char| c == '/' || c == '\\' || c == '{' || c == '}' || c.is_whitespace();
        let dot_path = self.id == "." || self.id == "..";
        if self.id.is_empty() || dot_path || self.id.chars().any(bad_char) {
            return Err(ManifestError::InvalidSampleId(self.id.clone()));
        }
        if self.r1.len() != self.r2.len() {
            return Err(ManifestError::UnpairedReads {
                sample: self.id.clone(),
                r1: self.r1.len(),
                r2: self.r2.len(),
            });
        }
        if self.r1.is_empty() {
            return Err(ManifestError::NoReads(self.id.clone()));
        }
        Ok(())
    }

    /// Read files in the order the quantifier expects them:
    /// `R1[0], R2[0], R1[1], R2[1], ...`
    pub fn interleaved_reads(&self) -> Vec<PathBuf> {
        self.r1
            .iter()
            .zip(self.r2.iter())
            .flat_map(|(r1, r2)| [r1.clone(), r2.clone()])
            .collect()
    }
}

/// Loads and validates a sample manifest. Samples come back sorted by
/// identifier.
///
/// # Arguments
///
/// * `path` - JSON (`.json`) or YAML (anything else) manifest.
///
/// # Returns
/// Vec<Sample> in sorted identifier order.
pub fn load_manifest(path: &Path) -> Result<Vec<Sample>, ManifestError> {
    let text = fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let entries: BTreeMap<String, ManifestEntry> = if is_json {
        serde_json::from_str(&text).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&text).map_err(|e| ManifestError::Parse {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?
    };

    if entries.is_empty() {
        return Err(ManifestError::Empty(path.to_path_buf()));
    }

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let resolve = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };

    entries
        .into_iter()
        .map(|(id, entry)| {
            Sample::new(
                id,
                entry.r1.into_iter().map(resolve).collect(),
                entry.r2.into_iter().map(resolve).collect(),
            )
        })
        .collect()
}
