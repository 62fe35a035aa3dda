//! Task templates and the concrete instances expanded from them.

use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parameterization {
    /// One instance for the whole run.
    Unparameterized,
    /// One instance per sample, `{sample}` bound to the sample id.
    PerSample,
}

/// How a template names one (or several) of its inputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputPattern {
    /// A single path. `{sample}` is only valid in per-sample templates.
    Path(String),
    /// One path per sample, in sample order. Only valid in unparameterized
    /// templates; this is how a collation step waits on every sample.
    EachSample(String),
    /// The bound sample's reads, interleaved `R1[0], R2[0], R1[1], ...`.
    SampleReads,
}

/// Resource request of a task. The scheduler budgets `threads` against the
/// global capacity, and `mem_mb` against the optional memory capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resources {
    pub threads: usize,
    pub mem_mb: u64,
}

impl Resources {
    pub fn threads(threads: usize) -> Self {
        Resources {
            threads: threads.max(1),
            mem_mb: 0,
        }
    }

    pub fn with_mem_mb(mut self, mem_mb: u64) -> Self {
        self.mem_mb = mem_mb;
        self
    }
}

impl Default for Resources {
    fn default() -> Self {
        Resources::threads(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTemplate {
    pub name: String,
    pub parameterization: Parameterization,
    pub inputs: Vec<InputPattern>,
    pub outputs: Vec<String>,
    pub args: Vec<String>,
    /// Appended to `args` once per sample, in sample order, so a gathering
    /// task can pair each of its every-sample inputs with the sample id.
    pub each_sample_args: Vec<String>,
    pub resources: Resources,
}

impl TaskTemplate {
    pub fn unparameterized(name: impl Into<String>) -> Self {
        Self::new(name, Parameterization::Unparameterized)
    }

    pub fn per_sample(name: impl Into<String>) -> Self {
        Self::new(name, Parameterization::PerSample)
    }

    fn new(name: impl Into<String>, parameterization: Parameterization) -> Self {
        TaskTemplate {
            name: name.into(),
            parameterization,
            inputs: Vec::new(),
            outputs: Vec::new(),
            args: Vec::new(),
            each_sample_args: Vec::new(),
            resources: Resources::default(),
        }
    }

    pub fn input(mut self, pattern: impl Into<String>) -> Self {
        self.inputs.push(InputPattern::Path(pattern.into()));
        self
    }

    pub fn input_each_sample(mut self, pattern: impl Into<String>) -> Self {
        self.inputs.push(InputPattern::EachSample(pattern.into()));
        self
    }

    pub fn sample_reads(mut self) -> Self {
        self.inputs.push(InputPattern::SampleReads);
        self
    }

    pub fn output(mut self, pattern: impl Into<String>) -> Self {
        self.outputs.push(pattern.into());
        self
    }

    pub fn arg(mut self, pattern: impl Into<String>) -> Self {
        self.args.push(pattern.into());
        self
    }

    pub fn arg_each_sample(mut self, pattern: impl Into<String>) -> Self {
        self.each_sample_args.push(pattern.into());
        self
    }

    pub fn resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }
}

/// A template bound to (at most) one sample, with every path resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInstance {
    pub id: String,
    pub template: String,
    pub sample: Option<String>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub args: Vec<String>,
    pub resources: Resources,
    /// Position in declaration order; ties in the ready set break on it.
    pub declared: usize,
}

impl TaskInstance {
    pub fn instance_id(template: &str, sample: Option<&str>) -> String {
        match sample {
            Some(sample) => format!("{template}[{sample}]"),
            None => template.to_string(),
        }
    }
}

impl fmt::Display for TaskInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}
