//! Error types for template expansion, graph construction and task execution.

use std::path::PathBuf;

use thiserror::Error;

use crate::utils::aggregate::AggregateError;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Template '{template}': unknown placeholder '{placeholder}' in '{pattern}'")]
    UnknownPlaceholder {
        template: String,
        placeholder: String,
        pattern: String,
    },

    #[error("Template '{template}': placeholder '{placeholder}' has no binding in '{pattern}'")]
    UnboundPlaceholder {
        template: String,
        placeholder: String,
        pattern: String,
    },

    #[error("Template '{template}': unterminated placeholder in '{pattern}'")]
    Syntax { template: String, pattern: String },

    #[error("Template '{template}': {reason}")]
    InvalidPattern { template: String, reason: String },

    #[error("Output {path} is claimed by both '{first}' and '{second}'")]
    DuplicateOutput {
        path: PathBuf,
        first: String,
        second: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{task}' needs {path}, which no task produces and which is not a known input")]
    UnresolvedInput { task: String, path: PathBuf },

    #[error("Output {path} is produced by both '{first}' and '{second}'")]
    DuplicateProducer {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("Cycle detected in task graph: {}", .cycle.join(" -> "))]
    Cycle { cycle: Vec<String> },
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task '{task}'{} exited with {}:\n{stderr}", sample_suffix(.sample), exit_label(.code))]
    Execution {
        task: String,
        sample: Option<String>,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Task '{task}' reported success but {path} is {reason}")]
    ContractViolation {
        task: String,
        path: PathBuf,
        reason: String,
    },

    #[error("Task '{task}': failed to launch {program}: {error}")]
    Spawn {
        task: String,
        program: String,
        error: String,
    },

    #[error("Task '{task}': cannot build command: {reason}")]
    Command { task: String, reason: String },

    #[error("Task '{task}': I/O error on {path}: {error}")]
    Io {
        task: String,
        path: PathBuf,
        error: String,
    },

    #[error("Task '{task}': {source}")]
    Aggregation {
        task: String,
        #[source]
        source: AggregateError,
    },

    #[error("Task '{0}' was cancelled")]
    Cancelled(String),
}

fn sample_suffix(sample: &Option<String>) -> String {
    sample
        .as_ref()
        .map(|s| format!(" (sample {s})"))
        .unwrap_or_default()
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a signal".to_string(),
    }
}
