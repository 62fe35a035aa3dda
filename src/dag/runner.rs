//! Executing a single task.
//!
//! The scheduler only knows the [`TaskExecutor`] trait. The production
//! executor, [`ProcessExecutor`], asks a [`CommandBuilder`] what a task
//! means (an external command line or an in-process collation) and runs it.
//! External processes are all-or-nothing: exit status 0 is success,
//! anything else fails the task. Redirected stdout goes to a temporary file
//! next to the declared output and is renamed into place only on success;
//! files a tool writes itself are left where they are.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;

use async_trait::async_trait;
use log::{debug, warn};
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::defs::CAPTURE_TAIL_BYTES;
use crate::dag::error::TaskError;
use crate::dag::template::TaskInstance;
use crate::utils::aggregate::CollateJob;
use crate::utils::file::{ensure_parent_dir, modified_time};
use crate::utils::streams::{join_capture, spawn_tail_capture};

/// A fully resolved external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    /// Redirect stdout into this file instead of capturing it.
    pub stdout: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        CommandLine {
            program: program.into(),
            args: Vec::new(),
            stdout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdout_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// Shell-like rendering for logs and dry runs.
    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for arg in &self.args {
            s.push(' ');
            s.push_str(arg);
        }
        if let Some(out) = &self.stdout {
            s.push_str(" > ");
            s.push_str(&out.display().to_string());
        }
        s
    }
}

/// What a task does when it runs.
#[derive(Debug, Clone)]
pub enum Invocation {
    Process(CommandLine),
    Collate(CollateJob),
}

impl Invocation {
    pub fn display(&self) -> String {
        match self {
            Invocation::Process(cmd) => cmd.display(),
            Invocation::Collate(job) => job.describe(),
        }
    }
}

/// Maps a task instance to its invocation. Implementations own every
/// detail of argument formatting; the engine never builds strings itself.
pub trait CommandBuilder: Send + Sync {
    fn invocation(&self, task: &TaskInstance) -> anyhow::Result<Invocation>;
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs one task to completion. Must return promptly with
    /// [`TaskError::Cancelled`] once `cancel` fires.
    async fn execute(&self, task: &TaskInstance, cancel: CancellationToken) -> Result<(), TaskError>;
}

pub struct ProcessExecutor<B: CommandBuilder> {
    builder: B,
    verbose: bool,
}

impl<B: CommandBuilder> ProcessExecutor<B> {
    pub fn new(builder: B, verbose: bool) -> Self {
        ProcessExecutor { builder, verbose }
    }

    pub fn builder(&self) -> &B {
        &self.builder
    }

    async fn run_process(
        &self,
        task: &TaskInstance,
        cmd: CommandLine,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        let io_err = |path: &PathBuf, e: std::io::Error| TaskError::Io {
            task: task.id.clone(),
            path: path.clone(),
            error: e.to_string(),
        };

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut staged: Option<(NamedTempFile, &PathBuf)> = None;
        match &cmd.stdout {
            Some(path) => {
                let dir = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let temp = NamedTempFile::new_in(dir).map_err(|e| io_err(path, e))?;
                let file = temp.as_file().try_clone().map_err(|e| io_err(path, e))?;
                command.stdout(Stdio::from(file));
                staged = Some((temp, path));
            }
            None => {
                command.stdout(Stdio::piped());
            }
        }

        debug!("[{}] {}", task.id, cmd.display());
        let mut child = command.spawn().map_err(|e| TaskError::Spawn {
            task: task.id.clone(),
            program: cmd.program.clone(),
            error: e.to_string(),
        })?;

        let stdout_task = child
            .stdout
            .take()
            .map(|out| spawn_tail_capture(out, CAPTURE_TAIL_BYTES, task.id.clone(), self.verbose));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| spawn_tail_capture(err, CAPTURE_TAIL_BYTES, task.id.clone(), self.verbose));

        let status = tokio::select! {
            status = child.wait() => status.map_err(|e| TaskError::Spawn {
                task: task.id.clone(),
                program: cmd.program.clone(),
                error: e.to_string(),
            })?,
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill {} for task {}: {}", cmd.program, task.id, e);
                }
                return Err(TaskError::Cancelled(task.id.clone()));
            }
        };

        let stdout = join_capture(stdout_task).await;
        let stderr = join_capture(stderr_task).await;

        if status.success() {
            if let Some((temp, path)) = staged {
                temp.persist(path).map_err(|e| io_err(path, e.error))?;
            }
            Ok(())
        } else {
            Err(TaskError::Execution {
                task: task.id.clone(),
                sample: task.sample.clone(),
                code: status.code(),
                stdout,
                stderr,
            })
        }
    }

    async fn run_collate(
        &self,
        task: &TaskInstance,
        job: CollateJob,
        cancel: CancellationToken,
    ) -> Result<(), TaskError> {
        let handle = tokio::task::spawn_blocking(move || job.run());
        let joined = tokio::select! {
            joined = handle => joined,
            _ = cancel.cancelled() => return Err(TaskError::Cancelled(task.id.clone())),
        };

        let report = joined
            .map_err(|e| TaskError::Command {
                task: task.id.clone(),
                reason: format!("collation thread failed: {e}"),
            })?
            .map_err(|source| TaskError::Aggregation {
                task: task.id.clone(),
                source,
            })?;

        for err in &report.errors {
            warn!("[{}] skipped: {}", task.id, err);
        }
        debug!(
            "[{}] {} files, {} rows written, {} rows filtered",
            task.id, report.files, report.rows_written, report.rows_filtered
        );
        Ok(())
    }
}

#[async_trait]
impl<B: CommandBuilder> TaskExecutor for ProcessExecutor<B> {
    async fn execute(&self, task: &TaskInstance, cancel: CancellationToken) -> Result<(), TaskError> {
        for output in &task.outputs {
            ensure_parent_dir(output).map_err(|e| TaskError::Io {
                task: task.id.clone(),
                path: output.clone(),
                error: e.to_string(),
            })?;
        }

        let invocation = self.builder.invocation(task).map_err(|e| TaskError::Command {
            task: task.id.clone(),
            reason: e.to_string(),
        })?;

        match invocation {
            Invocation::Process(cmd) => self.run_process(task, cmd, cancel).await,
            Invocation::Collate(job) => self.run_collate(task, job, cancel).await,
        }
    }
}

/// Post-success contract: every declared output exists and is not older
/// than the newest input.
pub fn verify_outputs(task: &TaskInstance) -> Result<(), TaskError> {
    let violation = |path: &PathBuf, reason: &str| TaskError::ContractViolation {
        task: task.id.clone(),
        path: path.clone(),
        reason: reason.to_string(),
    };
    let io_err = |path: &PathBuf, e: std::io::Error| TaskError::Io {
        task: task.id.clone(),
        path: path.clone(),
        error: e.to_string(),
    };

    let mut newest_input: Option<(SystemTime, &PathBuf)> = None;
    for input in &task.inputs {
        if let Some(t) = modified_time(input).map_err(|e| io_err(input, e))? {
            if newest_input.map_or(true, |(newest, _)| t > newest) {
                newest_input = Some((t, input));
            }
        }
    }

    for output in &task.outputs {
        match modified_time(output).map_err(|e| io_err(output, e))? {
            None => return Err(violation(output, "missing")),
            Some(t) => {
                if let Some((newest, input)) = newest_input {
                    if t < newest {
                        return Err(violation(
                            output,
                            &format!("not updated (older than {})", input.display()),
                        ));
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::dag::template::Resources;

    struct FixedCommand(CommandLine);

    impl CommandBuilder for FixedCommand {
        fn invocation(&self, _task: &TaskInstance) -> anyhow::Result<Invocation> {
            Ok(Invocation::Process(self.0.clone()))
        }
    }

    fn redirect_task(output: PathBuf) -> TaskInstance {
        TaskInstance {
            id: "decompress".to_string(),
            template: "decompress".to_string(),
            sample: None,
            inputs: vec![],
            outputs: vec![output],
            args: vec![],
            resources: Resources::default(),
            declared: 0,
        }
    }

    fn shell(script: &str, stdout: &Path) -> CommandLine {
        CommandLine::new("sh").arg("-c").arg(script).stdout_to(stdout)
    }

    #[tokio::test]
    async fn failed_redirect_leaves_no_output() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("ref/tx.fa");
        let executor = ProcessExecutor::new(FixedCommand(shell("echo partial; exit 3", &output)), false);

        let err = executor
            .execute(&redirect_task(output.clone()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Execution { code: Some(3), .. }));
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(dir.path().join("ref")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn successful_redirect_is_moved_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("tx.fa");
        std::fs::write(&output, "stale").unwrap();
        let executor = ProcessExecutor::new(FixedCommand(shell("printf '>t1\\nACGT\\n'", &output)), false);

        executor
            .execute(&redirect_task(output.clone()), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), ">t1\nACGT\n");
        verify_outputs(&redirect_task(output)).unwrap();
    }
}
