//! Deciding whether a task has to (re)run.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::dag::graph::DependencyGraph;
use crate::dag::template::TaskInstance;
use crate::utils::file::modified_time;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    MissingOutput(PathBuf),
    MissingInput(PathBuf),
    OlderThanInput { output: PathBuf, input: PathBuf },
    UpstreamRan(String),
    Forced,
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        !matches!(self, Staleness::Fresh)
    }
}

impl fmt::Display for Staleness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Staleness::Fresh => write!(f, "up to date"),
            Staleness::MissingOutput(p) => write!(f, "output {} is missing", p.display()),
            Staleness::MissingInput(p) => write!(f, "input {} is missing", p.display()),
            Staleness::OlderThanInput { output, input } => {
                write!(f, "output {} is older than input {}", output.display(), input.display())
            }
            Staleness::UpstreamRan(task) => write!(f, "upstream task '{task}' ran"),
            Staleness::Forced => write!(f, "forced"),
        }
    }
}

/// Filesystem part of the staleness check. A task is stale when an output
/// is absent or strictly older than any input. Equal timestamps are fresh.
pub fn check(task: &TaskInstance) -> io::Result<Staleness> {
    let mut oldest_output: Option<(std::time::SystemTime, &PathBuf)> = None;
    for output in &task.outputs {
        match modified_time(output)? {
            None => return Ok(Staleness::MissingOutput(output.clone())),
            Some(t) => {
                if oldest_output.map_or(true, |(old, _)| t < old) {
                    oldest_output = Some((t, output));
                }
            }
        }
    }

    // A task without outputs cannot be proven fresh.
    let Some((oldest, oldest_path)) = oldest_output else {
        return Ok(Staleness::Forced);
    };

    for input in &task.inputs {
        match modified_time(input)? {
            None => return Ok(Staleness::MissingInput(input.clone())),
            Some(t) if t > oldest => {
                return Ok(Staleness::OlderThanInput {
                    output: oldest_path.clone(),
                    input: input.clone(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(Staleness::Fresh)
}

/// Full check for task `i`, given which tasks already ran in this
/// invocation. A producer that ran makes the consumer stale whatever its
/// timestamps say.
pub fn evaluate(graph: &DependencyGraph, i: usize, ran: &[bool], force: bool) -> io::Result<Staleness> {
    if force {
        return Ok(Staleness::Forced);
    }
    if let Some(p) = graph.producers(i).into_iter().find(|&p| ran[p]) {
        return Ok(Staleness::UpstreamRan(graph.task(p).id.clone()));
    }
    check(graph.task(i))
}

/// Dry-run prediction: which tasks would run, in topological order,
/// assuming each planned task actually runs.
pub fn plan(graph: &DependencyGraph, force: bool) -> io::Result<Vec<(usize, Staleness)>> {
    let mut ran = vec![false; graph.len()];
    let mut planned = Vec::new();
    for &i in graph.order() {
        let staleness = evaluate(graph, i, &ran, force)?;
        if staleness.is_stale() {
            ran[i] = true;
            planned.push((i, staleness));
        }
    }
    Ok(planned)
}
