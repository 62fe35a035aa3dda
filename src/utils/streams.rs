// src/utils/streams.rs
use std::collections::VecDeque;

use anyhow::{anyhow, Result};
use log::debug;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

/// Reads a child's stdout or stderr to completion, one String per line.
///
/// # Arguments
///
/// * `child` - Spawned child with the requested stream piped.
/// * `stream` - Which stream to read.
///
/// # Returns
/// Vec of lines.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let lines = match stream {
        ChildStream::Stdout => {
            let out = child.stdout.take().ok_or_else(|| anyhow!("Child stdout is not piped"))?;
            collect_lines(out).await?
        }
        ChildStream::Stderr => {
            let err = child.stderr.take().ok_or_else(|| anyhow!("Child stderr is not piped"))?;
            collect_lines(err).await?
        }
    };
    Ok(lines)
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R) -> Result<Vec<String>> {
    let mut stream = LinesStream::new(BufReader::new(reader).lines());
    let mut lines = Vec::new();
    while let Some(line) = stream.next().await {
        lines.push(line?);
    }
    Ok(lines)
}

/// Drains a child stream in the background, keeping only the last
/// `limit` bytes. Whole lines are kept, except that a single line longer
/// than `limit` keeps only its end. Lines are echoed at debug level when
/// `verbose` is set, tagged with `label`.
///
/// # Arguments
///
/// * `reader` - Child stdout or stderr.
/// * `limit` - Maximum bytes to keep.
/// * `label` - Tag for debug output, usually the task id.
/// * `verbose` - Echo every line at debug level.
///
/// # Returns
/// JoinHandle resolving to the captured tail.
pub fn spawn_tail_capture<R>(reader: R, limit: usize, label: String, verbose: bool) -> JoinHandle<Result<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut stream = LinesStream::new(BufReader::new(reader).lines());
        let mut tail: VecDeque<String> = VecDeque::new();
        let mut size = 0usize;

        while let Some(line) = stream.next().await {
            let mut line = line?;
            if verbose {
                debug!("[{}] {}", label, line);
            }
            if line.len() > limit {
                line = keep_last_bytes(&line, limit);
            }
            size += line.len() + 1;
            tail.push_back(line);
            while size > limit && tail.len() > 1 {
                if let Some(dropped) = tail.pop_front() {
                    size -= dropped.len() + 1;
                }
            }
        }

        Ok(tail.into_iter().collect::<Vec<_>>().join("\n"))
    })
}

/// The trailing `limit` bytes of `line`, moved forward to a char boundary.
fn keep_last_bytes(line: &str, limit: usize) -> String {
    let mut cut = line.len().saturating_sub(limit);
    while !line.is_char_boundary(cut) {
        cut += 1;
    }
    line[cut..].to_string()
}

/// Awaits a capture task, turning a panic or read error into text so the
/// caller still gets an error message to report.
pub async fn join_capture(handle: Option<JoinHandle<Result<String>>>) -> String {
    match handle {
        None => String::new(),
        Some(handle) => match handle.await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => format!("<unreadable output: {e}>"),
            Err(e) => format!("<capture task failed: {e}>"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tail_keeps_last_lines_within_limit() -> Result<()> {
        let input: &'static [u8] = b"first\nsecond\nthird\n";
        let text = join_capture(Some(spawn_tail_capture(input, 13, "t".to_string(), false))).await;
        assert_eq!(text, "second\nthird");
        Ok(())
    }

    #[tokio::test]
    async fn oversized_line_is_truncated_to_its_end() -> Result<()> {
        let long = format!("{}END", "x".repeat(10_000));
        let input: &'static [u8] = Box::leak(long.into_bytes().into_boxed_slice());
        let text = join_capture(Some(spawn_tail_capture(input, 16, "t".to_string(), false))).await;
        assert_eq!(text.len(), 16);
        assert!(text.ends_with("END"));
        Ok(())
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(keep_last_bytes("aé", 1), "");
        assert_eq!(keep_last_bytes("aé", 2), "é");
        assert_eq!(keep_last_bytes("abc", 5), "abc");
    }
}
