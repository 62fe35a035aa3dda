use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use flate2::read::MultiGzDecoder;

use crate::config::defs::GZIP_EXT;

pub fn is_gzipped(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1F, 0x8B]), // Gzip magic bytes
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Reader over a plain or gzip-compressed file.
pub enum FileReader {
    Gzipped(BufReader<MultiGzDecoder<File>>),
    Uncompressed(BufReader<File>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileReader::Gzipped(r) => r.read(buf),
            FileReader::Uncompressed(r) => r.read(buf),
        }
    }
}

impl BufRead for FileReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        match self {
            FileReader::Gzipped(r) => r.fill_buf(),
            FileReader::Uncompressed(r) => r.fill_buf(),
        }
    }

    fn consume(&mut self, amt: usize) {
        match self {
            FileReader::Gzipped(r) => r.consume(amt),
            FileReader::Uncompressed(r) => r.consume(amt),
        }
    }
}

/// Opens a file for buffered line reading, decompressing it on the fly if it
/// carries the gzip magic bytes.
pub fn open_text(path: &Path) -> io::Result<FileReader> {
    let gz = is_gzipped(path)?;
    let file = File::open(path)?;
    Ok(if gz {
        FileReader::Gzipped(BufReader::new(MultiGzDecoder::new(file)))
    } else {
        FileReader::Uncompressed(BufReader::new(file))
    })
}

/// Lexically normalizes a path: drops `.` components and folds `dir/..`
/// pairs, so the same file always has the same identity in the task graph.
pub fn clean_path(path: impl AsRef<Path>) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(
                    cleaned.components().next_back(),
                    Some(Component::Normal(_))
                );
                if can_pop {
                    cleaned.pop();
                } else {
                    cleaned.push("..");
                }
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Modification time of a file, or `None` if it does not exist.
pub fn modified_time(path: &Path) -> io::Result<Option<SystemTime>> {
    match fs::metadata(path) {
        Ok(meta) => meta.modified().map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => fs::create_dir_all(dir),
        _ => Ok(()),
    }
}

/// Builds a path from a base file name, an optional directory, an optional
/// prefix and an optional postfix, e.g. `sample` + `validated.fq.gz` with
/// delimiter `_` gives `<dir>/sample_validated.fq.gz`.
///
/// # Arguments
///
/// * `base` - File name (or path) to decorate.
/// * `dir` - Directory to place the result in; `None` keeps `base`'s own parent.
/// * `prefix` - Optional leading tag.
/// * `postfix` - Optional trailing tag.
/// * `delimiter` - Separator between tags and the base name.
///
/// # Returns
/// PathBuf of the decorated path.
pub fn file_path_manipulator(
    base: &Path,
    dir: Option<&Path>,
    prefix: Option<&str>,
    postfix: Option<&str>,
    delimiter: &str,
) -> PathBuf {
    let file_name = base
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut name = String::new();
    if let Some(prefix) = prefix {
        name.push_str(prefix);
        name.push_str(delimiter);
    }
    name.push_str(&file_name);
    if let Some(postfix) = postfix {
        name.push_str(delimiter);
        name.push_str(postfix);
    }

    match dir {
        Some(dir) => dir.join(name),
        None => base.with_file_name(name),
    }
}

/// Strips a trailing `.gz` and then one more extension:
/// `transcripts.fa.gz` -> `transcripts`.
pub fn extension_remover(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = name
        .strip_suffix(&format!(".{GZIP_EXT}"))
        .map(str::to_string)
        .unwrap_or(name);
    match name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}
