//! Append-only CSV output for harvest tasks
//!
//! Each task writes a data file and, for categories that have one, a stats
//! file. Lengths are tracked so a failed append can be rolled back and a
//! resumed task can cut off rows written after its last checkpoint.

use crate::output::OutputError;
use crate::state::TaskType;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Byte lengths recorded with a checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommittedLengths {
    pub data: u64,
    pub stats: u64,
}

/// Path of a task's data file
pub fn data_path(dir: &Path, task_type: TaskType, id: &str) -> PathBuf {
    task_dir(dir, task_type, id).join(format!("{}_{}_data.csv", task_type.file_stem(), id))
}

/// Path of a task's stats file
pub fn stats_path(dir: &Path, task_type: TaskType, id: &str) -> PathBuf {
    task_dir(dir, task_type, id).join(format!("{}_{}_stats.csv", task_type.file_stem(), id))
}

fn task_dir(dir: &Path, task_type: TaskType, id: &str) -> PathBuf {
    dir.join(task_type.file_stem()).join(id)
}

/// Quotes a field when it contains a separator, quote or line break
pub fn escape_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn encode_rows<S: AsRef<str>>(rows: &[Vec<S>]) -> Vec<u8> {
    let mut buf = String::new();
    for row in rows {
        let line: Vec<String> = row.iter().map(|f| escape_field(f.as_ref())).collect();
        buf.push_str(&line.join(","));
        buf.push('\n');
    }
    buf.into_bytes()
}

#[derive(Debug)]
struct TableFile {
    path: PathBuf,
    file: File,
    len: u64,
}

impl TableFile {
    /// Opens the file, truncating it to `keep` bytes (or empty when `None`)
    fn open(path: PathBuf, header: &[&str], keep: Option<u64>) -> Result<Self, OutputError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let current = file.metadata()?.len();
        let len = match keep {
            Some(keep) if keep < current => {
                file.set_len(keep)?;
                keep
            }
            Some(_) => current,
            None => {
                file.set_len(0)?;
                0
            }
        };

        let mut table = Self { path, file, len };
        table.file.seek(SeekFrom::Start(len))?;
        if len == 0 {
            table.append(&encode_rows(&[header.to_vec()]))?;
        }
        Ok(table)
    }

    fn append(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let result = self
            .file
            .write_all(bytes)
            .and_then(|_| self.file.sync_data());
        match result {
            Ok(()) => {
                self.len += bytes.len() as u64;
                Ok(())
            }
            Err(e) => {
                self.rollback();
                Err(e.into())
            }
        }
    }

    /// Cuts the file back to the last successful append
    fn rollback(&mut self) {
        if let Err(e) = self
            .file
            .set_len(self.len)
            .and_then(|_| self.file.seek(SeekFrom::Start(self.len)).map(|_| ()))
        {
            tracing::error!("Failed to roll back {}: {}", self.path.display(), e);
        }
    }
}

/// Output files of one task
#[derive(Debug)]
pub struct OutputSink {
    data: TableFile,
    stats: Option<TableFile>,
}

impl OutputSink {
    /// Opens the output files of a task
    ///
    /// # Arguments
    ///
    /// * `dir` - Root output directory
    /// * `task_type` - Category, used in the file names
    /// * `id` - Id the files are named after (the checkpoint id)
    /// * `columns` - Header of the data file
    /// * `stats_columns` - Header of the stats file; empty means no stats file
    /// * `resume` - Lengths to truncate back to, or `None` to start empty
    pub fn open(
        dir: &Path,
        task_type: TaskType,
        id: &str,
        columns: &[&str],
        stats_columns: &[&str],
        resume: Option<CommittedLengths>,
    ) -> Result<Self, OutputError> {
        let data = TableFile::open(
            data_path(dir, task_type, id),
            columns,
            resume.map(|r| r.data),
        )?;

        let stats = if stats_columns.is_empty() {
            None
        } else {
            Some(TableFile::open(
                stats_path(dir, task_type, id),
                stats_columns,
                resume.map(|r| r.stats),
            )?)
        };

        Ok(Self { data, stats })
    }

    /// Appends rows to both files; on failure neither file keeps a partial write
    pub fn append(&mut self, rows: &[Vec<String>], stats: &[Vec<String>]) -> Result<(), OutputError> {
        let data_len = self.data.len;
        self.data.append(&encode_rows(rows))?;

        if let Some(table) = self.stats.as_mut() {
            if let Err(e) = table.append(&encode_rows(stats)) {
                self.data.len = data_len;
                self.data.rollback();
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn lengths(&self) -> CommittedLengths {
        CommittedLengths {
            data: self.data.len,
            stats: self.stats.as_ref().map_or(0, |s| s.len),
        }
    }

    /// Paths of the files, data file first
    pub fn paths(&self) -> Vec<String> {
        std::iter::once(&self.data)
            .chain(self.stats.as_ref())
            .map(|t| t.path.display().to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn row(fields: &[&str]) -> Vec<String> {
        fields.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_paths_follow_layout() {
        let path = data_path(Path::new("/out"), TaskType::SearchIndex, "t1");
        assert_eq!(
            path,
            PathBuf::from("/out/search_index/t1/search_index_t1_data.csv")
        );
    }

    #[test]
    fn test_header_written_once() {
        let dir = TempDir::new().unwrap();
        let mut sink =
            OutputSink::open(dir.path(), TaskType::FeedIndex, "t1", &["k", "v"], &["s"], None).unwrap();
        sink.append(&[row(&["a", "1"])], &[row(&["x"])]).unwrap();
        let lengths = sink.lengths();
        drop(sink);

        let sink = OutputSink::open(
            dir.path(),
            TaskType::FeedIndex,
            "t1",
            &["k", "v"],
            &["s"],
            Some(lengths),
        )
        .unwrap();
        let content = fs::read_to_string(&sink.paths()[0]).unwrap();
        assert_eq!(content, "k,v\na,1\n");
        assert_eq!(fs::read_to_string(&sink.paths()[1]).unwrap(), "s\nx\n");
    }

    #[test]
    fn test_resume_truncates_uncommitted_rows() {
        let dir = TempDir::new().unwrap();
        let mut sink =
            OutputSink::open(dir.path(), TaskType::WordGraph, "t1", &["k"], &[], None).unwrap();
        sink.append(&[row(&["a"])], &[]).unwrap();
        let committed = sink.lengths();
        sink.append(&[row(&["b"])], &[]).unwrap();
        drop(sink);

        let mut sink = OutputSink::open(
            dir.path(),
            TaskType::WordGraph,
            "t1",
            &["k"],
            &[],
            Some(committed),
        )
        .unwrap();
        sink.append(&[row(&["c"])], &[]).unwrap();

        assert_eq!(sink.paths().len(), 1);
        assert_eq!(fs::read_to_string(&sink.paths()[0]).unwrap(), "k\na\nc\n");
    }

    #[test]
    fn test_fresh_open_discards_old_content() {
        let dir = TempDir::new().unwrap();
        let mut sink =
            OutputSink::open(dir.path(), TaskType::WordGraph, "t1", &["k"], &[], None).unwrap();
        sink.append(&[row(&["a"])], &[]).unwrap();
        drop(sink);

        let sink = OutputSink::open(dir.path(), TaskType::WordGraph, "t1", &["k"], &[], None).unwrap();
        assert_eq!(fs::read_to_string(&sink.paths()[0]).unwrap(), "k\n");
        assert_eq!(sink.lengths().data, 2);
    }
}
