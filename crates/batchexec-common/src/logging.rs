// Per-task log sink, grounded on `PagingLogger`'s page-file idiom but
// simplified to the single-file-per-task shape this engine needs: there is
// no remote log-upload service in scope (spec.md §1), so pages collapse
// into one append-only file per task plus an in-memory tail used for error
// reporting (spec.md §7.3's `stderr-tail`).

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Number of trailing lines retained in memory for stderr-tail reporting.
const TAIL_LINES: usize = 200;

/// Minimum interval between forced flushes of the underlying file (spec.md
/// §4.3.7: "Flush the log at a 1-second interval and on completion").
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// A log sink owned exclusively by one task for its lifetime (spec.md §5:
/// "Per-task log — exclusively owned by one worker; closed on task
/// completion").
pub struct TaskLogSink {
    path: PathBuf,
    writer: BufWriter<File>,
    last_flush: Instant,
    tail: VecDeque<String>,
    total_lines: u64,
}

impl TaskLogSink {
    /// Create a log sink at `<logs_dir>/<slug>.log`, creating parent
    /// directories as needed.
    pub fn create(logs_dir: &Path, slug: &str) -> Result<Self> {
        fs::create_dir_all(logs_dir)
            .with_context(|| format!("failed to create log directory '{}'", logs_dir.display()))?;
        let path = logs_dir.join(format!("{slug}.log"));
        let file = File::create(&path)
            .with_context(|| format!("failed to create log file '{}'", path.display()))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            last_flush: Instant::now(),
            tail: VecDeque::with_capacity(TAIL_LINES),
            total_lines: 0,
        })
    }

    /// Path to the underlying log file, surfaced to users alongside
    /// one-line error summaries (spec.md §7).
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a line with a `stdout:`/`stderr:` style prefix (spec.md
    /// §4.3.7).
    pub fn write_prefixed(&mut self, prefix: &str, line: &str) {
        self.write_line(&format!("{prefix}: {line}"));
    }

    /// Append a plain line, UTC-timestamped.
    pub fn write_line(&mut self, line: &str) {
        let stamped = format!("{} {}", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"), line);
        if let Err(e) = writeln!(self.writer, "{stamped}") {
            tracing::warn!("failed to write task log line: {e}");
        }
        self.total_lines += 1;

        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());

        if self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.flush();
        }
    }

    /// Force a flush regardless of the interval (spec.md §4.3.7: "and on
    /// completion").
    pub fn flush(&mut self) {
        if let Err(e) = self.writer.flush() {
            tracing::warn!("failed to flush task log '{}': {e}", self.path.display());
        }
        self.last_flush = Instant::now();
    }

    /// The last `TAIL_LINES` lines written, newest last — used to populate
    /// `StepExecutionError::stderr_tail`.
    pub fn tail(&self) -> String {
        self.tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn total_lines(&self) -> u64 {
        self.total_lines
    }
}

impl Drop for TaskLogSink {
    fn drop(&mut self) {
        self.flush();
    }
}
