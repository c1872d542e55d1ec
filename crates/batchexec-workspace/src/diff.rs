// Diff extraction correctness (spec.md §4.2): "write child-process stdout
// directly to a temporary file, then read the file" — avoids truncating
// very large diffs by buffering in a channel/`String`. Grounded on
// `PagingLogger`'s page-file idiom (write to disk, read back) and on
// `ProcessInvoker`'s stdout-channel plumbing, redirected to a file via a
// shell wrapper rather than collected in memory.

use anyhow::{bail, Context, Result};
use batchexec_sdk::process_invoker::ProcessInvoker;
use batchexec_sdk::trace::{NullTraceWriter, TraceWriter};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Above this size, the captured output's tail is sanity-checked for a
/// plausible diff terminator before being trusted (spec.md §4.2: "For
/// diffs over a megabyte, the tail must be sanity-checked").
const LARGE_DIFF_THRESHOLD: usize = 1024 * 1024;

/// Run `git -C <dir> <git_args>`, redirecting its stdout straight to a
/// temporary file via a shell wrapper, then read the file back as bytes.
/// `expect_non_empty` enforces spec.md §4.2's "empty output when
/// change-presence was expected is an error, not silent success."
pub async fn capture_git_output_via_tempfile(
    dir: &str,
    git_args: &str,
    expect_non_empty: bool,
) -> Result<Vec<u8>> {
    let tmp = tempfile::NamedTempFile::new().context("failed to create temp file for diff capture")?;
    let tmp_path = tmp.path().to_path_buf();

    let trace: Arc<dyn TraceWriter> = Arc::new(NullTraceWriter);
    let invoker = ProcessInvoker::new(trace);
    let shell_cmd = format!(
        "-c 'git -C {} {} > {} 2>/dev/null'",
        shell_quote(dir),
        git_args,
        shell_quote(tmp_path.to_str().unwrap_or_default())
    );
    let exit_code = invoker
        .execute("", "sh", &shell_cmd, None, false, false, CancellationToken::new())
        .await
        .context("failed to start diff-capturing shell")?;
    if exit_code != 0 {
        bail!("git {git_args} exited with code {exit_code}");
    }

    let bytes = tokio::fs::read(&tmp_path)
        .await
        .with_context(|| format!("failed to read captured diff at '{}'", tmp_path.display()))?;

    if expect_non_empty && bytes.is_empty() {
        bail!("expected a non-empty diff for 'git {git_args}' in '{dir}' but got none");
    }

    if bytes.len() > LARGE_DIFF_THRESHOLD && !has_plausible_terminator(&bytes) {
        bail!(
            "diff output for 'git {git_args}' in '{dir}' appears truncated: no plausible terminator in the final bytes"
        );
    }

    Ok(bytes)
}

/// Best-effort truncation check: a well-formed unified diff's tail is
/// either a `+`/`-`/` ` context line or a `\n` (complete line), never a
/// dangling partial line with no trailing newline followed by more
/// expected content.
fn has_plausible_terminator(bytes: &[u8]) -> bool {
    matches!(bytes.last(), Some(b'\n') | None)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Write `diff_bytes` to a temp file under `dir` for `git apply` to
/// consume, returning the file's path.
pub fn write_diff_to_tempfile(dir: &Path, diff_bytes: &[u8]) -> Result<std::path::PathBuf> {
    let path = dir.join(".batchexec-apply.patch");
    std::fs::write(&path, diff_bytes)
        .with_context(|| format!("failed to write patch file at '{}'", path.display()))?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plausible_terminator_accepts_newline_ending() {
        assert!(has_plausible_terminator(b"diff --git a b\n+hello\n"));
    }

    #[test]
    fn plausible_terminator_accepts_empty() {
        assert!(has_plausible_terminator(b""));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }
}
