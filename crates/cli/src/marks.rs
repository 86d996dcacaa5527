//! Reading live digests for a mark phase.

use anyhow::{Context, Result};
use depot_store::MarkPhase;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Mark every digest listed in `reader`, one per line.
///
/// Blank lines and lines starting with `#` are ignored. Returns the number of
/// distinct digests marked.
pub async fn read_marks<R>(reader: R, phase: &MarkPhase) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut marked = 0usize;

    while let Some(line) = lines.next_line().await.context("failed to read marks")? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if phase
            .mark_str(line)
            .with_context(|| format!("line {line_no}: invalid digest {line:?}"))?
        {
            marked += 1;
        }
    }

    Ok(marked)
}
