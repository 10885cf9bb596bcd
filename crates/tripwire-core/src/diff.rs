//! Unified-diff hunk parsing for inline-comment line mapping.
//!
//! The hosting service addresses review comments by *diff position*: the
//! 1-based index of a line inside a file's patch, where the first hunk header
//! is position 0 and every later hunk header takes up one position. Builds
//! report problems by new-file line number. [`FileDiff`] keeps enough of each
//! hunk to translate between the two without holding on to the patch text.

use tripwire_state::{FileRecord, Range};

/// Parse one file's unified-diff text into ordered ranges.
///
/// Lines before the first hunk header (`---`/`+++` file headers, `diff --git`)
/// are ignored. Within a hunk, a line starting with `-` is recorded as a
/// deletion at the current new-file line counter and does not advance it;
/// every other line, including `\ No newline at end of file`, advances the
/// counter by one. Headers whose new-file range would overflow `u32` are not
/// treated as headers.
pub fn parse_patch(patch: &str) -> Vec<Range> {
    let mut ranges = Vec::new();
    let mut current: Option<OpenHunk> = None;
    let mut offset = 0u32;
    let mut line_number = 0u32;

    for line in patch.lines() {
        if let Some((start, length)) = parse_hunk_header(line) {
            if let Some(hunk) = current.take() {
                offset = offset.saturating_add(hunk.close(offset, &mut ranges));
            }
            current = Some(OpenHunk {
                start,
                length,
                deletions: Vec::new(),
            });
            line_number = start;
            continue;
        }

        let Some(hunk) = current.as_mut() else {
            continue;
        };
        if line.starts_with('-') {
            hunk.deletions.push(line_number);
        } else {
            line_number = line_number.saturating_add(1);
        }
    }

    if let Some(hunk) = current.take() {
        hunk.close(offset, &mut ranges);
    }
    ranges
}

struct OpenHunk {
    start: u32,
    length: u32,
    deletions: Vec<u32>,
}

impl OpenHunk {
    /// Emit the range and return its block length.
    fn close(self, offset: u32, out: &mut Vec<Range>) -> u32 {
        let deletions = u32::try_from(self.deletions.len()).unwrap_or(u32::MAX);
        let block_length = self.length.saturating_add(deletions).saturating_add(1);
        out.push(Range {
            start: self.start,
            // parse_start_length guarantees this does not overflow
            end: self.start.saturating_add(self.length),
            block_length,
            offset,
            deletions: self.deletions,
        });
        block_length
    }
}

/// Parse `@@ -a[,b] +c[,d] @@ ...` into `(c, d)`. An omitted count means 1.
fn parse_hunk_header(line: &str) -> Option<(u32, u32)> {
    let rest = line.strip_prefix("@@ ")?;
    let (meta, _) = rest.split_once(" @@")?;

    let mut new_range = None;
    for part in meta.split_whitespace() {
        if let Some(stripped) = part.strip_prefix('+') {
            new_range = Some(parse_start_length(stripped)?);
        } else if part.strip_prefix('-').is_none() {
            return None;
        }
    }
    new_range
}

fn parse_start_length(s: &str) -> Option<(u32, u32)> {
    let (start, length): (u32, u32) = match s.split_once(',') {
        Some((start, length)) => (start.parse().ok()?, length.parse().ok()?),
        None => (s.parse().ok()?, 1),
    };
    start.checked_add(length)?;
    Some((start, length))
}

/// One slot in a hunk body, in patch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Deleted,
    Line(u32),
}

fn slots(range: &Range) -> impl Iterator<Item = Slot> + '_ {
    let deleted_at = move |line: u32| {
        range
            .deletions
            .iter()
            .filter(move |d| **d == line)
            .map(|_| Slot::Deleted)
    };
    (range.start..range.end)
        .flat_map(move |line| deleted_at(line).chain(std::iter::once(Slot::Line(line))))
        .chain(deleted_at(range.end))
}

/// Parsed diff of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub filename: String,
    /// Blob SHA of the file at the head commit
    pub sha: String,
    pub ranges: Vec<Range>,
}

impl FileDiff {
    /// Parse `patch` for `filename`. An absent patch (binary or oversized files) has no ranges.
    pub fn from_patch(
        filename: impl Into<String>,
        sha: impl Into<String>,
        patch: Option<&str>,
    ) -> Self {
        FileDiff {
            filename: filename.into(),
            sha: sha.into(),
            ranges: patch.map(parse_patch).unwrap_or_default(),
        }
    }

    /// New-file line shown at diff `position`.
    ///
    /// Returns `None` for removed lines, hunk headers and positions outside the patch.
    pub fn line_for_position(&self, position: u32) -> Option<u32> {
        let range = self
            .ranges
            .iter()
            .find(|r| {
                position > r.offset && position < r.offset.saturating_add(r.block_length)
            })?;
        let index = (position - range.offset - 1) as usize;
        match slots(range).nth(index)? {
            Slot::Line(line) => Some(line),
            Slot::Deleted => None,
        }
    }

    /// Diff position at which new-file `line` is shown, if the patch covers it.
    pub fn position_for_line(&self, line: u32) -> Option<u32> {
        let range = self
            .ranges
            .iter()
            .find(|r| line >= r.start && line < r.end)?;
        let deletions_before = range.deletions.iter().filter(|d| **d <= line).count() as u32;
        range
            .offset
            .checked_add(1)?
            .checked_add(line - range.start)?
            .checked_add(deletions_before)
    }

    /// `true` if `line` is part of the change (added or shown as context).
    pub fn covers_line(&self, line: u32) -> bool {
        self.ranges.iter().any(|r| line >= r.start && line < r.end)
    }

    /// Convert into a fresh per-file record with nothing reported yet.
    pub fn into_file_record(self) -> FileRecord {
        FileRecord {
            filename: self.filename,
            sha: self.sha,
            ranges: self.ranges,
            reported: Default::default(),
        }
    }
}
