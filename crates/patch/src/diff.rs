//! Unified diffs for pure-deletion patches: rendering, parsing and checked application.

use crate::error::{PatchError, Result};
use crate::span::{remove_spans, Span};

const NO_NEWLINE_MARKER: &str = "\\ No newline at end of file\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Removed(String),
    Added(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub old_start: usize,
    pub old_count: usize,
    pub new_start: usize,
    pub new_count: usize,
    pub lines: Vec<HunkLine>,
}

/// Hunks for one file of a unified diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiff {
    pub path: String,
    pub hunks: Vec<Hunk>,
}

/// Lines touched by a group of spans, in 0-based line numbers (inclusive)
struct Region {
    first: usize,
    last: usize,
    new_lines: Vec<String>,
}

/// Render the removal of `spans` (sorted, disjoint) from `source` as a unified diff.
///
/// Returns an empty string when nothing is removed.
pub fn render_file_diff(path: &str, source: &str, spans: &[Span], context: usize) -> String {
    if spans.is_empty() || source.is_empty() {
        return String::new();
    }

    let lines: Vec<&str> = source.split_inclusive('\n').collect();
    let mut starts = Vec::with_capacity(lines.len());
    let mut offset = 0;
    for line in &lines {
        starts.push(offset);
        offset += line.len();
    }
    let line_of = |offset: usize| starts.partition_point(|&start| start <= offset).saturating_sub(1);

    // spans sharing a line belong to the same region
    let mut grouped: Vec<(usize, usize, Vec<Span>)> = Vec::new();
    for span in spans.iter().filter(|span| !span.is_empty()) {
        let first = line_of(span.start);
        let last = line_of(span.end - 1);
        match grouped.last_mut() {
            Some((_, group_last, members)) if first <= *group_last => {
                *group_last = (*group_last).max(last);
                members.push(*span);
            }
            _ => grouped.push((first, last, vec![*span])),
        }
    }

    let regions: Vec<Region> = grouped
        .into_iter()
        .map(|(first, last, members)| {
            let base = starts[first];
            let end = starts[last] + lines[last].len();
            let relative: Vec<Span> = members
                .iter()
                .map(|span| Span::new(span.start - base, span.end - base))
                .collect();
            let kept = remove_spans(&source[base..end], &relative);
            Region {
                first,
                last,
                new_lines: kept.split_inclusive('\n').map(str::to_string).collect(),
            }
        })
        .collect();

    let mut out = format!("--- a/{path}\n+++ b/{path}\n");
    let mut delta: isize = 0;
    let mut idx = 0;

    while idx < regions.len() {
        let mut end = idx;
        while end + 1 < regions.len()
            && regions[end + 1].first - regions[end].last - 1 <= 2 * context
        {
            end += 1;
        }
        let group = &regions[idx..=end];

        let old_from = group[0].first.saturating_sub(context);
        let old_to = (group[group.len() - 1].last + context).min(lines.len() - 1);

        let mut body = String::new();
        let mut old_count = 0;
        let mut new_count = 0;
        let mut line = old_from;
        for region in group {
            for text in &lines[line..region.first] {
                push_line(&mut body, ' ', text);
                old_count += 1;
                new_count += 1;
            }
            for text in &lines[region.first..=region.last] {
                push_line(&mut body, '-', text);
                old_count += 1;
            }
            for text in &region.new_lines {
                push_line(&mut body, '+', text);
                new_count += 1;
            }
            line = region.last + 1;
        }
        for text in &lines[line..=old_to] {
            push_line(&mut body, ' ', text);
            old_count += 1;
            new_count += 1;
        }

        let new_from = (old_from as isize + delta).max(0) as usize;
        let new_start = if new_count == 0 { new_from } else { new_from + 1 };
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            old_from + 1,
            old_count,
            new_start,
            new_count
        ));
        out.push_str(&body);

        delta += new_count as isize - old_count as isize;
        idx = end + 1;
    }

    out
}

fn push_line(out: &mut String, prefix: char, text: &str) {
    out.push(prefix);
    out.push_str(text);
    if !text.ends_with('\n') {
        out.push('\n');
        out.push_str(NO_NEWLINE_MARKER);
    }
}

/// Parse a (possibly multi-file) unified diff.
///
/// Hunk bodies are read by their header counts, so content lines that look like
/// file headers are not misread.
pub fn parse_unified_diff(text: &str) -> Result<Vec<FileDiff>> {
    let mut files = Vec::new();
    let mut lines = text.split_inclusive('\n').peekable();

    while let Some(line) = lines.next() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with("--- ") {
            return Err(PatchError::malformed(format!(
                "expected file header, found {:?}",
                line.trim_end()
            )));
        }
        let new_header = lines
            .next()
            .and_then(|l| l.strip_prefix("+++ "))
            .ok_or_else(|| PatchError::malformed("missing +++ header"))?;
        let new_header = new_header.trim_end();
        let path = new_header.strip_prefix("b/").unwrap_or(new_header).to_string();

        let mut hunks = Vec::new();
        while lines.peek().is_some_and(|l| l.starts_with("@@ ")) {
            let header = lines.next().unwrap_or_default();
            let ((old_start, old_count), (new_start, new_count)) = parse_hunk_header(header)?;

            let mut body = Vec::new();
            let (mut old_seen, mut new_seen) = (0, 0);
            while old_seen < old_count || new_seen < new_count {
                let raw = lines
                    .next()
                    .ok_or_else(|| PatchError::malformed(format!("truncated hunk in {path}")))?;
                let (tag, content) = match raw.char_indices().nth(1) {
                    Some((split, _)) => (raw.as_bytes()[0], &raw[split..]),
                    None => (raw.as_bytes()[0], "\n"),
                };
                let content = content.to_string();
                let line = match tag {
                    b' ' | b'\n' => {
                        old_seen += 1;
                        new_seen += 1;
                        HunkLine::Context(content)
                    }
                    b'-' => {
                        old_seen += 1;
                        HunkLine::Removed(content)
                    }
                    b'+' => {
                        new_seen += 1;
                        HunkLine::Added(content)
                    }
                    _ => {
                        return Err(PatchError::malformed(format!(
                            "unexpected hunk line {:?} in {path}",
                            raw.trim_end()
                        )))
                    }
                };
                body.push(line);

                if lines.peek().is_some_and(|l| l.starts_with('\\')) {
                    lines.next();
                    if let Some(
                        HunkLine::Context(text) | HunkLine::Removed(text) | HunkLine::Added(text),
                    ) = body.last_mut()
                    {
                        if text.ends_with('\n') {
                            text.pop();
                        }
                    }
                }
            }

            hunks.push(Hunk {
                old_start,
                old_count,
                new_start,
                new_count,
                lines: body,
            });
        }

        files.push(FileDiff { path, hunks });
    }

    Ok(files)
}

fn parse_hunk_header(line: &str) -> Result<((usize, usize), (usize, usize))> {
    let ranges = line
        .strip_prefix("@@ -")
        .and_then(|rest| rest.split_once(" @@"))
        .map(|(ranges, _)| ranges)
        .ok_or_else(|| PatchError::malformed(format!("bad hunk header {:?}", line.trim_end())))?;
    let (old, new) = ranges
        .split_once(" +")
        .ok_or_else(|| PatchError::malformed(format!("bad hunk header {:?}", line.trim_end())))?;
    Ok((parse_range(old)?, parse_range(new)?))
}

fn parse_range(range: &str) -> Result<(usize, usize)> {
    let number = |s: &str| {
        s.parse::<usize>()
            .map_err(|_| PatchError::malformed(format!("bad hunk range {range:?}")))
    };
    match range.split_once(',') {
        Some((start, count)) => Ok((number(start)?, number(count)?)),
        None => Ok((number(range)?, 1)),
    }
}

/// Apply `diff` to `original`, requiring every context and removed line to match
pub fn apply_file_diff(original: &str, diff: &FileDiff) -> Result<String> {
    let lines: Vec<&str> = original.split_inclusive('\n').collect();
    let mut out = String::with_capacity(original.len());
    let mut cursor = 0;

    for hunk in &diff.hunks {
        let at = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if at < cursor || at > lines.len() {
            return Err(PatchError::conflict(
                &diff.path,
                format!("hunk at line {} does not fit the file", hunk.old_start),
            ));
        }
        for line in &lines[cursor..at] {
            out.push_str(line);
        }
        cursor = at;

        for line in &hunk.lines {
            match line {
                HunkLine::Context(expected) | HunkLine::Removed(expected) => {
                    let actual = lines.get(cursor).ok_or_else(|| {
                        PatchError::conflict(&diff.path, "file ends before the hunk does")
                    })?;
                    if actual != expected {
                        return Err(PatchError::conflict(
                            &diff.path,
                            format!("line {} differs from the diff", cursor + 1),
                        ));
                    }
                    if matches!(line, HunkLine::Context(_)) {
                        out.push_str(actual);
                    }
                    cursor += 1;
                }
                HunkLine::Added(text) => out.push_str(text),
            }
        }
    }

    for line in &lines[cursor..] {
        out.push_str(line);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn numbered(count: usize) -> String {
        (1..=count).map(|n| format!("line{n};\n")).collect()
    }

    fn line_span(source: &str, line: &str) -> Span {
        let start = source.find(line).expect("line");
        Span::new(start, start + line.len())
    }

    #[test]
    fn test_single_line_edit_without_trailing_newline() {
        let source = "function used(){return 1;} function unused(){return 2;} used();";
        let diff = render_file_diff("app.js", source, &[Span::new(27, 56)], 3);
        assert_eq!(
            diff,
            "--- a/app.js\n+++ b/app.js\n@@ -1,1 +1,1 @@\n\
             -function used(){return 1;} function unused(){return 2;} used();\n\
             \\ No newline at end of file\n\
             +function used(){return 1;} used();\n\
             \\ No newline at end of file\n"
        );
    }

    #[test]
    fn test_distant_removals_make_two_hunks() {
        let source = numbered(12);
        let spans = [line_span(&source, "line2;\n"), line_span(&source, "line11;\n")];
        let diff = render_file_diff("a.js", &source, &spans, 3);

        let headers: Vec<_> = diff.lines().filter(|l| l.starts_with("@@")).collect();
        assert_eq!(headers, vec!["@@ -1,5 +1,4 @@", "@@ -8,5 +7,4 @@"]);
    }

    #[test]
    fn test_close_removals_share_a_hunk() {
        let source = numbered(12);
        let spans = [line_span(&source, "line2;\n"), line_span(&source, "line8;\n")];
        let diff = render_file_diff("a.js", &source, &spans, 3);
        let headers: Vec<_> = diff.lines().filter(|l| l.starts_with("@@")).collect();
        assert_eq!(headers, vec!["@@ -1,11 +1,9 @@"]);
    }

    #[test]
    fn test_parse_and_apply_reproduces_removal() {
        let source = numbered(12);
        let spans = [line_span(&source, "line2;\n"), line_span(&source, "line11;\n")];
        let diff = render_file_diff("a.js", &source, &spans, 3);

        let files = parse_unified_diff(&diff).expect("parse");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "a.js");
        let patched = apply_file_diff(&source, &files[0]).expect("apply");
        assert_eq!(patched, remove_spans(&source, &spans));
    }

    #[test]
    fn test_removed_line_resembling_header() {
        let source = "a;\n-- b;\nc;\n";
        let spans = [line_span(source, "-- b;\n")];
        let diff = render_file_diff("x.js", source, &spans, 1);
        assert!(diff.contains("\n--- b;\n"));

        let files = parse_unified_diff(&diff).expect("parse");
        assert_eq!(files.len(), 1);
        assert_eq!(apply_file_diff(source, &files[0]).expect("apply"), "a;\nc;\n");
    }

    #[test]
    fn test_apply_detects_drift() {
        let source = numbered(6);
        let diff = render_file_diff("a.js", &source, &[line_span(&source, "line3;\n")], 3);
        let files = parse_unified_diff(&diff).expect("parse");

        let drifted = source.replace("line2;", "line2 = 0;");
        assert!(matches!(
            apply_file_diff(&drifted, &files[0]),
            Err(PatchError::Conflict { .. })
        ));
    }

    #[test]
    fn test_multi_file_parse() {
        let a = numbered(3);
        let mut combined = render_file_diff("a.js", &a, &[line_span(&a, "line1;\n")], 3);
        combined.push_str(&render_file_diff("b.js", &a, &[line_span(&a, "line3;\n")], 3));
        let files = parse_unified_diff(&combined).expect("parse");
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.js", "b.js"]);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_unified_diff("hello\n").is_err());
        assert!(parse_unified_diff("--- a/x\n+++ b/x\n@@ -1,2 +1,1 @@\n-a\n").is_err());
    }
}
