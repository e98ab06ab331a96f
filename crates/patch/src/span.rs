use serde::{Deserialize, Serialize};

/// Half-open byte span of source text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_range(&self, start: usize, end: usize) -> bool {
        self.start <= start && end <= self.end
    }
}

/// Grow a removal unit so deleting it leaves tidy text.
///
/// A unit that is alone on its lines takes those whole lines, newline included.
/// Otherwise only the horizontal whitespace after it goes.
pub fn widen(source: &str, span: Span) -> Span {
    let line_start = source[..span.start].rfind('\n').map_or(0, |i| i + 1);
    let line_end = source[span.end..]
        .find('\n')
        .map_or(source.len(), |i| span.end + i + 1);

    let leading_blank = source[line_start..span.start]
        .bytes()
        .all(|b| b == b' ' || b == b'\t');
    let trailing_blank = source[span.end..line_end].trim().is_empty();
    if leading_blank && trailing_blank {
        return Span::new(line_start, line_end);
    }

    let trailing = source[span.end..]
        .bytes()
        .take_while(|b| matches!(b, b' ' | b'\t'))
        .count();
    Span::new(span.start, span.end + trailing)
}

/// Sorted spans with overlapping and nested ones folded together
pub fn merge_spans(mut spans: Vec<Span>) -> Vec<Span> {
    spans.retain(|span| !span.is_empty());
    spans.sort();
    let mut merged: Vec<Span> = Vec::with_capacity(spans.len());
    for span in spans {
        match merged.last_mut() {
            Some(last) if span.start < last.end => last.end = last.end.max(span.end),
            _ => merged.push(span),
        }
    }
    merged
}

/// `source` with every span cut out; `spans` must be sorted and disjoint
pub fn remove_spans(source: &str, spans: &[Span]) -> String {
    let removed: usize = spans.iter().map(Span::len).sum();
    let mut out = String::with_capacity(source.len().saturating_sub(removed));
    let mut cursor = 0;
    for span in spans {
        out.push_str(&source[cursor..span.start]);
        cursor = span.end;
    }
    out.push_str(&source[cursor..]);
    out
}

/// Brackets in `text` pair up once strings, templates and comments are skipped.
///
/// Regex literals are not recognised, so a bracket inside one reads as unbalanced.
pub fn brackets_balanced(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut stack: Vec<u8> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                match text[i + 2..].find("*/") {
                    Some(offset) => i += offset + 4,
                    None => return false,
                }
                continue;
            }
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                loop {
                    match bytes.get(i) {
                        None => return false,
                        Some(b'\\') => i += 2,
                        Some(&c) if c == quote => {
                            i += 1;
                            break;
                        }
                        Some(b'\n') if quote != b'`' => return false,
                        Some(_) => i += 1,
                    }
                }
                continue;
            }
            open @ (b'(' | b'[' | b'{') => stack.push(open),
            b')' if stack.pop() != Some(b'(') => return false,
            b']' if stack.pop() != Some(b'[') => return false,
            b'}' if stack.pop() != Some(b'{') => return false,
            _ => {}
        }
        i += 1;
    }

    stack.is_empty()
}

/// Deleting a statement at `span` could glue its neighbours into one expression
/// under automatic semicolon insertion (`a()\n<removed>\n(b)` becomes `a()(b)`).
pub fn asi_hazard(source: &str, span: Span) -> bool {
    let Some(next) = source[span.end..].trim_start().chars().next() else {
        return false;
    };
    if !matches!(next, '(' | '[' | '`' | '+' | '-' | '/') {
        return false;
    }
    match source[..span.start].trim_end().chars().last() {
        None => false,
        Some(prev) => !matches!(prev, ';' | '{'),
    }
}
