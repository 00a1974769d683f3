use pipeliner_core::CaptureStrategy;
use serde_json::Value;

/// Extract a value from command output.
///
/// `lines` is the buffered stdout. Every strategy except the line range works
/// on the lines joined with `\n`. Returns `None` when nothing matched; a
/// capture miss is never an error.
pub fn parse_capture(strategy: &CaptureStrategy, lines: &[String]) -> Option<String> {
    let text = lines.join("\n");
    match strategy {
        CaptureStrategy::Full => Some(text),
        CaptureStrategy::Regex(pattern) => {
            let re = regex::Regex::new(pattern).ok()?;
            let caps = re.captures(&text)?;
            let group = caps.get(1)?.as_str();
            (!group.is_empty()).then(|| group.to_string())
        }
        CaptureStrategy::Json(query) => {
            let data: Value = serde_json::from_str(&text).ok()?;
            json_path_query(&data, query).map(render)
        }
        CaptureStrategy::Yaml(query) => {
            let yaml: serde_yaml::Value = serde_yaml::from_str(&text).ok()?;
            let data = serde_json::to_value(yaml).ok()?;
            json_path_query(&data, query).map(render)
        }
        CaptureStrategy::KeyValue(key) => key_value(key, lines),
        CaptureStrategy::Markers { after, before } => markers(&text, after, before),
        CaptureStrategy::Lines { from, to } => line_range(lines, *from, *to),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn key_value(key: &str, lines: &[String]) -> Option<String> {
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let re = regex::Regex::new(&format!(r"^{}\s*=\s*(.+)$", regex::escape(key))).ok()?;

    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(caps) = re.captures(trimmed) {
            return Some(strip_quotes(caps[1].trim()).to_string());
        }
    }
    None
}

/// Remove one leading and one trailing quote character, if present.
fn strip_quotes(value: &str) -> &str {
    let value = value
        .strip_prefix('"')
        .or_else(|| value.strip_prefix('\''))
        .unwrap_or(value);
    value
        .strip_suffix('"')
        .or_else(|| value.strip_suffix('\''))
        .unwrap_or(value)
}

fn markers(text: &str, after: &Option<String>, before: &Option<String>) -> Option<String> {
    let after = after.as_deref().filter(|m| !m.is_empty());
    let before = before.as_deref().filter(|m| !m.is_empty());

    match (after, before) {
        (Some(after), before) => {
            let start = text.find(after)? + after.len();
            let end = match before {
                Some(before) => start + text[start..].find(before)?,
                None => text.len(),
            };
            Some(text[start..end].trim().to_string())
        }
        (None, Some(before)) => {
            let end = text.find(before)?;
            Some(text[..end].trim().to_string())
        }
        (None, None) => None,
    }
}

fn line_range(lines: &[String], from: i64, to: i64) -> Option<String> {
    if to < from {
        return None;
    }
    let start = usize::try_from((from - 1).max(0)).ok()?;
    let end = usize::try_from(to.max(0)).ok()?.min(lines.len());
    if start >= lines.len() || end <= start {
        return None;
    }
    Some(lines[start..end].join("\n"))
}

enum Segment {
    Key(String),
    Index(usize),
    Wildcard,
    /// `..`: the rest of the path may match at any depth.
    Descend,
}

/// Evaluate a JSONPath-style query (`$.a.b[0]`, `a['b c']`, `items[*].id`,
/// `$..id`).
///
/// Wildcards and recursive descent yield the first match in document order.
/// Filter expressions are not supported and never match.
fn json_path_query<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let segments = parse_path(path)?;
    query(value, &segments)
}

fn query<'a>(value: &'a Value, segments: &[Segment]) -> Option<&'a Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value);
    };
    let next = match first {
        Segment::Key(key) => value.get(key.as_str())?,
        Segment::Index(idx) => value.get(*idx)?,
        Segment::Wildcard => match value {
            Value::Array(items) => items.first()?,
            Value::Object(map) => map.values().next()?,
            _ => return None,
        },
        Segment::Descend => return descend(value, rest),
    };
    query(next, rest)
}

/// Depth-first search: the node itself, then its children in order.
fn descend<'a>(value: &'a Value, rest: &[Segment]) -> Option<&'a Value> {
    if let Some(found) = query(value, rest) {
        return Some(found);
    }
    match value {
        Value::Array(items) => items.iter().find_map(|child| descend(child, rest)),
        Value::Object(map) => map.values().find_map(|child| descend(child, rest)),
        _ => None,
    }
}

fn parse_path(path: &str) -> Option<Vec<Segment>> {
    let path = path.trim();
    let path = path.strip_prefix('$').unwrap_or(path);
    let mut segments = Vec::new();
    let mut chars = path.chars().peekable();
    let mut key = String::new();

    fn flush(key: &mut String, segments: &mut Vec<Segment>) {
        if !key.is_empty() {
            let k = std::mem::take(key);
            segments.push(if k == "*" {
                Segment::Wildcard
            } else {
                Segment::Key(k)
            });
        }
    }

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                flush(&mut key, &mut segments);
                if chars.peek() == Some(&'.') {
                    chars.next();
                    segments.push(Segment::Descend);
                }
            }
            '[' => {
                flush(&mut key, &mut segments);
                let mut inner = String::new();
                for c in chars.by_ref() {
                    if c == ']' {
                        break;
                    }
                    inner.push(c);
                }
                let inner = inner.trim();
                if inner == "*" {
                    segments.push(Segment::Wildcard);
                } else if let Some(quoted) = inner
                    .strip_prefix('\'')
                    .and_then(|s| s.strip_suffix('\''))
                    .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')))
                {
                    segments.push(Segment::Key(quoted.to_string()));
                } else {
                    segments.push(Segment::Index(inner.parse().ok()?));
                }
            }
            _ => key.push(c),
        }
    }
    flush(&mut key, &mut segments);
    Some(segments)
}
