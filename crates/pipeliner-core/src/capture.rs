use serde::Deserialize;

/// One capture rule of a run step: how to extract a value from stdout and
/// which variable receives it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawCapture")]
pub struct Capture {
    pub strategy: CaptureStrategy,
    pub as_var: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureStrategy {
    /// Whole output.
    Full,
    /// First capture group (or whole match) of a regular expression.
    Regex(String),
    /// JSONPath-like query into output parsed as JSON.
    Json(String),
    /// Same query language, output parsed as YAML.
    Yaml(String),
    /// Value for a key in `KEY=value` lines.
    KeyValue(String),
    /// Substring after and/or before the given markers.
    Markers {
        after: Option<String>,
        before: Option<String>,
    },
    /// Inclusive 1-based line range.
    Lines { from: i64, to: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LineRange {
    pub from: i64,
    pub to: i64,
}

#[derive(Deserialize)]
struct RawCapture {
    #[serde(rename = "as", default)]
    as_var: Option<String>,
    #[serde(default)]
    regex: Option<String>,
    #[serde(default)]
    json: Option<String>,
    #[serde(default)]
    yaml: Option<String>,
    #[serde(default)]
    yml: Option<String>,
    #[serde(default)]
    kv: Option<String>,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    before: Option<String>,
    #[serde(default)]
    line: Option<LineRange>,
}

impl TryFrom<RawCapture> for Capture {
    type Error = String;

    fn try_from(raw: RawCapture) -> Result<Self, Self::Error> {
        let strategy = if let Some(pattern) = raw.regex {
            CaptureStrategy::Regex(pattern)
        } else if let Some(query) = raw.json {
            CaptureStrategy::Json(query)
        } else if let Some(query) = raw.yaml.or(raw.yml) {
            CaptureStrategy::Yaml(query)
        } else if let Some(key) = raw.kv {
            CaptureStrategy::KeyValue(key)
        } else if raw.after.is_some() || raw.before.is_some() {
            CaptureStrategy::Markers {
                after: raw.after,
                before: raw.before,
            }
        } else if let Some(range) = raw.line {
            CaptureStrategy::Lines {
                from: range.from,
                to: range.to,
            }
        } else {
            CaptureStrategy::Full
        };

        if let Some(name) = &raw.as_var {
            if name.trim().is_empty() {
                return Err("capture 'as' must not be empty".to_string());
            }
        }

        Ok(Capture {
            strategy,
            as_var: raw.as_var,
        })
    }
}
