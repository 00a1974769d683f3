use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::workspace::Workspace;

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*(\w+)\s*\}\}").unwrap())
}

/// Replace `{{name}}` placeholders with workspace values.
///
/// Lookup order is variables, facts, choices. Unresolved placeholders are
/// left exactly as written.
pub fn substitute(template: &str, workspace: &Workspace) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| match workspace.template_value(&caps[1]) {
            Some(value) => value.to_string(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
