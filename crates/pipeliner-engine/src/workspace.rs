use std::collections::{HashMap, HashSet};

/// Mutable state of one workflow run.
///
/// `Clone` gives a fully independent copy, used for parallel branches.
/// [`Workspace::merge_from`] brings back only variables and facts; choices
/// and step results of a branch stay with the branch.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    variables: HashMap<String, String>,
    facts: HashMap<String, String>,
    choices: HashSet<String>,
    step_results: HashMap<usize, bool>,
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn fact(&self, name: &str) -> Option<&str> {
        self.facts.get(name).map(String::as_str)
    }

    pub fn set_fact(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.facts.insert(name.into(), value.into());
    }

    pub fn has_fact(&self, name: &str) -> bool {
        self.facts.contains_key(name)
    }

    pub fn set_choice(&mut self, id: impl Into<String>) {
        self.choices.insert(id.into());
    }

    pub fn has_choice(&self, id: &str) -> bool {
        self.choices.contains(id)
    }

    pub fn step_result(&self, index: usize) -> Option<bool> {
        self.step_results.get(&index).copied()
    }

    pub fn set_step_result(&mut self, index: usize, success: bool) {
        self.step_results.insert(index, success);
    }

    /// Variable, else fact.
    pub fn effective_value(&self, name: &str) -> Option<&str> {
        self.variable(name).or_else(|| self.fact(name))
    }

    /// Value for `{{name}}` substitution: variables, then facts, then choices.
    ///
    /// A choice resolves to its own id.
    pub fn template_value<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        self.effective_value(name)
            .or_else(|| self.choices.get(name).map(String::as_str))
    }

    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    pub fn facts(&self) -> &HashMap<String, String> {
        &self.facts
    }

    /// Copy `other`'s variables and facts into `self`, overwriting on collision.
    pub fn merge_from(&mut self, other: &Workspace) {
        for (k, v) in &other.variables {
            self.variables.insert(k.clone(), v.clone());
        }
        for (k, v) in &other.facts {
            self.facts.insert(k.clone(), v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_differs_from_empty() {
        let mut ws = Workspace::new();
        assert_eq!(ws.variable("a"), None);
        ws.set_variable("a", "");
        assert_eq!(ws.variable("a"), Some(""));
        assert!(ws.has_variable("a"));
    }

    #[test]
    fn clone_is_isolated_until_merge() {
        let mut parent = Workspace::new();
        parent.set_variable("shared", "parent");

        let mut branch = parent.clone();
        branch.set_variable("shared", "branch");
        branch.set_fact("answer", "42");
        branch.set_choice("dev");
        branch.set_step_result(1001, true);

        assert_eq!(parent.variable("shared"), Some("parent"));
        assert!(!parent.has_fact("answer"));
        assert!(!parent.has_choice("dev"));

        parent.merge_from(&branch);
        assert_eq!(parent.variable("shared"), Some("branch"));
        assert_eq!(parent.fact("answer"), Some("42"));
        assert!(!parent.has_choice("dev"));
        assert_eq!(parent.step_result(1001), None);
    }

    #[test]
    fn template_value_priority() {
        let mut ws = Workspace::new();
        ws.set_choice("x");
        assert_eq!(ws.template_value("x"), Some("x"));
        ws.set_fact("x", "fact");
        assert_eq!(ws.template_value("x"), Some("fact"));
        ws.set_variable("x", "var");
        assert_eq!(ws.template_value("x"), Some("var"));
    }
}
