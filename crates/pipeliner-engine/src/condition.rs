use std::path::Path;

use pipeliner_core::Condition;

use crate::workspace::Workspace;

/// Evaluates `when:` conditions against a workspace.
///
/// Total: every condition yields a boolean, unknown shapes yield false.
pub struct ConditionEvaluator<'a> {
    workspace: &'a Workspace,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(workspace: &'a Workspace) -> Self {
        Self { workspace }
    }

    pub fn evaluate(&self, condition: &Condition) -> bool {
        match condition {
            Condition::VarExists(name) => {
                self.workspace.has_variable(name) || self.workspace.has_fact(name)
            }
            Condition::VarEquals(expected) => expected
                .iter()
                .all(|(name, value)| self.workspace.effective_value(name) == Some(value.as_str())),
            Condition::FileExists(path) => file_exists(path),
            Condition::Choice(id) => self.workspace.has_choice(id),
            Condition::All(items) => items.iter().all(|c| self.evaluate(c)),
            Condition::Any(items) => items.iter().any(|c| self.evaluate(c)),
            Condition::Not(inner) => !self.evaluate(inner),
            Condition::Unknown => false,
        }
    }
}

/// Relative paths resolve against the process working directory.
fn file_exists(path: &str) -> bool {
    let path = path.trim();
    if path.is_empty() {
        return false;
    }
    let path = Path::new(path);
    if path.is_absolute() {
        return path.exists();
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path).exists(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn var_eq(pairs: &[(&str, &str)]) -> Condition {
        Condition::VarEquals(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn empty_all_and_any() {
        let ws = Workspace::new();
        let eval = ConditionEvaluator::new(&ws);
        assert!(eval.evaluate(&Condition::All(vec![])));
        assert!(!eval.evaluate(&Condition::Any(vec![])));
    }

    #[test]
    fn var_equality_uses_variables_then_facts() {
        let mut ws = Workspace::new();
        assert!(!ConditionEvaluator::new(&ws).evaluate(&var_eq(&[("a", "x")])));

        ws.set_fact("a", "x");
        assert!(ConditionEvaluator::new(&ws).evaluate(&var_eq(&[("a", "x")])));

        ws.set_variable("a", "y");
        let eval = ConditionEvaluator::new(&ws);
        assert!(!eval.evaluate(&var_eq(&[("a", "x")])));
        assert!(eval.evaluate(&var_eq(&[("a", "y")])));
        assert!(!eval.evaluate(&var_eq(&[("a", "y"), ("b", "z")])));
        assert!(eval.evaluate(&var_eq(&[])));
    }

    #[test]
    fn existence_checks_variables_and_facts() {
        let mut ws = Workspace::new();
        ws.set_fact("answer", "");
        let eval = ConditionEvaluator::new(&ws);
        assert!(eval.evaluate(&Condition::VarExists("answer".into())));
        assert!(!eval.evaluate(&Condition::VarExists("missing".into())));
    }

    #[test]
    fn choice_and_negation() {
        let mut ws = Workspace::new();
        ws.set_choice("dev");
        let eval = ConditionEvaluator::new(&ws);
        assert!(eval.evaluate(&Condition::Choice("dev".into())));
        assert!(eval.evaluate(&Condition::Not(Box::new(Condition::Choice("prod".into())))));
        assert!(!eval.evaluate(&Condition::Unknown));
        assert!(eval.evaluate(&Condition::Not(Box::new(Condition::Unknown))));
    }

    #[test]
    fn file_condition_sees_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new();
        let eval = ConditionEvaluator::new(&ws);
        let path = dir.path().to_string_lossy().into_owned();
        assert!(eval.evaluate(&Condition::FileExists(path.clone())));
        assert!(!eval.evaluate(&Condition::FileExists(format!("{}/nope", path))));
    }

    #[test]
    fn evaluation_is_repeatable() {
        let mut ws = Workspace::new();
        ws.set_variable("env", "prod");
        let cond = Condition::Any(vec![
            var_eq(&[("env", "prod")]),
            Condition::Choice("x".into()),
        ]);
        let eval = ConditionEvaluator::new(&ws);
        assert_eq!(eval.evaluate(&cond), eval.evaluate(&cond));
    }
}
