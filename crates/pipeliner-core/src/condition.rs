use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer};
use serde_yaml::Value;

/// A `when:` condition, recognized purely by the shape of its mapping.
///
/// Shapes are tried in a fixed order: `var`/`has`, `file`, `choice`,
/// `all`, `any`, `not`. Anything else becomes [`Condition::Unknown`],
/// which always evaluates to false.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    FileExists(String),
    VarExists(String),
    VarEquals(BTreeMap<String, String>),
    Choice(String),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    Unknown,
}

impl Condition {
    pub fn from_value(value: &Value) -> Self {
        let Value::Mapping(map) = value else {
            return Self::Unknown;
        };
        let get = |key: &str| map.get(key);

        if let Some(name) = get("has").and_then(Value::as_str) {
            return Self::VarExists(name.to_string());
        }
        if let Some(var) = get("var") {
            return match var {
                Value::String(name) if !name.is_empty() => Self::VarExists(name.clone()),
                Value::Mapping(pairs) => {
                    let mut expected = BTreeMap::new();
                    for (k, v) in pairs {
                        match (k.as_str(), scalar_to_string(v)) {
                            (Some(k), Some(v)) => {
                                expected.insert(k.to_string(), v);
                            }
                            _ => return Self::Unknown,
                        }
                    }
                    Self::VarEquals(expected)
                }
                _ => Self::Unknown,
            };
        }
        if let Some(path) = get("file").and_then(Value::as_str) {
            return Self::FileExists(path.to_string());
        }
        if let Some(id) = get("choice").and_then(scalar_to_string) {
            return Self::Choice(id);
        }
        if let Some(Value::Sequence(items)) = get("all") {
            return Self::All(items.iter().map(Self::from_value).collect());
        }
        if let Some(Value::Sequence(items)) = get("any") {
            return Self::Any(items.iter().map(Self::from_value).collect());
        }
        if let Some(inner) = get("not") {
            return Self::Not(Box::new(Self::from_value(inner)));
        }
        Self::Unknown
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&value))
    }
}

/// Render a YAML scalar as a string. Returns `None` for null and collections.
pub fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Tagged(tagged) => scalar_to_string(&tagged.value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(yaml: &str) -> Condition {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn recognizes_each_shape() {
        assert_eq!(cond("var: env"), Condition::VarExists("env".into()));
        assert_eq!(cond("has: env"), Condition::VarExists("env".into()));
        assert_eq!(cond("file: ./x"), Condition::FileExists("./x".into()));
        assert_eq!(cond("choice: dev"), Condition::Choice("dev".into()));
        assert_eq!(
            cond("var: { replicas: 3, env: prod }"),
            Condition::VarEquals(BTreeMap::from([
                ("env".to_string(), "prod".to_string()),
                ("replicas".to_string(), "3".to_string()),
            ]))
        );
        assert_eq!(
            cond("not: { choice: dev }"),
            Condition::Not(Box::new(Condition::Choice("dev".into())))
        );
        assert_eq!(
            cond("all: [ { var: a }, { has: b } ]"),
            Condition::All(vec![
                Condition::VarExists("a".into()),
                Condition::VarExists("b".into())
            ])
        );
    }

    #[test]
    fn has_wins_over_var() {
        assert_eq!(cond("{ var: a, has: b }"), Condition::VarExists("b".into()));
    }

    #[test]
    fn unknown_shapes_do_not_fail_parsing() {
        assert_eq!(cond("whatever: 1"), Condition::Unknown);
        assert_eq!(cond("\"just a string\""), Condition::Unknown);
        assert_eq!(cond("var: [1, 2]"), Condition::Unknown);
        assert_eq!(
            cond("any: [ { bogus: true } ]"),
            Condition::Any(vec![Condition::Unknown])
        );
    }
}
