use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use crate::error::{PipelinerError, Result};
use crate::workflow::{Step, StepKind, Workflow};

/// Read, parse and validate a workflow file.
///
/// `.json` files are parsed as JSON, everything else as YAML.
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    let mut workflow = if is_json {
        parse_json(&content)?
    } else {
        let mut wf = parse_yaml(&content)?;
        wf.line_numbers = yaml_step_lines(&content);
        wf
    };

    workflow.file_path = Some(path.to_path_buf());
    workflow.file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned());

    debug!(
        path = %path.display(),
        steps = workflow.steps.len(),
        "Loaded workflow"
    );
    Ok(workflow)
}

/// Parse and validate YAML workflow text.
pub fn parse_yaml(content: &str) -> Result<Workflow> {
    let workflow: Workflow = serde_yaml::from_str(content)
        .map_err(|e| PipelinerError::WorkflowParse(e.to_string()))?;
    validate(&workflow)?;
    Ok(workflow)
}

/// Parse and validate JSON workflow text.
pub fn parse_json(content: &str) -> Result<Workflow> {
    let workflow: Workflow = serde_json::from_str(content)
        .map_err(|e| PipelinerError::WorkflowParse(e.to_string()))?;
    validate(&workflow)?;
    Ok(workflow)
}

/// Structural checks serde cannot express.
pub fn validate(workflow: &Workflow) -> Result<()> {
    if workflow.steps.is_empty() {
        return Err(PipelinerError::WorkflowValidation(
            "workflow must have at least one step".to_string(),
        ));
    }
    if let Some(shell) = &workflow.shell {
        if shell.is_empty() {
            return Err(PipelinerError::WorkflowValidation(
                "shell must have at least one element".to_string(),
            ));
        }
    }
    for profile in &workflow.profiles {
        if profile.name.trim().is_empty() {
            return Err(PipelinerError::WorkflowValidation(
                "profile name must not be empty".to_string(),
            ));
        }
    }
    for (index, step) in workflow.steps.iter().enumerate() {
        if let StepKind::Parallel(parallel) = &step.kind {
            check_parallel_branches(index, &parallel.steps)?;
        }
    }
    Ok(())
}

fn check_parallel_branches(index: usize, branches: &[Step]) -> Result<()> {
    for branch in branches {
        if branch.is_interactive() {
            return Err(PipelinerError::WorkflowValidation(format!(
                "step {}: '{}' steps are not allowed inside parallel",
                index,
                branch.kind_name()
            )));
        }
        if let StepKind::Parallel(nested) = &branch.kind {
            check_parallel_branches(index, &nested.steps)?;
        }
    }
    Ok(())
}

/// Map top-level step index to its 1-based line in the YAML text.
fn yaml_step_lines(content: &str) -> HashMap<usize, usize> {
    let mut lines = HashMap::new();
    let mut in_steps = false;
    let mut item_indent: Option<usize> = None;
    let mut index = 0;

    for (i, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = line.len() - trimmed.len();

        if indent == 0 && trimmed.starts_with("steps:") {
            in_steps = true;
            continue;
        }
        if !in_steps {
            continue;
        }
        if indent == 0 && !trimmed.starts_with('-') {
            break;
        }
        if trimmed.starts_with('-') {
            let expected = *item_indent.get_or_insert(indent);
            if indent == expected {
                lines.insert(index, i + 1);
                index += 1;
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_steps() {
        let err = parse_yaml("steps: []").unwrap_err();
        assert!(matches!(err, PipelinerError::WorkflowValidation(_)));
    }

    #[test]
    fn rejects_interactive_step_in_nested_parallel() {
        let err = parse_yaml(
            r#"
steps:
  - parallel:
      - run: echo a
      - parallel:
          - prompt:
              message: Name?
              as: name
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not allowed inside parallel"));
    }

    #[test]
    fn rejects_empty_shell() {
        assert!(parse_yaml("shell: []\nsteps:\n  - run: ls\n").is_err());
    }

    #[test]
    fn parse_errors_are_reported_as_parse() {
        let err = parse_yaml("steps: [ { run: ").unwrap_err();
        assert!(matches!(err, PipelinerError::WorkflowParse(_)));
    }

    #[test]
    fn json_workflow() {
        let wf = parse_json(r#"{"name":"j","steps":[{"run":"echo 1"},{"fail":{"message":"no"}}]}"#)
            .unwrap();
        assert_eq!(wf.steps.len(), 2);
    }

    #[test]
    fn line_numbers_track_top_level_items_only() {
        let text = "name: x\n\nsteps:\n  - run: echo a\n  - parallel:\n      - run: b\n      - run: c\n  # note\n  - run: d\nprofiles: []\n";
        let lines = yaml_step_lines(text);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[&0], 4);
        assert_eq!(lines[&1], 5);
        assert_eq!(lines[&2], 9);
    }

    #[test]
    fn load_sets_file_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yml");
        std::fs::write(&path, "steps:\n  - run: echo hi\n").unwrap();
        let wf = load_workflow(&path).unwrap();
        assert_eq!(wf.file_name.as_deref(), Some("flow.yml"));
        assert_eq!(wf.line_numbers.get(&0), Some(&2));
        assert_eq!(wf.resolved_base_dir().as_deref(), Some(dir.path()));
    }
}
