use std::path::{Path, PathBuf};

use tracing::debug;

use pipeliner_core::{
    NewSchedule, PipelinerError, Result, Schedule, ScheduleDefinition, ScheduleDefinitionFile,
};

use crate::cron_expr;
use crate::store::ScheduleStore;

/// Read a schedule definition file (`.yaml`, `.yml` or `.json`).
pub async fn parse_definition_file(path: &Path) -> Result<ScheduleDefinitionFile> {
    let content = tokio::fs::read_to_string(path).await?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let file: ScheduleDefinitionFile = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| PipelinerError::ScheduleConfig(format!("Invalid YAML format: {}", e)))?,
        "json" => serde_json::from_str(&content)
            .map_err(|e| PipelinerError::ScheduleConfig(format!("Invalid JSON format: {}", e)))?,
        other => {
            return Err(PipelinerError::ScheduleConfig(format!(
                "Unsupported file format: .{}. Use .yaml, .yml, or .json",
                other
            )))
        }
    };
    validate(&file)?;
    Ok(file)
}

/// Check every definition, reporting all problems at once.
pub fn validate(file: &ScheduleDefinitionFile) -> Result<()> {
    if file.schedules.is_empty() {
        return Err(PipelinerError::ScheduleConfig(
            "Schedule file must have at least one schedule".into(),
        ));
    }

    let mut problems = Vec::new();
    for (i, def) in file.schedules.iter().enumerate() {
        if def.name.trim().is_empty() {
            problems.push(format!("schedules[{}]: name must be non-empty", i));
        }
        if def.workflow.trim().is_empty() {
            problems.push(format!("schedules[{}]: workflow path is required", i));
        }
        if let Err(e) = cron_expr::parse(&def.cron) {
            problems.push(format!("{}: {}", def.name, e));
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PipelinerError::ScheduleConfig(format!(
            "Invalid schedule file:\n  - {}",
            problems.join("\n  - ")
        )))
    }
}

/// Where a definition's workflow lives.
///
/// Absolute paths are kept. Relative ones resolve against `baseDir` when set,
/// otherwise against the definition file's directory. The result is always
/// absolute; relative bases are taken from the process directory.
pub fn resolve_workflow_path(definition_file: &Path, def: &ScheduleDefinition) -> Result<PathBuf> {
    let workflow = Path::new(&def.workflow);
    if workflow.is_absolute() {
        return Ok(workflow.to_path_buf());
    }
    let base = match &def.base_dir {
        Some(dir) => PathBuf::from(dir),
        None => definition_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default(),
    };
    let base = if base.is_absolute() {
        base
    } else {
        std::env::current_dir()?.join(base)
    };
    Ok(base.join(workflow))
}

/// Turn a definition into a store entry. `name` overrides the definition's name.
pub fn to_new_schedule(
    definition_file: &Path,
    def: &ScheduleDefinition,
    name: Option<String>,
) -> Result<NewSchedule> {
    let workflow_path = resolve_workflow_path(definition_file, def)?;
    Ok(NewSchedule {
        name: Some(name.unwrap_or_else(|| def.name.clone())),
        workflow_path: workflow_path.to_string_lossy().into_owned(),
        cron: def.cron.clone(),
        enabled: true,
        timezone: def.timezone.clone(),
        silent: def.silent,
        profile: def.profile.clone(),
    })
}

/// Parse, validate and add every schedule in a definition file.
///
/// Nothing is added if any workflow file is missing.
pub async fn add_from_file(store: &ScheduleStore, path: &Path) -> Result<Vec<Schedule>> {
    let file = parse_definition_file(path).await?;

    let mut pending = Vec::with_capacity(file.schedules.len());
    let mut missing = Vec::new();
    for def in &file.schedules {
        let new = to_new_schedule(path, def, None)?;
        if !Path::new(&new.workflow_path).exists() {
            missing.push(format!("{}: {} (resolved: {})", def.name, def.workflow, new.workflow_path));
        }
        pending.push(new);
    }
    if !missing.is_empty() {
        return Err(PipelinerError::ScheduleConfig(format!(
            "Workflow file(s) not found:\n  - {}",
            missing.join("\n  - ")
        )));
    }

    let mut added = Vec::with_capacity(pending.len());
    for new in pending {
        added.push(store.add(new).await?);
    }
    debug!(file = %path.display(), count = added.len(), "Added schedules from file");
    Ok(added)
}
