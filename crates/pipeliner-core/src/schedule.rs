use serde::{Deserialize, Deserializer, Serialize};

use crate::condition::scalar_to_string;

/// A persisted schedule entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub workflow_path: String,
    pub cron: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// UTC offset in hours, e.g. `"+9"`. Absent means system local time.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "opt_scalar"
    )]
    pub timezone: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub silent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,
}

impl Schedule {
    /// Name for display, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Fields supplied when adding a schedule; the store fills in the rest.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewSchedule {
    pub name: Option<String>,
    pub workflow_path: String,
    pub cron: String,
    pub enabled: bool,
    pub timezone: Option<String>,
    pub silent: bool,
    pub profile: Option<String>,
}

/// On-disk shape of the schedule store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleList {
    #[serde(default)]
    pub schedules: Vec<Schedule>,
}

/// A schedule definition file, used to add several schedules at once.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleDefinitionFile {
    pub schedules: Vec<ScheduleDefinition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDefinition {
    pub name: String,
    pub cron: String,
    pub workflow: String,
    #[serde(default)]
    pub base_dir: Option<String>,
    #[serde(default)]
    pub silent: bool,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default, deserialize_with = "opt_scalar")]
    pub timezone: Option<String>,
}

fn default_true() -> bool {
    true
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn opt_scalar<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(v) => scalar_to_string(&v)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("expected a string or number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_json_is_camel_case() {
        let schedule = Schedule {
            id: "ab12cd34".into(),
            name: Some("nightly".into()),
            workflow_path: "/flows/build.yaml".into(),
            cron: "0 2 * * *".into(),
            enabled: true,
            timezone: Some("+9".into()),
            silent: false,
            profile: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            last_run: None,
        };
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["workflowPath"], "/flows/build.yaml");
        assert_eq!(json["createdAt"], "2026-01-01T00:00:00Z");
        assert!(json.get("lastRun").is_none());
        assert!(json.get("silent").is_none());

        let back: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, schedule);
    }

    #[test]
    fn numeric_timezone_is_accepted() {
        let json = r#"{"id":"x","workflowPath":"w.yaml","cron":"* * * * *","enabled":true,"timezone":-5,"createdAt":"t"}"#;
        let schedule: Schedule = serde_json::from_str(json).unwrap();
        assert_eq!(schedule.timezone.as_deref(), Some("-5"));
        assert_eq!(schedule.display_name(), "x");
    }

    #[test]
    fn definition_file_parses_from_yaml() {
        let defs: ScheduleDefinitionFile = serde_yaml::from_str(
            r#"
schedules:
  - name: backup
    cron: "0 3 * * *"
    workflow: ./backup.yaml
    baseDir: /srv
    timezone: 9
    silent: true
"#,
        )
        .unwrap();
        let def = &defs.schedules[0];
        assert_eq!(def.base_dir.as_deref(), Some("/srv"));
        assert_eq!(def.timezone.as_deref(), Some("9"));
        assert!(def.silent);
        assert!(def.profile.is_none());
    }
}
