//! Scenario Commands

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use serde::Serialize;
use std::path::{Path, PathBuf};

use runcast_common::{Scenario, StepDefinition};

use crate::client::ServerClient;
use crate::output::{print_item, print_list, print_success, OutputFormat, TableDisplay};

#[derive(Subcommand)]
pub enum ScenarioCommands {
    /// Create or replace a scenario from a JSON or YAML file
    Put {
        /// Scenario file (.json, .yaml or .yml)
        file: PathBuf,

        /// Store under this id instead of the one in the file
        #[arg(long)]
        id: Option<String>,
    },

    /// Show a scenario and its steps
    Get {
        /// Scenario ID
        id: String,

        /// Print the steps as well
        #[arg(short, long)]
        steps: bool,
    },
}

/// Scenario display wrapper for serialization
#[derive(Serialize)]
pub struct ScenarioDisplay {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub steps: usize,
}

impl From<&Scenario> for ScenarioDisplay {
    fn from(scenario: &Scenario) -> Self {
        Self {
            id: scenario.id.clone(),
            name: scenario.name.clone(),
            base_url: scenario.base_url.clone().unwrap_or_default(),
            steps: scenario.steps.len(),
        }
    }
}

impl TableDisplay for ScenarioDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["ID", "Name", "Base URL", "Steps"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.base_url.clone(),
            self.steps.to_string(),
        ]
    }
}

#[derive(Serialize)]
pub struct StepDisplay {
    pub index: usize,
    pub id: String,
    pub name: String,
    pub action: String,
}

impl StepDisplay {
    fn new(index: usize, step: &StepDefinition) -> Self {
        Self {
            index: index + 1,
            id: step.id.clone(),
            name: step.name.clone(),
            action: step.action.label(),
        }
    }
}

impl TableDisplay for StepDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Step", "Name", "Action"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            self.index.to_string(),
            self.id.clone(),
            self.name.clone(),
            self.action.clone(),
        ]
    }
}

/// Read a scenario file; YAML by extension, JSON otherwise
pub fn load_scenario(path: &Path, id: Option<&str>) -> Result<Scenario> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let mut scenario: Scenario = if is_yaml {
        serde_yaml::from_str(&content)
            .with_context(|| format!("invalid scenario in {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("invalid scenario in {}", path.display()))?
    };

    if let Some(id) = id {
        scenario.id = id.to_string();
    }
    if scenario.id.trim().is_empty() {
        bail!("scenario in {} has no id (use --id)", path.display());
    }
    scenario.validate()?;
    Ok(scenario)
}

pub async fn execute(cmd: ScenarioCommands, client: ServerClient, format: OutputFormat) -> Result<()> {
    match cmd {
        ScenarioCommands::Put { file, id } => {
            let scenario = load_scenario(&file, id.as_deref())?;
            let stored = client.put_scenario(&scenario).await?;
            print_success(&format!(
                "Scenario '{}' stored ({} steps)",
                stored.id,
                stored.steps.len()
            ));
            print_item(&ScenarioDisplay::from(&stored), format);
        }

        ScenarioCommands::Get { id, steps } => {
            let scenario = client.get_scenario(&id).await?;
            print_item(&ScenarioDisplay::from(&scenario), format);
            if steps {
                let displays: Vec<StepDisplay> = scenario
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(i, step)| StepDisplay::new(i, step))
                    .collect();
                print_list(&displays, format);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use runcast_common::StepAction;

    fn write(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "login.yaml",
            r##"
id: login
name: Login
baseUrl: http://app.local
steps:
  - id: open
    name: Open
    action:
      type: navigate
      url: /login
  - id: submit
    name: Submit
    action:
      type: click
      selector: "#go"
"##,
        );

        let scenario = load_scenario(&path, None).unwrap();
        assert_eq!(scenario.id, "login");
        assert_eq!(scenario.steps.len(), 2);
        assert!(matches!(scenario.steps[1].action, StepAction::Click { .. }));
    }

    #[test]
    fn test_load_json_with_id_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "s.json",
            r#"{"id": "", "name": "S", "steps": [{"id": "a", "name": "A", "action": {"type": "sleep", "ms": 5}}]}"#,
        );

        assert!(load_scenario(&path, None).is_err());
        let scenario = load_scenario(&path, Some("smoke")).unwrap();
        assert_eq!(scenario.id, "smoke");
    }

    #[test]
    fn test_rejects_duplicate_step_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(
            &dir,
            "dup.json",
            r#"{"id": "d", "name": "D", "steps": [
                {"id": "a", "name": "A", "action": {"type": "sleep", "ms": 1}},
                {"id": "a", "name": "A again", "action": {"type": "sleep", "ms": 1}}
            ]}"#,
        );
        let err = load_scenario(&path, None).unwrap_err();
        assert!(err.to_string().contains("duplicate step id a"));
    }
}
