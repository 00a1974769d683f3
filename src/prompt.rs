use futures::future::BoxFuture;

use pipeliner_core::traits::Prompter;
use pipeliner_core::{ChoiceAnswer, ChoiceOption, PipelinerError, Result};

/// Terminal prompts for choose and prompt steps.
///
/// dialoguer blocks on stdin, so every prompt runs on the blocking pool.
pub struct DialoguerPrompter;

impl Prompter for DialoguerPrompter {
    fn choose(
        &self,
        message: &str,
        options: &[ChoiceOption],
    ) -> BoxFuture<'_, Result<ChoiceAnswer>> {
        let message = message.to_string();
        let options = options.to_vec();
        Box::pin(async move {
            let labels: Vec<String> = options.iter().map(|o| o.label.clone()).collect();
            let selected = tokio::task::spawn_blocking(move || {
                dialoguer::Select::new()
                    .with_prompt(message)
                    .items(&labels)
                    .default(0)
                    .interact_opt()
            })
            .await
            .map_err(|e| PipelinerError::Prompt(e.to_string()))?
            .map_err(|e| PipelinerError::Prompt(e.to_string()))?;

            let index = selected.ok_or_else(|| PipelinerError::Prompt("selection cancelled".into()))?;
            let option = options
                .get(index)
                .ok_or_else(|| PipelinerError::Prompt(format!("no option at index {}", index)))?;
            Ok(ChoiceAnswer {
                id: option.id.clone(),
                label: option.label.clone(),
            })
        })
    }

    fn text(&self, message: &str, default: Option<&str>) -> BoxFuture<'_, Result<String>> {
        let message = message.to_string();
        let default = default.map(String::from);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut input = dialoguer::Input::<String>::new()
                    .with_prompt(message)
                    .allow_empty(true);
                if let Some(default) = default {
                    input = input.default(default);
                }
                input.interact_text()
            })
            .await
            .map_err(|e| PipelinerError::Prompt(e.to_string()))?
            .map_err(|e| PipelinerError::Prompt(e.to_string()))
        })
    }
}
