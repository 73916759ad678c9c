use anyhow::Context;
use std::path::Path;
use tracing::{debug, info, warn};
use tre_orchestrator::{OrchestratorError, Template, TemplateRepository};

/// Register every `*.json` template in `dir`. Templates that are already
/// registered are skipped. Returns the number of newly registered templates.
pub async fn load_templates(dir: &Path, templates: &TemplateRepository) -> anyhow::Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read templates directory {}", dir.display()))?;

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    // Registration order decides which version ends up current
    paths.sort();

    let mut registered = 0;
    for path in paths {
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read template {}", path.display()))?;
        let template: Template = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid template file {}", path.display()))?;

        match templates.register(template).await {
            Ok(template) => {
                debug!(name = %template.name, version = %template.version, "Loaded template");
                registered += 1;
            }
            Err(OrchestratorError::Conflict(reason)) => {
                debug!(path = %path.display(), %reason, "Template already registered");
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping template");
            }
        }
    }

    info!(registered, dir = %dir.display(), "Templates loaded");
    Ok(registered)
}
