//! Loading analysis configurations from disk.

use std::path::Path;

use anyhow::Context;
use imagec_pipeline::AnalysisConfig;

/// Read the JSON configuration at `path`.
///
/// Relative image paths are resolved against the configuration file's
/// directory, so a configuration can be moved together with its images.
///
/// # Errors
///
/// Fails if the file cannot be read or is not a valid configuration.
/// The configuration is not checked; see [`AnalysisConfig::check`].
pub fn load_config(path: &Path) -> anyhow::Result<AnalysisConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let mut config: AnalysisConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    if let Some(base) = path.parent() {
        for image in &mut config.images {
            if image.path.is_relative() {
                image.path = base.join(&image.path);
            }
        }
    }
    tracing::debug!(
        path = %path.display(),
        images = config.images.len(),
        pipelines = config.pipelines.len(),
        "configuration loaded"
    );
    Ok(config)
}
