use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::ManagerConfig;

/// Load configuration from a file using the config crate.
/// The format (TOML, YAML, JSON) is picked from the file extension.
pub async fn load_config(config_path: &str) -> Result<ManagerConfig> {
    load_config_sync(config_path)
}

/// Load configuration synchronously
pub fn load_config_sync(config_path: &str) -> Result<ManagerConfig> {
    let config_path = Path::new(config_path);

    let format = match config_path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        _ => FileFormat::Toml,
    };

    let settings = Config::builder()
        .add_source(File::new(
            config_path
                .to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", config_path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", config_path.display()))?;

    settings.try_deserialize().with_context(|| {
        format!(
            "Failed to deserialize config from {}",
            config_path.display()
        )
    })
}
