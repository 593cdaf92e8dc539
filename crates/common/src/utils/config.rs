use anyhow::{Context, Result};
use ::config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Loads configuration from a file into a struct.
/// Supports TOML, YAML, JSON, etc. based on file extension.
pub fn load_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    load_config_with_env(path, None)
}

/// Like [`load_config`], but values from `<PREFIX>__SECTION__KEY` environment
/// variables override the file.
pub fn load_config_with_env<T: DeserializeOwned, P: AsRef<Path>>(
    path: P,
    env_prefix: Option<&str>,
) -> Result<T> {
    let path_str = path.as_ref().to_str().context("Invalid config path")?;

    let mut builder = Config::builder().add_source(File::with_name(path_str));
    if let Some(prefix) = env_prefix {
        builder = builder.add_source(Environment::with_prefix(prefix).separator("__"));
    }

    let settings = builder.build().context("Failed to build configuration")?;

    settings
        .try_deserialize::<T>()
        .with_context(|| format!("Failed to deserialize configuration from {}", path_str))
}
