use std::env;
use std::path::{Path, PathBuf};

use crate::config::{ConfigError, Settings};

pub const CONFIG_FILE_NAME: &str = ".repofleet.toml";

pub fn load_settings(
    explicit: Option<PathBuf>,
    start: impl AsRef<Path>,
) -> Result<Settings, ConfigError> {
    let from_env = env::var("REPOFLEET_CONFIG").ok().map(PathBuf::from);
    let mut settings = match resolve_config_path(explicit, from_env, start.as_ref())? {
        Some(path) => load_settings_file(&path)?,
        None => Settings::default(),
    };
    apply_env_overrides(&mut settings)?;
    Ok(settings)
}

pub fn resolve_config_path(
    explicit: Option<PathBuf>,
    from_env: Option<PathBuf>,
    start: &Path,
) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit.or(from_env) {
        if !path.is_file() {
            return Err(ConfigError::ConfigNotFound(path));
        }
        return Ok(Some(path));
    }

    Ok(find_config_from(start))
}

pub fn load_settings_file(path: &Path) -> Result<Settings, ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::ConfigNotFound(path.to_path_buf()));
    }

    let contents = std::fs::read_to_string(path)?;
    tracing::debug!(path = %path.display(), "loading settings");
    toml::from_str(&contents).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env_overrides(settings: &mut Settings) -> Result<(), ConfigError> {
    if let Ok(value) = env::var("REPOFLEET_WORKERS") {
        settings.run.workers = parse_workers(&value)?;
    }
    Ok(())
}

pub fn parse_workers(value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(workers) if workers > 0 => Ok(workers),
        _ => Err(ConfigError::InvalidValue {
            key: "workers".to_string(),
            value: value.to_string(),
        }),
    }
}

fn find_config_from(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|ancestor| ancestor.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}
