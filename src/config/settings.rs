use std::time::Duration;

use serde::{Deserialize, Deserializer};

pub const DEFAULT_WORKERS: usize = 10;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub run: RunSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub gc: GcSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub exec_timeout: Option<Duration>,
    #[serde(default)]
    pub no_errors: bool,
    #[serde(default)]
    pub only_updated: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            exec_timeout: None,
            no_errors: false,
            only_updated: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(
        default = "default_initial_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub initial_interval: Duration,
    #[serde(
        default = "default_max_interval",
        deserialize_with = "deserialize_duration"
    )]
    pub max_interval: Duration,
    #[serde(
        default = "default_max_elapsed",
        deserialize_with = "deserialize_duration"
    )]
    pub max_elapsed: Duration,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_interval: default_initial_interval(),
            max_interval: default_max_interval(),
            max_elapsed: default_max_elapsed(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeSettings {
    #[serde(
        default = "default_probe_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            timeout: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GcSettings {
    #[serde(default = "default_object_threshold")]
    pub object_threshold: usize,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            object_threshold: default_object_threshold(),
        }
    }
}

pub fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value.trim())
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw).map_err(serde::de::Error::custom)
}

fn deserialize_optional_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        Some(raw) => parse_duration(&raw)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_initial_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_elapsed() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_max_attempts() -> u32 {
    5
}

fn default_probe_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_object_threshold() -> usize {
    1
}
