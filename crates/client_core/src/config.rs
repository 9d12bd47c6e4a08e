use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

use crate::RetryPolicy;

pub const DEFAULT_SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub service_url: String,
    pub retry_attempts: usize,
    pub retry_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            service_url: "https://bsky.social".into(),
            retry_attempts: retry.retries,
            retry_delay_ms: retry.delay.as_millis() as u64,
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retry_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    service_url: Option<String>,
    retry_attempts: Option<usize>,
    retry_delay_ms: Option<u64>,
}

/// Defaults, then `client.toml` in the working directory, then environment.
pub fn load_settings() -> anyhow::Result<Settings> {
    load_settings_from(Path::new(DEFAULT_SETTINGS_FILE), |key| std::env::var(key).ok())
}

pub fn load_settings_from(
    path: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    if path.exists() {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
        let file_cfg: FileSettings = toml::from_str(&raw)
            .with_context(|| format!("failed to parse settings file '{}'", path.display()))?;
        apply_file_settings(&mut settings, file_cfg);
    }

    apply_env_overrides(&mut settings, env);
    Ok(settings)
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.service_url {
        settings.service_url = v;
    }
    if let Some(v) = file_cfg.retry_attempts {
        settings.retry_attempts = v;
    }
    if let Some(v) = file_cfg.retry_delay_ms {
        settings.retry_delay_ms = v;
    }
}

fn apply_env_overrides(settings: &mut Settings, env: impl Fn(&str) -> Option<String>) {
    if let Some(v) = env("ATP_SERVICE_URL") {
        settings.service_url = v;
    }
    if let Some(v) = env("APP__SERVICE_URL") {
        settings.service_url = v;
    }

    if let Some(v) = env("APP__RETRY_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.retry_attempts = parsed;
        }
    }
    if let Some(v) = env("APP__RETRY_DELAY_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.retry_delay_ms = parsed;
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
