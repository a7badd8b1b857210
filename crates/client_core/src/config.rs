use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::session::SessionSettings;

pub const DEFAULT_CONFIG_FILE: &str = "nebula_lens.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_base_url: String,
    /// Falls back to `api_base_url` when unset.
    pub explanation_base_url: Option<String>,
    pub explanations_enabled: bool,
    pub reveal_interval_ms: u64,
    /// `0` disables the timeout.
    pub request_timeout_secs: u64,
    pub log_capacity: Option<NonZeroUsize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "https://nebulalens-core.onrender.com".into(),
            explanation_base_url: None,
            explanations_enabled: false,
            reveal_interval_ms: 5,
            request_timeout_secs: 30,
            log_capacity: None,
        }
    }
}

impl Settings {
    pub fn explanation_base_url(&self) -> &str {
        self.explanation_base_url
            .as_deref()
            .unwrap_or(&self.api_base_url)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn session(&self) -> SessionSettings {
        SessionSettings {
            explanations_enabled: self.explanations_enabled,
            reveal_interval: Duration::from_millis(self.reveal_interval_ms.max(1)),
            log_capacity: self.log_capacity,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSettings {
    api_base_url: Option<String>,
    explanation_base_url: Option<String>,
    explanations_enabled: Option<bool>,
    reveal_interval_ms: Option<u64>,
    request_timeout_secs: Option<u64>,
    log_capacity: Option<usize>,
}

/// Defaults, then the TOML file, then `NEBULA_LENS_*` environment variables.
///
/// An explicit `path` must exist; otherwise `nebula_lens.toml` in the working
/// directory is read when present.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();

    let file = match path {
        Some(path) => Some(path.to_path_buf()),
        None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|path| path.exists()),
    };
    if let Some(file) = file {
        let raw = fs::read_to_string(&file)
            .with_context(|| format!("failed to read config file '{}'", file.display()))?;
        apply_file(&mut settings, &raw)
            .with_context(|| format!("invalid config file '{}'", file.display()))?;
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

pub fn apply_file(settings: &mut Settings, raw: &str) -> Result<()> {
    let file: FileSettings = toml::from_str(raw)?;
    if let Some(v) = file.api_base_url {
        settings.api_base_url = v;
    }
    if let Some(v) = file.explanation_base_url {
        settings.explanation_base_url = Some(v);
    }
    if let Some(v) = file.explanations_enabled {
        settings.explanations_enabled = v;
    }
    if let Some(v) = file.reveal_interval_ms {
        settings.reveal_interval_ms = v;
    }
    if let Some(v) = file.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
    if let Some(v) = file.log_capacity {
        settings.log_capacity = NonZeroUsize::new(v);
    }
    Ok(())
}

/// Unparseable values are logged and ignored.
pub fn apply_env(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("NEBULA_LENS_API_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = lookup("NEBULA_LENS_EXPLANATION_URL") {
        settings.explanation_base_url = Some(v);
    }
    if let Some(v) = lookup("NEBULA_LENS_EXPLANATIONS") {
        match parse_flag(&v) {
            Some(enabled) => settings.explanations_enabled = enabled,
            None => warn!("ignoring NEBULA_LENS_EXPLANATIONS={v}: expected true/false"),
        }
    }
    if let Some(v) = lookup("NEBULA_LENS_REVEAL_INTERVAL_MS") {
        match v.trim().parse() {
            Ok(parsed) => settings.reveal_interval_ms = parsed,
            Err(err) => warn!("ignoring NEBULA_LENS_REVEAL_INTERVAL_MS={v}: {err}"),
        }
    }
    if let Some(v) = lookup("NEBULA_LENS_REQUEST_TIMEOUT_SECS") {
        match v.trim().parse() {
            Ok(parsed) => settings.request_timeout_secs = parsed,
            Err(err) => warn!("ignoring NEBULA_LENS_REQUEST_TIMEOUT_SECS={v}: {err}"),
        }
    }
    if let Some(v) = lookup("NEBULA_LENS_LOG_CAPACITY") {
        match v.trim().parse::<usize>() {
            Ok(parsed) => settings.log_capacity = NonZeroUsize::new(parsed),
            Err(err) => warn!("ignoring NEBULA_LENS_LOG_CAPACITY={v}: {err}"),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
