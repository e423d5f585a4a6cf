//! Layered settings for pipewright.
//!
//! Values are resolved in order, later layers winning:
//! built-in defaults, then `pipewright.toml` (or the file given with
//! `--config`), then `PIPEWRIGHT_*` environment variables (a `.env` file is
//! loaded first), then command-line flags.
//!
//! ```toml
//! [database]
//! path = ".pipewright/pipewright.db"
//!
//! [server]
//! host = "127.0.0.1"
//! port = 8340
//! cors_permissive = false
//!
//! [dispatch]
//! soft_time_limit_secs = 600
//! hard_time_limit_secs = 900
//! workers = 2
//! poll_interval_ms = 500
//!
//! [generation]
//! base_url = "https://api.openai.com/v1"
//! model = "gpt-4o"
//! max_attempts = 3
//! min_backoff_secs = 2
//! max_backoff_secs = 60
//! request_timeout_secs = 120
//!
//! [logging]
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::agents::client::RetryPolicy;
use crate::logging::LogFormat;
use crate::pipeline::dispatch::DispatchLimits;
use crate::pipeline::server::ServerConfig;

pub const DEFAULT_CONFIG_FILE: &str = "pipewright.toml";
const ENV_PREFIX: &str = "PIPEWRIGHT_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".pipewright/pipewright.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Allow any origin (for a UI served from another port).
    pub cors_permissive: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8340,
            cors_permissive: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub soft_time_limit_secs: u64,
    pub hard_time_limit_secs: u64,
    pub workers: usize,
    pub poll_interval_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            soft_time_limit_secs: 600,
            hard_time_limit_secs: 900,
            workers: 2,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSection {
    pub base_url: String,
    pub model: String,
    /// Usually supplied through `PIPEWRIGHT_GENERATION_API_KEY`.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub max_attempts: u32,
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
            max_attempts: 3,
            min_backoff_secs: 2,
            max_backoff_secs: 60,
            request_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database: DatabaseSection,
    pub server: ServerSection,
    pub dispatch: DispatchSection,
    pub generation: GenerationSection,
    pub logging: LoggingSection,
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid value '{}' for {}: {}", value, key, e))
}

fn parse_env_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => bail!("Invalid value '{}' for {}: expected true or false", value, key),
    }
}

impl Settings {
    /// Parse settings from a TOML string; missing keys keep their defaults.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse pipewright.toml")
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Defaults, then the config file, then the process environment.
    /// An explicit `path` must exist; the default file is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::load_file(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        settings.apply_env(std::env::vars())?;
        Ok(settings)
    }

    /// Apply `PIPEWRIGHT_<SECTION>_<KEY>` overrides. Unknown keys are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "DATABASE_PATH" => self.database.path = PathBuf::from(value),
                "SERVER_HOST" => self.server.host = value,
                "SERVER_PORT" => self.server.port = parse_env(&key, &value)?,
                "SERVER_CORS_PERMISSIVE" => self.server.cors_permissive = parse_env_bool(&key, &value)?,
                "DISPATCH_SOFT_TIME_LIMIT_SECS" => {
                    self.dispatch.soft_time_limit_secs = parse_env(&key, &value)?
                }
                "DISPATCH_HARD_TIME_LIMIT_SECS" => {
                    self.dispatch.hard_time_limit_secs = parse_env(&key, &value)?
                }
                "DISPATCH_WORKERS" => self.dispatch.workers = parse_env(&key, &value)?,
                "DISPATCH_POLL_INTERVAL_MS" => self.dispatch.poll_interval_ms = parse_env(&key, &value)?,
                "GENERATION_BASE_URL" => self.generation.base_url = value,
                "GENERATION_MODEL" => self.generation.model = value,
                "GENERATION_API_KEY" => {
                    self.generation.api_key = Some(value).filter(|v| !v.trim().is_empty())
                }
                "GENERATION_MAX_ATTEMPTS" => self.generation.max_attempts = parse_env(&key, &value)?,
                "GENERATION_MIN_BACKOFF_SECS" => {
                    self.generation.min_backoff_secs = parse_env(&key, &value)?
                }
                "GENERATION_MAX_BACKOFF_SECS" => {
                    self.generation.max_backoff_secs = parse_env(&key, &value)?
                }
                "GENERATION_REQUEST_TIMEOUT_SECS" => {
                    self.generation.request_timeout_secs = parse_env(&key, &value)?
                }
                "LOG_FORMAT" => self.logging.format = parse_env(&key, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject settings the dispatcher or client cannot run with.
    pub fn validate(&self) -> Result<()> {
        let d = &self.dispatch;
        if d.soft_time_limit_secs == 0 {
            bail!("dispatch.soft_time_limit_secs must be at least 1");
        }
        if d.hard_time_limit_secs <= d.soft_time_limit_secs {
            bail!(
                "dispatch.hard_time_limit_secs ({}) must be greater than soft_time_limit_secs ({})",
                d.hard_time_limit_secs,
                d.soft_time_limit_secs
            );
        }
        if d.workers == 0 {
            bail!("dispatch.workers must be at least 1");
        }
        if d.poll_interval_ms == 0 {
            bail!("dispatch.poll_interval_ms must be at least 1");
        }
        let g = &self.generation;
        if g.max_attempts == 0 {
            bail!("generation.max_attempts must be at least 1");
        }
        if g.max_backoff_secs < g.min_backoff_secs {
            bail!("generation.max_backoff_secs must not be below min_backoff_secs");
        }
        if g.base_url.trim().is_empty() {
            bail!("generation.base_url must not be empty");
        }
        Ok(())
    }

    pub fn dispatch_limits(&self) -> DispatchLimits {
        DispatchLimits {
            soft_time_limit: Duration::from_secs(self.dispatch.soft_time_limit_secs),
            hard_time_limit: Duration::from_secs(self.dispatch.hard_time_limit_secs),
            workers: self.dispatch.workers,
            poll_interval: Duration::from_millis(self.dispatch.poll_interval_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.generation.max_attempts,
            min_backoff: Duration::from_secs(self.generation.min_backoff_secs),
            max_backoff: Duration::from_secs(self.generation.max_backoff_secs),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.generation.request_timeout_secs)
    }

    pub fn server_config(&self, with_workers: bool) -> ServerConfig {
        ServerConfig {
            host: self.server.host.clone(),
            port: self.server.port,
            cors_permissive: self.server.cors_permissive,
            with_workers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.server.port, 8340);
        assert_eq!(settings.dispatch.workers, 2);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
        assert_eq!(settings.retry_policy(), RetryPolicy::default());
        assert_eq!(settings.dispatch_limits(), DispatchLimits::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let settings = Settings::parse(
            r#"
[server]
port = 9000

[dispatch]
workers = 4

[logging]
format = "json"
"#,
        )
        .unwrap();
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.dispatch.workers, 4);
        assert_eq!(settings.dispatch.hard_time_limit_secs, 900);
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn load_reads_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\npath = \"/tmp/elsewhere.db\"").unwrap();
        let settings = Settings::load_file(file.path()).unwrap();
        assert_eq!(settings.database.path, PathBuf::from("/tmp/elsewhere.db"));
    }

    #[test]
    fn load_fails_for_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(Settings::load(Some(&missing)).is_err());
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Settings::parse("[server\nport = ").is_err());
        assert!(Settings::parse("[server]\nport = \"high\"").is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut settings = Settings::parse("[server]\nport = 9000").unwrap();
        settings
            .apply_env(vars(&[
                ("PIPEWRIGHT_SERVER_PORT", "9100"),
                ("PIPEWRIGHT_SERVER_CORS_PERMISSIVE", "yes"),
                ("PIPEWRIGHT_DISPATCH_WORKERS", "8"),
                ("PIPEWRIGHT_GENERATION_API_KEY", "sk-test"),
                ("PIPEWRIGHT_LOG_FORMAT", "json"),
                ("PIPEWRIGHT_SOMETHING_ELSE", "ignored"),
                ("HOME", "/root"),
            ]))
            .unwrap();
        assert_eq!(settings.server.port, 9100);
        assert!(settings.server.cors_permissive);
        assert_eq!(settings.dispatch.workers, 8);
        assert_eq!(settings.generation.api_key.as_deref(), Some("sk-test"));
        assert_eq!(settings.logging.format, LogFormat::Json);
    }

    #[test]
    fn bad_env_value_names_the_variable() {
        let mut settings = Settings::default();
        let err = settings
            .apply_env(vars(&[("PIPEWRIGHT_SERVER_PORT", "eighty")]))
            .unwrap_err();
        assert!(err.to_string().contains("PIPEWRIGHT_SERVER_PORT"));
    }

    #[test]
    fn blank_api_key_is_treated_as_unset() {
        let mut settings = Settings::default();
        settings
            .apply_env(vars(&[("PIPEWRIGHT_GENERATION_API_KEY", "  ")]))
            .unwrap();
        assert!(settings.generation.api_key.is_none());
    }

    #[test]
    fn hard_limit_must_exceed_soft_limit() {
        let mut settings = Settings::default();
        settings.dispatch.hard_time_limit_secs = 600;
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("hard_time_limit_secs"));

        settings.dispatch.hard_time_limit_secs = 601;
        settings.validate().unwrap();
    }

    #[test]
    fn zero_workers_is_invalid() {
        let mut settings = Settings::default();
        settings.dispatch.workers = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn api_key_is_never_serialized() {
        let mut settings = Settings::default();
        settings.generation.api_key = Some("sk-secret".into());
        let rendered = toml::to_string(&settings).unwrap();
        assert!(!rendered.contains("sk-secret"));
    }
}
