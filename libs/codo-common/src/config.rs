// Engine configuration shared by api, worker and cli.
// Every setting comes from the environment with a conservative default.

use crate::error::ConfigError;
use crate::types::Limits;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Which sandbox backend the worker executes code with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxKind {
    Docker,
    Process,
}

impl FromStr for SandboxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(SandboxKind::Docker),
            "process" | "local" => Ok(SandboxKind::Process),
            other => Err(format!("expected 'docker' or 'process', got '{}'", other)),
        }
    }
}

impl fmt::Display for SandboxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxKind::Docker => f.write_str("docker"),
            SandboxKind::Process => f.write_str("process"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub redis_url: String,
    pub workers: usize,
    pub queue_ceiling: usize,
    pub max_attempts: u32,
    pub sandbox: SandboxKind,
    pub languages_path: String,
    pub api_addr: String,
    pub metrics_addr: String,
    pub lease_ttl: Duration,
    pub reaper_interval: Duration,
    pub default_limits: Limits,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            workers: 4,
            queue_ceiling: 1000,
            max_attempts: 2,
            sandbox: SandboxKind::Docker,
            languages_path: "config/languages.json".to_string(),
            api_addr: "0.0.0.0:3000".to_string(),
            metrics_addr: "0.0.0.0:9091".to_string(),
            lease_ttl: Duration::from_millis(30_000),
            reaper_interval: Duration::from_millis(5_000),
            default_limits: Limits::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let limits = defaults.default_limits;

        let config = Self {
            redis_url: lookup("REDIS_URL").unwrap_or(defaults.redis_url),
            workers: parse_or(&lookup, "CODO_WORKERS", defaults.workers)?,
            queue_ceiling: parse_or(&lookup, "CODO_QUEUE_CEILING", defaults.queue_ceiling)?,
            max_attempts: parse_or(&lookup, "CODO_MAX_ATTEMPTS", defaults.max_attempts)?,
            sandbox: parse_or(&lookup, "CODO_SANDBOX", defaults.sandbox)?,
            languages_path: lookup("CODO_LANGUAGES_PATH").unwrap_or(defaults.languages_path),
            api_addr: lookup("CODO_API_ADDR").unwrap_or(defaults.api_addr),
            metrics_addr: lookup("CODO_METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            lease_ttl: Duration::from_millis(parse_or(
                &lookup,
                "CODO_LEASE_TTL_MS",
                defaults.lease_ttl.as_millis() as u64,
            )?),
            reaper_interval: Duration::from_millis(parse_or(
                &lookup,
                "CODO_REAPER_INTERVAL_MS",
                defaults.reaper_interval.as_millis() as u64,
            )?),
            default_limits: Limits {
                cpu_time_ms: parse_or(&lookup, "CODO_CPU_TIME_MS", limits.cpu_time_ms)?,
                wall_time_ms: parse_or(&lookup, "CODO_WALL_TIME_MS", limits.wall_time_ms)?,
                memory_mb: parse_or(&lookup, "CODO_MEMORY_MB", limits.memory_mb)?,
                output_limit_bytes: parse_or(
                    &lookup,
                    "CODO_OUTPUT_LIMIT_BYTES",
                    limits.output_limit_bytes,
                )?,
                compile_time_ms: parse_or(&lookup, "CODO_COMPILE_TIME_MS", limits.compile_time_ms)?,
            },
        };

        if config.workers == 0 {
            return Err(ConfigError::Invalid {
                key: "CODO_WORKERS",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        if config.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "CODO_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_environment() {
        let config = EngineConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.queue_ceiling, 1000);
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.sandbox, SandboxKind::Docker);
        assert_eq!(config.default_limits, Limits::default());
    }

    #[test]
    fn test_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("CODO_WORKERS", "8"),
            ("CODO_SANDBOX", "process"),
            ("CODO_WALL_TIME_MS", "1500"),
            ("REDIS_URL", "redis://redis:6379"),
        ]))
        .unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.sandbox, SandboxKind::Process);
        assert_eq!(config.default_limits.wall_time_ms, 1500);
        assert_eq!(config.redis_url, "redis://redis:6379");
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = EngineConfig::from_lookup(lookup_from(&[("CODO_WORKERS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("CODO_WORKERS"));

        let err = EngineConfig::from_lookup(lookup_from(&[("CODO_WORKERS", "0")])).unwrap_err();
        assert!(err.to_string().contains("at least one worker"));

        let err = EngineConfig::from_lookup(lookup_from(&[("CODO_SANDBOX", "vm")])).unwrap_err();
        assert!(err.to_string().contains("CODO_SANDBOX"));
    }
}
