//! Server configuration from environment variables

use crate::assembler::UsageAccounting;
use crate::cli::ToolPolicy;
use crate::runner::RunnerConfig;
use crate::store::EvictionPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Model aliases the tool accepts
pub const MODEL_ALIASES: &[&str] = &["sonnet", "opus", "haiku"];

#[derive(Debug, Clone)]
pub struct NakleConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub claude_bin: PathBuf,
    pub scratch_dir: PathBuf,
    pub timeout: Duration,
    pub lock_timeout: Option<Duration>,
    pub session_ttl: Duration,
    pub max_conversations: usize,
    pub sweep_interval: Duration,
    pub accounting: UsageAccounting,
    pub tool_policy: ToolPolicy,
    pub default_model: String,
}

impl NakleConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
        let db_path = lookup("NAKLE_DB_PATH")
            .or_else(|| lookup("USAGE_DB_PATH"))
            .map_or_else(
                || PathBuf::from(home).join(".nakle").join("nakle.db"),
                PathBuf::from,
            );

        let scratch_dir = lookup("NAKLE_SCRATCH_DIR").map_or_else(
            || std::env::temp_dir().join("nakle-scratch"),
            PathBuf::from,
        );

        let claude_bin = resolve_binary(&lookup("NAKLE_CLAUDE_BIN").unwrap_or_else(|| "claude".to_string()));

        let tool_policy = match lookup("NAKLE_ALLOWED_TOOLS") {
            Some(list) => ToolPolicy::new(list.split(',')),
            None => ToolPolicy::default(),
        };

        let default_model = match lookup("NAKLE_DEFAULT_MODEL") {
            Some(model) if MODEL_ALIASES.contains(&model.as_str()) => model,
            Some(model) => {
                tracing::warn!(value = %model, "Unknown NAKLE_DEFAULT_MODEL, using sonnet");
                "sonnet".to_string()
            }
            None => "sonnet".to_string(),
        };

        Self {
            port: parsed(&lookup, "NAKLE_PORT").unwrap_or(8000),
            db_path,
            claude_bin,
            scratch_dir,
            timeout: secs(&lookup, "NAKLE_TIMEOUT_SECS").unwrap_or(Duration::from_secs(300)),
            lock_timeout: secs(&lookup, "NAKLE_LOCK_TIMEOUT_SECS"),
            session_ttl: secs(&lookup, "NAKLE_SESSION_TTL_SECS")
                .unwrap_or(Duration::from_secs(24 * 60 * 60)),
            max_conversations: parsed(&lookup, "NAKLE_MAX_CONVERSATIONS").unwrap_or(10_000),
            sweep_interval: secs(&lookup, "NAKLE_SWEEP_INTERVAL_SECS")
                .unwrap_or(Duration::from_secs(300)),
            accounting: parsed(&lookup, "NAKLE_USAGE_ACCOUNTING").unwrap_or_default(),
            tool_policy,
            default_model,
        }
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            default_timeout: self.timeout,
            lock_timeout: self.lock_timeout,
            accounting: self.accounting,
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            idle_ttl: self.session_ttl,
            max_conversations: self.max_conversations,
        }
    }
}

fn parsed<F, T>(lookup: &F, key: &str) -> Option<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid configuration value");
            None
        }
    }
}

/// Whole seconds; zero is treated as invalid
fn secs<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    match parsed::<F, u64>(lookup, key) {
        Some(0) => {
            tracing::warn!(key, "Ignoring zero duration");
            None
        }
        other => other.map(Duration::from_secs),
    }
}

/// Resolve a bare program name on PATH; leave it as given when that fails so
/// the launch error names what was configured.
fn resolve_binary(name: &str) -> PathBuf {
    match which::which(name) {
        Ok(path) => path,
        Err(e) => {
            tracing::warn!(binary = %name, error = %e, "claude binary not found on PATH");
            PathBuf::from(name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> NakleConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        NakleConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let cfg = config(&[("HOME", "/home/someone")]);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.db_path, PathBuf::from("/home/someone/.nakle/nakle.db"));
        assert_eq!(cfg.timeout, Duration::from_secs(300));
        assert_eq!(cfg.lock_timeout, None);
        assert_eq!(cfg.session_ttl, Duration::from_secs(86_400));
        assert_eq!(cfg.max_conversations, 10_000);
        assert_eq!(cfg.accounting, UsageAccounting::PerInvocation);
        assert_eq!(cfg.tool_policy, ToolPolicy::default());
        assert_eq!(cfg.default_model, "sonnet");
    }

    #[test]
    fn test_overrides() {
        let cfg = config(&[
            ("NAKLE_PORT", "9100"),
            ("USAGE_DB_PATH", "/var/lib/usage.db"),
            ("NAKLE_TIMEOUT_SECS", "60"),
            ("NAKLE_LOCK_TIMEOUT_SECS", "5"),
            ("NAKLE_USAGE_ACCOUNTING", "cumulative"),
            ("NAKLE_ALLOWED_TOOLS", "Read, Bash, Grep"),
            ("NAKLE_DEFAULT_MODEL", "haiku"),
        ]);
        assert_eq!(cfg.port, 9100);
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/usage.db"));
        assert_eq!(cfg.timeout, Duration::from_secs(60));
        assert_eq!(cfg.lock_timeout, Some(Duration::from_secs(5)));
        assert_eq!(cfg.accounting, UsageAccounting::Cumulative);
        assert_eq!(cfg.tool_policy.allowed(), ["Read", "Grep"]);
        assert_eq!(cfg.default_model, "haiku");
    }

    #[test]
    fn test_nakle_db_path_wins() {
        let cfg = config(&[("NAKLE_DB_PATH", "/a.db"), ("USAGE_DB_PATH", "/b.db")]);
        assert_eq!(cfg.db_path, PathBuf::from("/a.db"));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = config(&[
            ("NAKLE_PORT", "not-a-port"),
            ("NAKLE_TIMEOUT_SECS", "0"),
            ("NAKLE_USAGE_ACCOUNTING", "sometimes"),
            ("NAKLE_DEFAULT_MODEL", "gpt-4"),
        ]);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.timeout, Duration::from_secs(300));
        assert_eq!(cfg.accounting, UsageAccounting::PerInvocation);
        assert_eq!(cfg.default_model, "sonnet");
    }

    #[test]
    fn test_runner_config_mirrors_settings() {
        let cfg = config(&[("NAKLE_TIMEOUT_SECS", "42")]);
        let runner = cfg.runner_config();
        assert_eq!(runner.default_timeout, Duration::from_secs(42));
        assert_eq!(cfg.eviction_policy().max_conversations, 10_000);
    }
}
