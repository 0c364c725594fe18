//! Engine configuration from environment variables.
//!
//! Environment variables (defaults in parentheses):
//! - `AGG_MAX_TASKS_PER_RUN` (20)
//! - `AGG_MAX_WINDOWS_PER_TASK` (100)
//! - `AGG_RUNNING_STALE_SECONDS` (900)
//! - `AGG_AUTO_DISABLE_HARD_FAILS` (3)
//! - `AGG_DERIVATION_VERSION` (1)
//! - `AGG_ENV` ("prod")
//! - `AGG_JOB_NAME` ("aggregation")
//! - `AGG_RUN_LOG_KEEP` (100)
//! - `AGG_TASK_CONCURRENCY` (1)
//! - `AGG_MAX_RUN_BUDGET_MS` (unset = no budget)
//! - `AGG_UNIFIED_START` (unset, RFC 3339)
//! - `AGG_FORCE_INCOMPLETE` (false)
//! - `AGG_CLASSIFY_BY_MESSAGE` (false)
//! - `AGG_SCHEDULE_INTERVAL_SECONDS` (300)

use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: cannot parse {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },

    #[error("{key} must not be empty")]
    Empty { key: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deployment scope; only tasks of this environment are selected.
    pub environment: String,
    pub job_name: String,

    pub max_tasks_per_run: u32,
    pub max_windows_per_task: u32,
    pub running_stale_seconds: u64,
    pub auto_disable_hard_fails: u32,
    pub derivation_version: u32,

    /// Run records kept per job by `prune`.
    pub run_log_keep: usize,
    pub task_concurrency: usize,

    /// Wall-clock budget; remaining tasks are deferred once it is spent.
    pub max_run_budget: Option<Duration>,

    /// Shared bootstrap epoch, floored per timeframe.
    pub unified_start: Option<DateTime<Utc>>,
    pub force_incomplete: bool,
    pub classify_by_message: bool,
    pub schedule_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            environment: "prod".to_string(),
            job_name: "aggregation".to_string(),
            max_tasks_per_run: 20,
            max_windows_per_task: 100,
            running_stale_seconds: 900,
            auto_disable_hard_fails: 3,
            derivation_version: 1,
            run_log_keep: 100,
            task_concurrency: 1,
            max_run_budget: None,
            unified_start: None,
            force_incomplete: false,
            classify_by_message: false,
            schedule_interval: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load through an arbitrary lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let config = Self {
            environment: get("AGG_ENV").unwrap_or(d.environment),
            job_name: get("AGG_JOB_NAME").unwrap_or(d.job_name),
            max_tasks_per_run: parse(&get, "AGG_MAX_TASKS_PER_RUN")?.unwrap_or(d.max_tasks_per_run),
            max_windows_per_task: parse(&get, "AGG_MAX_WINDOWS_PER_TASK")?
                .unwrap_or(d.max_windows_per_task),
            running_stale_seconds: parse(&get, "AGG_RUNNING_STALE_SECONDS")?
                .unwrap_or(d.running_stale_seconds),
            auto_disable_hard_fails: parse(&get, "AGG_AUTO_DISABLE_HARD_FAILS")?
                .unwrap_or(d.auto_disable_hard_fails),
            derivation_version: parse(&get, "AGG_DERIVATION_VERSION")?
                .unwrap_or(d.derivation_version),
            run_log_keep: parse(&get, "AGG_RUN_LOG_KEEP")?.unwrap_or(d.run_log_keep),
            task_concurrency: parse(&get, "AGG_TASK_CONCURRENCY")?.unwrap_or(d.task_concurrency),
            max_run_budget: parse::<u64>(&get, "AGG_MAX_RUN_BUDGET_MS")?.map(Duration::from_millis),
            unified_start: parse_timestamp(&get, "AGG_UNIFIED_START")?,
            force_incomplete: parse_flag(&get, "AGG_FORCE_INCOMPLETE")?.unwrap_or(d.force_incomplete),
            classify_by_message: parse_flag(&get, "AGG_CLASSIFY_BY_MESSAGE")?
                .unwrap_or(d.classify_by_message),
            schedule_interval: parse::<u64>(&get, "AGG_SCHEDULE_INTERVAL_SECONDS")?
                .map(Duration::from_secs)
                .unwrap_or(d.schedule_interval),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // keep = 0 would prune the in-progress run before it is finalized
        let nonzero: [(&'static str, u64); 8] = [
            ("AGG_MAX_TASKS_PER_RUN", self.max_tasks_per_run.into()),
            ("AGG_MAX_WINDOWS_PER_TASK", self.max_windows_per_task.into()),
            ("AGG_RUNNING_STALE_SECONDS", self.running_stale_seconds),
            ("AGG_AUTO_DISABLE_HARD_FAILS", self.auto_disable_hard_fails.into()),
            ("AGG_DERIVATION_VERSION", self.derivation_version.into()),
            ("AGG_RUN_LOG_KEEP", self.run_log_keep as u64),
            ("AGG_TASK_CONCURRENCY", self.task_concurrency as u64),
            ("AGG_SCHEDULE_INTERVAL_SECONDS", self.schedule_interval.as_secs()),
        ];
        if let Some((key, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero { key });
        }
        if self.max_run_budget.is_some_and(|b| b.is_zero()) {
            return Err(ConfigError::Zero {
                key: "AGG_MAX_RUN_BUDGET_MS",
            });
        }
        if self.environment.trim().is_empty() {
            return Err(ConfigError::Empty { key: "AGG_ENV" });
        }
        if self.job_name.trim().is_empty() {
            return Err(ConfigError::Empty { key: "AGG_JOB_NAME" });
        }
        Ok(())
    }

    /// Staleness threshold for soft locks.
    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.running_stale_seconds).unwrap_or(i64::MAX))
    }

    /// Runs longer than this are flagged as lease pressure (80% of the stale threshold).
    pub fn lease_warning_after(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(
            i64::try_from(self.running_stale_seconds.saturating_mul(800)).unwrap_or(i64::MAX),
        )
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get(key)
        .map(|value| {
            value.parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                reason: e.to_string(),
                value,
            })
        })
        .transpose()
}

fn parse_flag(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<bool>, ConfigError> {
    get(key)
        .map(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key,
                value,
                reason: "expected a boolean".to_string(),
            }),
        })
        .transpose()
}

fn parse_timestamp(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<DateTime<Utc>>, ConfigError> {
    get(key)
        .map(|value| {
            DateTime::parse_from_rfc3339(&value)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| ConfigError::Invalid {
                    key,
                    reason: e.to_string(),
                    value,
                })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_tasks_per_run, 20);
        assert_eq!(config.max_windows_per_task, 100);
        assert_eq!(config.running_stale_seconds, 900);
        assert_eq!(config.auto_disable_hard_fails, 3);
        assert_eq!(config.derivation_version, 1);
    }

    #[test]
    fn reads_every_variable() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("AGG_MAX_TASKS_PER_RUN", "5"),
            ("AGG_MAX_WINDOWS_PER_TASK", " 12 "),
            ("AGG_RUNNING_STALE_SECONDS", "60"),
            ("AGG_AUTO_DISABLE_HARD_FAILS", "2"),
            ("AGG_DERIVATION_VERSION", "4"),
            ("AGG_ENV", "staging"),
            ("AGG_JOB_NAME", "rollup"),
            ("AGG_RUN_LOG_KEEP", "7"),
            ("AGG_TASK_CONCURRENCY", "3"),
            ("AGG_MAX_RUN_BUDGET_MS", "45000"),
            ("AGG_UNIFIED_START", "2026-01-01T00:00:00Z"),
            ("AGG_FORCE_INCOMPLETE", "true"),
            ("AGG_CLASSIFY_BY_MESSAGE", "1"),
            ("AGG_SCHEDULE_INTERVAL_SECONDS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.max_tasks_per_run, 5);
        assert_eq!(config.max_windows_per_task, 12);
        assert_eq!(config.stale_after(), chrono::Duration::seconds(60));
        assert_eq!(config.lease_warning_after(), chrono::Duration::seconds(48));
        assert_eq!(config.environment, "staging");
        assert_eq!(config.task_concurrency, 3);
        assert_eq!(config.max_run_budget, Some(Duration::from_secs(45)));
        assert_eq!(
            config.unified_start,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
        );
        assert!(config.force_incomplete);
        assert!(config.classify_by_message);
        assert_eq!(config.schedule_interval, Duration::from_secs(60));
    }

    #[test]
    fn rejects_malformed_values() {
        let err = EngineConfig::from_lookup(lookup(&[("AGG_MAX_TASKS_PER_RUN", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "AGG_MAX_TASKS_PER_RUN", .. }));

        let err = EngineConfig::from_lookup(lookup(&[("AGG_UNIFIED_START", "2026-01-01")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "AGG_UNIFIED_START", .. }));

        let err = EngineConfig::from_lookup(lookup(&[("AGG_FORCE_INCOMPLETE", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "AGG_FORCE_INCOMPLETE", .. }));
    }

    #[test]
    fn rejects_zero_limits() {
        let err = EngineConfig::from_lookup(lookup(&[("AGG_TASK_CONCURRENCY", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero { key: "AGG_TASK_CONCURRENCY" });

        let err = EngineConfig::from_lookup(lookup(&[("AGG_MAX_WINDOWS_PER_TASK", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero { key: "AGG_MAX_WINDOWS_PER_TASK" });
    }

    #[test]
    fn run_log_must_keep_at_least_the_current_run() {
        let err = EngineConfig::from_lookup(lookup(&[("AGG_RUN_LOG_KEEP", "0")])).unwrap_err();
        assert_eq!(err, ConfigError::Zero { key: "AGG_RUN_LOG_KEEP" });

        let config = EngineConfig {
            run_log_keep: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero { key: "AGG_RUN_LOG_KEEP" }));
        assert!(
            EngineConfig {
                run_log_keep: 1,
                ..EngineConfig::default()
            }
            .validate()
            .is_ok()
        );
    }
}
