//! Kernel configuration structures.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::KernelError;

fn default_max_concurrent() -> usize {
    4
}

fn default_idle_wait_ms() -> u64 {
    50
}

fn default_min_retry_ms() -> u64 {
    1_000
}

fn default_max_retry_ms() -> u64 {
    30_000
}

fn default_tick_ms() -> u64 {
    100
}

fn default_max_concurrent_jobs() -> usize {
    num_cpus::get().max(1)
}

fn default_thread_stack_size() -> usize {
    2 * 1024 * 1024
}

/// Resource fetch manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchManagerConfig {
    /// Maximum fetches outstanding at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Upper bound on how long the idle driver waits before rechecking.
    #[serde(default = "default_idle_wait_ms")]
    pub idle_wait_ms: u64,
}

impl Default for FetchManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            idle_wait_ms: default_idle_wait_ms(),
        }
    }
}

impl FetchManagerConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency bound.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Set the idle wait in milliseconds.
    #[must_use]
    pub const fn with_idle_wait_ms(mut self, idle_wait_ms: u64) -> Self {
        self.idle_wait_ms = idle_wait_ms;
        self
    }

    /// Idle wait as a `Duration`.
    #[must_use]
    pub const fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Validate fetch manager settings.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be greater than 0".into());
        }
        if self.idle_wait_ms == 0 {
            return Err("idle_wait_ms must be greater than 0".into());
        }
        Ok(())
    }
}

/// Retry timing for persistent fetchers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First retry delay in milliseconds.
    #[serde(default = "default_min_retry_ms")]
    pub min_retry_ms: u64,
    /// Ceiling for the retry delay in milliseconds.
    #[serde(default = "default_max_retry_ms")]
    pub max_retry_ms: u64,
    /// Polling tick of the underlying continuous task.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_retry_ms: default_min_retry_ms(),
            max_retry_ms: default_max_retry_ms(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl RetryConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backoff bounds in milliseconds.
    #[must_use]
    pub const fn with_bounds_ms(mut self, min_retry_ms: u64, max_retry_ms: u64) -> Self {
        self.min_retry_ms = min_retry_ms;
        self.max_retry_ms = max_retry_ms;
        self
    }

    /// Set the polling tick in milliseconds.
    #[must_use]
    pub const fn with_tick_ms(mut self, tick_ms: u64) -> Self {
        self.tick_ms = tick_ms;
        self
    }

    /// First retry delay.
    #[must_use]
    pub const fn min_retry(&self) -> Duration {
        Duration::from_millis(self.min_retry_ms)
    }

    /// Retry delay ceiling.
    #[must_use]
    pub const fn max_retry(&self) -> Duration {
        Duration::from_millis(self.max_retry_ms)
    }

    /// Polling tick.
    #[must_use]
    pub const fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Validate retry settings.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_retry_ms == 0 {
            return Err("min_retry_ms must be greater than 0".into());
        }
        if self.max_retry_ms < self.min_retry_ms {
            return Err("max_retry_ms must not be less than min_retry_ms".into());
        }
        if self.tick_ms == 0 {
            return Err("tick_ms must be greater than 0".into());
        }
        Ok(())
    }
}

/// Execution policy of one named job queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobQueuePolicy {
    /// Worker threads draining the queue; jobs beyond this wait their turn.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Stack size for each worker thread.
    #[serde(default = "default_thread_stack_size")]
    pub thread_stack_size: usize,
}

impl Default for JobQueuePolicy {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            thread_stack_size: default_thread_stack_size(),
        }
    }
}

impl JobQueuePolicy {
    /// A policy running at most `max_concurrent_jobs` jobs at once.
    #[must_use]
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            max_concurrent_jobs,
            ..Self::default()
        }
    }

    /// A policy executing one job at a time.
    #[must_use]
    pub fn serial() -> Self {
        Self::new(1)
    }

    /// Set the worker thread stack size.
    #[must_use]
    pub const fn with_thread_stack_size(mut self, size: usize) -> Self {
        self.thread_stack_size = size;
        self
    }

    /// Validate policy values.
    ///
    /// # Errors
    ///
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_jobs == 0 {
            return Err("max_concurrent_jobs must be greater than 0".into());
        }
        if self.thread_stack_size < 64 * 1024 {
            return Err("thread_stack_size must be at least 64 KiB".into());
        }
        Ok(())
    }
}

/// Root kernel configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Fetch manager settings.
    #[serde(default)]
    pub fetch: FetchManagerConfig,
    /// Persistent fetch retry settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Named job queues and their policies.
    #[serde(default)]
    pub queues: HashMap<String, JobQueuePolicy>,
}

impl KernelConfig {
    /// Validate every section.
    ///
    /// # Errors
    ///
    /// Returns a description naming the offending section.
    pub fn validate(&self) -> Result<(), String> {
        self.fetch.validate().map_err(|e| format!("fetch invalid: {e}"))?;
        self.retry.validate().map_err(|e| format!("retry invalid: {e}"))?;
        for (name, policy) in &self.queues {
            if name.is_empty() {
                return Err("queue names must not be empty".into());
            }
            policy
                .validate()
                .map_err(|e| format!("queue `{name}` invalid: {e}"))?;
        }
        Ok(())
    }

    /// Parse kernel configuration from a JSON string and validate.
    ///
    /// # Errors
    ///
    /// Returns a parse or validation message.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Build configuration from defaults overridden by environment variables.
    ///
    /// A `.env` file is loaded first when present. Recognised variables are
    /// `KERNEL_FETCH_MAX_CONCURRENT`, `KERNEL_FETCH_IDLE_WAIT_MS`,
    /// `KERNEL_RETRY_MIN_MS`, `KERNEL_RETRY_MAX_MS` and `KERNEL_RETRY_TICK_MS`.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidConfig`] when a variable does not parse
    /// or the result fails validation.
    pub fn from_env() -> Result<Self, KernelError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from defaults overridden through `lookup`.
    ///
    /// # Errors
    ///
    /// Same as [`KernelConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, KernelError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        if let Some(value) = parse_var(&lookup, "KERNEL_FETCH_MAX_CONCURRENT")? {
            cfg.fetch.max_concurrent = value;
        }
        if let Some(value) = parse_var(&lookup, "KERNEL_FETCH_IDLE_WAIT_MS")? {
            cfg.fetch.idle_wait_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "KERNEL_RETRY_MIN_MS")? {
            cfg.retry.min_retry_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "KERNEL_RETRY_MAX_MS")? {
            cfg.retry.max_retry_ms = value;
        }
        if let Some(value) = parse_var(&lookup, "KERNEL_RETRY_TICK_MS")? {
            cfg.retry.tick_ms = value;
        }
        cfg.validate().map_err(KernelError::InvalidConfig)?;
        Ok(cfg)
    }
}

fn parse_var<F, V>(lookup: &F, key: &str) -> Result<Option<V>, KernelError>
where
    F: Fn(&str) -> Option<String>,
    V: std::str::FromStr,
    V::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<V>()
                .map_err(|e| KernelError::InvalidConfig(format!("{key}: {e}")))
        })
        .transpose()
}
