// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::str::FromStr;
use std::time::Duration;

use uuid::Uuid;

/// How the heartbeat schedules its resolution passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatMode {
    /// Every tick runs orphans, timers, triggers and switches.
    #[default]
    Parallel,
    /// Each tick runs the next pass in round-robin order.
    Sequential,
}

impl FromStr for HeartbeatMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            _ => Err(ConfigError::Invalid(
                "LANEWISE_HEARTBEAT_MODE",
                "must be 'parallel' or 'sequential'",
            )),
        }
    }
}

/// Engine tuning shared by embedded and standalone deployments.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Identity stamped on every ProcessState this engine writes.
    pub engine_id: String,
    /// Heartbeat tick.
    pub heartbeat_interval: Duration,
    /// Heartbeat scheduling mode.
    pub heartbeat_mode: HeartbeatMode,
    /// Maximum orphan processes claimed per pass.
    pub orphan_batch_size: i64,
    /// Maximum due timers claimed per pass.
    pub timer_batch_size: i64,
    /// Maximum pending triggers claimed per pass.
    pub trigger_batch_size: i64,
    /// Maximum open switches claimed per pass.
    pub switch_batch_size: i64,
    /// Minimum age of a foreign `running` step before it counts as orphaned.
    pub orphan_grace: Duration,
    /// Whether the standalone binary starts the heartbeat.
    pub heartbeat_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: Uuid::new_v4().to_string(),
            heartbeat_interval: Duration::from_millis(1000),
            heartbeat_mode: HeartbeatMode::Parallel,
            orphan_batch_size: 10,
            timer_batch_size: 10,
            trigger_batch_size: 10,
            switch_batch_size: 10,
            orphan_grace: Duration::from_millis(3000),
            heartbeat_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `LANEWISE_ENGINE_ID`: engine identity (default: random UUID)
    /// - `LANEWISE_HEARTBEAT_INTERVAL_MS`: heartbeat tick (default: 1000)
    /// - `LANEWISE_HEARTBEAT_MODE`: `parallel` or `sequential` (default: parallel)
    /// - `LANEWISE_ORPHAN_BATCH_SIZE`, `LANEWISE_TIMER_BATCH_SIZE`,
    ///   `LANEWISE_TRIGGER_BATCH_SIZE`, `LANEWISE_SWITCH_BATCH_SIZE` (default: 10)
    /// - `LANEWISE_ORPHAN_GRACE_MS`: orphan lease (default: 3000)
    /// - `LANEWISE_HEARTBEAT_ENABLED`: "true"/"1" or "false"/"0" (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let engine_id = std::env::var("LANEWISE_ENGINE_ID")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.engine_id);

        let heartbeat_interval = Duration::from_millis(parse_var(
            "LANEWISE_HEARTBEAT_INTERVAL_MS",
            1000u64,
            "must be a positive integer",
        )?);
        if heartbeat_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "LANEWISE_HEARTBEAT_INTERVAL_MS",
                "must be a positive integer",
            ));
        }

        let heartbeat_mode = match std::env::var("LANEWISE_HEARTBEAT_MODE") {
            Ok(v) => v.parse()?,
            Err(_) => defaults.heartbeat_mode,
        };

        let orphan_batch_size = parse_batch("LANEWISE_ORPHAN_BATCH_SIZE")?;
        let timer_batch_size = parse_batch("LANEWISE_TIMER_BATCH_SIZE")?;
        let trigger_batch_size = parse_batch("LANEWISE_TRIGGER_BATCH_SIZE")?;
        let switch_batch_size = parse_batch("LANEWISE_SWITCH_BATCH_SIZE")?;

        let orphan_grace = Duration::from_millis(parse_var(
            "LANEWISE_ORPHAN_GRACE_MS",
            3000u64,
            "must be a non-negative integer",
        )?);

        let heartbeat_enabled = std::env::var("LANEWISE_HEARTBEAT_ENABLED")
            .map(|v| !(v == "false" || v == "0"))
            .unwrap_or(true);

        Ok(Self {
            engine_id,
            heartbeat_interval,
            heartbeat_mode,
            orphan_batch_size,
            timer_batch_size,
            trigger_batch_size,
            switch_batch_size,
            orphan_grace,
            heartbeat_enabled,
        })
    }
}

/// Standalone binary configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Maximum pool connections
    pub max_connections: u32,
    /// Engine tuning
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `LANEWISE_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional:
    /// - `LANEWISE_MAX_CONNECTIONS`: pool size (default: 10)
    /// - everything read by [`EngineConfig::from_env`]
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("LANEWISE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("LANEWISE_DATABASE_URL"))?;

        let max_connections = parse_var(
            "LANEWISE_MAX_CONNECTIONS",
            10u32,
            "must be a positive integer",
        )?;

        Ok(Self {
            database_url,
            max_connections,
            engine: EngineConfig::from_env()?,
        })
    }
}

fn parse_var<T: FromStr>(
    key: &'static str,
    default: T,
    message: &'static str,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::Invalid(key, message)),
        Err(_) => Ok(default),
    }
}

fn parse_batch(key: &'static str) -> Result<i64, ConfigError> {
    let value: i64 = parse_var(key, 10, "must be a positive integer")?;
    if value <= 0 {
        return Err(ConfigError::Invalid(key, "must be a positive integer"));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: &[&str] = &[
        "LANEWISE_DATABASE_URL",
        "LANEWISE_MAX_CONNECTIONS",
        "LANEWISE_ENGINE_ID",
        "LANEWISE_HEARTBEAT_INTERVAL_MS",
        "LANEWISE_HEARTBEAT_MODE",
        "LANEWISE_ORPHAN_BATCH_SIZE",
        "LANEWISE_TIMER_BATCH_SIZE",
        "LANEWISE_TRIGGER_BATCH_SIZE",
        "LANEWISE_SWITCH_BATCH_SIZE",
        "LANEWISE_ORPHAN_GRACE_MS",
        "LANEWISE_HEARTBEAT_ENABLED",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for key in ALL_VARS {
                guard.remove(key);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_engine_config_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_mode, HeartbeatMode::Parallel);
        assert_eq!(config.orphan_batch_size, 10);
        assert_eq!(config.timer_batch_size, 10);
        assert_eq!(config.trigger_batch_size, 10);
        assert_eq!(config.switch_batch_size, 10);
        assert_eq!(config.orphan_grace, Duration::from_secs(3));
        assert!(config.heartbeat_enabled);
        assert!(Uuid::parse_str(&config.engine_id).is_ok());
    }

    #[test]
    fn test_engine_ids_differ_per_startup() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let a = EngineConfig::from_env().unwrap();
        let b = EngineConfig::from_env().unwrap();
        assert_ne!(a.engine_id, b.engine_id);
    }

    #[test]
    fn test_engine_config_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LANEWISE_ENGINE_ID", "engine-a");
        guard.set("LANEWISE_HEARTBEAT_INTERVAL_MS", "250");
        guard.set("LANEWISE_HEARTBEAT_MODE", "Sequential");
        guard.set("LANEWISE_ORPHAN_BATCH_SIZE", "5");
        guard.set("LANEWISE_TIMER_BATCH_SIZE", "50");
        guard.set("LANEWISE_TRIGGER_BATCH_SIZE", "7");
        guard.set("LANEWISE_SWITCH_BATCH_SIZE", "2");
        guard.set("LANEWISE_ORPHAN_GRACE_MS", "0");
        guard.set("LANEWISE_HEARTBEAT_ENABLED", "false");

        let config = EngineConfig::from_env().unwrap();

        assert_eq!(config.engine_id, "engine-a");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(config.heartbeat_mode, HeartbeatMode::Sequential);
        assert_eq!(config.orphan_batch_size, 5);
        assert_eq!(config.timer_batch_size, 50);
        assert_eq!(config.trigger_batch_size, 7);
        assert_eq!(config.switch_batch_size, 2);
        assert_eq!(config.orphan_grace, Duration::ZERO);
        assert!(!config.heartbeat_enabled);
    }

    #[test]
    fn test_invalid_heartbeat_mode() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LANEWISE_HEARTBEAT_MODE", "sometimes");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("LANEWISE_HEARTBEAT_MODE", _)));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LANEWISE_HEARTBEAT_INTERVAL_MS", "0");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("LANEWISE_HEARTBEAT_INTERVAL_MS", _)
        ));
    }

    #[test]
    fn test_negative_batch_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LANEWISE_TIMER_BATCH_SIZE", "-1");

        let err = EngineConfig::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("LANEWISE_TIMER_BATCH_SIZE", _)
        ));
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("LANEWISE_DATABASE_URL")));
        assert!(err.to_string().contains("LANEWISE_DATABASE_URL"));
    }

    #[test]
    fn test_config_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("LANEWISE_DATABASE_URL", "postgres://localhost/lanewise");
        guard.set("LANEWISE_MAX_CONNECTIONS", "20");

        let config = Config::from_env().unwrap();
        assert_eq!(config.database_url, "postgres://localhost/lanewise");
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.engine.heartbeat_mode, HeartbeatMode::Parallel);
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
