// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Runtime configuration for the shared memory manager.

use std::env;
use std::path::PathBuf;

/// Default cap for the sleep between file lock polls, in milliseconds.
pub const DEFAULT_POLL_MAX_SLEEP_MS: u32 = 100;

/// How a named mutex is locked across processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockStrategy {
    /// Process-shared robust pthread mutex stored in the shared file.
    Robust,
    /// `flock(2)` on a companion lock file plus owner bookkeeping.
    FileLock,
}

impl LockStrategy {
    /// Whether robust, process-shared pthread mutexes are usable here.
    pub const fn robust_supported() -> bool {
        cfg!(any(
            target_os = "linux",
            target_os = "android",
            target_os = "freebsd"
        ))
    }

    /// Capability probe: the robust mutex where available, file locks elsewhere.
    pub fn detect() -> Self {
        if Self::robust_supported() {
            LockStrategy::Robust
        } else {
            LockStrategy::FileLock
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "robust" | "pthread" => Some(LockStrategy::Robust),
            "file" | "filelock" | "flock" => Some(LockStrategy::FileLock),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Parent of the `.namedmutex` runtime directories.
    pub runtime_temp_dir: PathBuf,
    /// Upper bound for a single sleep while polling a file lock.
    pub poll_max_sleep_ms: u32,
    /// Forced strategy; `None` lets the capability probe decide.
    pub lock_strategy: Option<LockStrategy>,
    /// Collect failed syscalls and append them to I/O errors.
    pub trace_system_calls: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_temp_dir: env::temp_dir(),
            poll_max_sleep_ms: DEFAULT_POLL_MAX_SLEEP_MS,
            lock_strategy: None,
            trace_system_calls: false,
        }
    }
}

impl Config {
    /// Defaults overridden by `NAMED_MUTEX_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dir) = env::var_os("NAMED_MUTEX_TEMP_DIR") {
            if !dir.is_empty() {
                config.runtime_temp_dir = PathBuf::from(dir);
            }
        }

        if let Ok(value) = env::var("NAMED_MUTEX_POLL_MAX_SLEEP_MS") {
            match value.trim().parse::<u32>() {
                Ok(ms) if ms > 0 => config.poll_max_sleep_ms = ms,
                _ => tracing::warn!(value = %value, "Ignoring invalid NAMED_MUTEX_POLL_MAX_SLEEP_MS"),
            }
        }

        if let Ok(value) = env::var("NAMED_MUTEX_LOCK_STRATEGY") {
            match LockStrategy::parse(&value) {
                Some(strategy) => config.lock_strategy = Some(strategy),
                None => tracing::warn!(value = %value, "Ignoring invalid NAMED_MUTEX_LOCK_STRATEGY"),
            }
        }

        config.trace_system_calls = env::var("NAMED_MUTEX_TRACE_SYSCALLS")
            .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
            .unwrap_or(false);

        config
    }

    pub fn with_runtime_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_temp_dir = dir.into();
        self
    }

    pub fn with_poll_max_sleep_ms(mut self, ms: u32) -> Self {
        self.poll_max_sleep_ms = ms.max(1);
        self
    }

    pub fn with_lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.lock_strategy = Some(strategy);
        self
    }

    pub fn with_trace_system_calls(mut self, enabled: bool) -> Self {
        self.trace_system_calls = enabled;
        self
    }

    /// The strategy a manager built from this config will use.
    ///
    /// A forced `Robust` on a target without robust mutexes falls back to
    /// file locks.
    pub fn resolve_lock_strategy(&self) -> LockStrategy {
        match self.lock_strategy {
            Some(LockStrategy::Robust) if !LockStrategy::robust_supported() => {
                tracing::warn!("Robust mutexes are unavailable on this target; using file locks");
                LockStrategy::FileLock
            }
            Some(strategy) => strategy,
            None => LockStrategy::detect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strategy_names() {
        assert_eq!(LockStrategy::parse("robust"), Some(LockStrategy::Robust));
        assert_eq!(LockStrategy::parse(" FILE "), Some(LockStrategy::FileLock));
        assert_eq!(LockStrategy::parse("flock"), Some(LockStrategy::FileLock));
        assert_eq!(LockStrategy::parse("spin"), None);
    }

    #[test]
    fn forced_file_lock_is_kept() {
        let config = Config::default().with_lock_strategy(LockStrategy::FileLock);
        assert_eq!(config.resolve_lock_strategy(), LockStrategy::FileLock);
    }

    #[test]
    fn detect_matches_target_support() {
        let expected = if LockStrategy::robust_supported() {
            LockStrategy::Robust
        } else {
            LockStrategy::FileLock
        };
        assert_eq!(Config::default().resolve_lock_strategy(), expected);
    }

    const ENV_VARS: [&str; 4] = [
        "NAMED_MUTEX_TEMP_DIR",
        "NAMED_MUTEX_POLL_MAX_SLEEP_MS",
        "NAMED_MUTEX_LOCK_STRATEGY",
        "NAMED_MUTEX_TRACE_SYSCALLS",
    ];

    fn clear_env() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial_test::serial]
    fn from_env_reads_overrides() {
        clear_env();
        env::set_var("NAMED_MUTEX_TEMP_DIR", "/var/tmp/nm");
        env::set_var("NAMED_MUTEX_POLL_MAX_SLEEP_MS", "25");
        env::set_var("NAMED_MUTEX_LOCK_STRATEGY", "file");
        env::set_var("NAMED_MUTEX_TRACE_SYSCALLS", "1");

        let config = Config::from_env();
        clear_env();

        assert_eq!(config.runtime_temp_dir, PathBuf::from("/var/tmp/nm"));
        assert_eq!(config.poll_max_sleep_ms, 25);
        assert_eq!(config.lock_strategy, Some(LockStrategy::FileLock));
        assert!(config.trace_system_calls);
    }

    #[test]
    #[serial_test::serial]
    fn from_env_ignores_garbage() {
        clear_env();
        env::set_var("NAMED_MUTEX_POLL_MAX_SLEEP_MS", "0");
        env::set_var("NAMED_MUTEX_LOCK_STRATEGY", "spin");

        let config = Config::from_env();
        clear_env();

        assert_eq!(config.poll_max_sleep_ms, DEFAULT_POLL_MAX_SLEEP_MS);
        assert_eq!(config.lock_strategy, None);
        assert!(!config.trace_system_calls);
    }

    #[test]
    fn poll_cap_never_zero() {
        assert_eq!(Config::default().with_poll_max_sleep_ms(0).poll_max_sleep_ms, 1);
    }
}
