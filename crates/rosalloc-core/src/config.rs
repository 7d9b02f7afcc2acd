//! Allocator configuration.
//!
//! Every field has a default; the embedder may override them in code or via
//! environment variables:
//! - `ROSALLOC_PAGE_SIZE`: page size in bytes (power of two, at least 2048).
//! - `ROSALLOC_PAGE_RELEASE_MODE`: `none`, `end`, `size`, `size_and_end`, `all`.
//! - `ROSALLOC_PAGE_RELEASE_THRESHOLD`: bytes; used by `size` and `size_and_end`.
//! - `ROSALLOC_LOG_LEVEL`: minimum lifecycle log level.
//!
//! Malformed numeric values are reported as [`AllocError::InvalidConfig`];
//! unknown mode and level names fall back to their defaults.

use crate::error::AllocError;
use crate::log::AllocatorLogLevel;
use crate::release::PageReleaseMode;
use crate::size_class::LARGE_SIZE_THRESHOLD;
use serde::Serialize;

pub const ENV_PAGE_SIZE: &str = "ROSALLOC_PAGE_SIZE";
pub const ENV_PAGE_RELEASE_MODE: &str = "ROSALLOC_PAGE_RELEASE_MODE";
pub const ENV_PAGE_RELEASE_THRESHOLD: &str = "ROSALLOC_PAGE_RELEASE_THRESHOLD";
pub const ENV_LOG_LEVEL: &str = "ROSALLOC_LOG_LEVEL";

pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const DEFAULT_PAGE_RELEASE_THRESHOLD: usize = 4 << 20;
pub const DEFAULT_LOG_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosAllocConfig {
    pub page_size: usize,
    pub page_release_mode: PageReleaseMode,
    pub page_release_threshold: usize,
    pub log_level: AllocatorLogLevel,
    /// Lifecycle records retained; zero disables the log.
    pub log_capacity: usize,
}

impl Default for RosAllocConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            page_release_mode: PageReleaseMode::default(),
            page_release_threshold: DEFAULT_PAGE_RELEASE_THRESHOLD,
            log_level: AllocatorLogLevel::Info,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl RosAllocConfig {
    /// Reads overrides from the process environment.
    pub fn from_env() -> Result<Self, AllocError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads overrides through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AllocError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_PAGE_SIZE) {
            config.page_size = parse_bytes(ENV_PAGE_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PAGE_RELEASE_MODE) {
            config.page_release_mode = PageReleaseMode::from_str_loose(&raw);
        }
        if let Some(raw) = lookup(ENV_PAGE_RELEASE_THRESHOLD) {
            config.page_release_threshold = parse_bytes(ENV_PAGE_RELEASE_THRESHOLD, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOG_LEVEL) {
            config.log_level = AllocatorLogLevel::from_str_loose(&raw);
        }
        config.validate()?;
        Ok(config)
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_release_mode(mut self, mode: PageReleaseMode) -> Self {
        self.page_release_mode = mode;
        self
    }

    #[must_use]
    pub fn with_release_threshold(mut self, bytes: usize) -> Self {
        self.page_release_threshold = bytes;
        self
    }

    #[must_use]
    pub fn with_log(mut self, level: AllocatorLogLevel, capacity: usize) -> Self {
        self.log_level = level;
        self.log_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), AllocError> {
        if !self.page_size.is_power_of_two() || self.page_size < LARGE_SIZE_THRESHOLD {
            return Err(AllocError::InvalidConfig(format!(
                "page size {} must be a power of two >= {LARGE_SIZE_THRESHOLD}",
                self.page_size
            )));
        }
        Ok(())
    }
}

/// Accepts plain integers and `k`/`m`/`g` suffixes (binary units).
fn parse_bytes(key: &str, raw: &str) -> Result<usize, AllocError> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, shift) = match s.as_bytes().last() {
        Some(b'k') => (&s[..s.len() - 1], 10),
        Some(b'm') => (&s[..s.len() - 1], 20),
        Some(b'g') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    digits
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_mul(1usize << shift))
        .ok_or_else(|| AllocError::InvalidConfig(format!("{key}={raw:?} is not a byte count")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = RosAllocConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RosAllocConfig::default());
        assert_eq!(config.page_release_mode, PageReleaseMode::SizeAndEnd);
        assert_eq!(config.page_release_threshold, 4 << 20);
    }

    #[test]
    fn overrides_from_env() {
        let config = RosAllocConfig::from_lookup(lookup(&[
            (ENV_PAGE_SIZE, "16k"),
            (ENV_PAGE_RELEASE_MODE, "ALL"),
            (ENV_PAGE_RELEASE_THRESHOLD, "1048576"),
            (ENV_LOG_LEVEL, "trace"),
        ]))
        .unwrap();
        assert_eq!(config.page_size, 16384);
        assert_eq!(config.page_release_mode, PageReleaseMode::All);
        assert_eq!(config.page_release_threshold, 1 << 20);
        assert_eq!(config.log_level, AllocatorLogLevel::Trace);
    }

    #[test]
    fn rejects_malformed_values() {
        let err = RosAllocConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, "lots")])).unwrap_err();
        assert!(matches!(err, AllocError::InvalidConfig(_)));
        let err = RosAllocConfig::from_lookup(lookup(&[(ENV_PAGE_SIZE, "6000")])).unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn byte_suffixes() {
        assert_eq!(parse_bytes("k", "4MB").unwrap(), 4 << 20);
        assert_eq!(parse_bytes("k", "2g").unwrap(), 2 << 30);
        assert_eq!(parse_bytes("k", " 512 ").unwrap(), 512);
        assert!(parse_bytes("k", "m").is_err());
    }
}
