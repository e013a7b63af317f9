//! Config file loading and command-line overrides

use crate::Overrides;
use anyhow::{anyhow, Context, Result};
use rangefetch_types::Configuration;
use std::path::{Path, PathBuf};
use tracing::debug;

/// `<config_dir>/rangefetch/config.json`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rangefetch").join("config.json"))
}

/// Read the config file (if any) and apply overrides on top
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Configuration> {
    let mut config = read_file(path)?;
    overrides.apply(&mut config)?;
    debug!("Effective configuration: {:?}", config);
    config
        .normalized()
        .validate()
        .map_err(|msg| anyhow!("invalid configuration: {}", msg))?;
    Ok(config)
}

/// Config file contents, or the defaults when it doesn't exist
pub fn read_file(path: Option<&Path>) -> Result<Configuration> {
    let Some(path) = path else {
        debug!("No config directory, using defaults");
        return Ok(Configuration::default());
    };
    if !path.exists() {
        debug!("No config file at {}, using defaults", path.display());
        return Ok(Configuration::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

/// Write the default configuration; refuses to clobber unless `force`
pub fn write_defaults(path: &Path, force: bool) -> Result<Configuration> {
    if path.exists() && !force {
        return Err(anyhow!(
            "{} already exists (use --force to overwrite)",
            path.display()
        ));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let config = Configuration::default();
    std::fs::write(path, serde_json::to_string_pretty(&config)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(config)
}

impl Overrides {
    fn apply(&self, config: &mut Configuration) -> Result<()> {
        if let Some(threads) = self.threads {
            config.thread_count = threads;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = usize::try_from(buffer_size)
                .map_err(|_| anyhow!("buffer size {} is too large", buffer_size))?;
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        if let Some(secs) = self.timeout {
            config.timeout_ms = secs.saturating_mul(1000);
        }
        if let Some(limit) = self.limit {
            config.speed_limit = limit;
        }
        if self.no_resume {
            config.enable_resume_support = false;
        }
        if self.no_preallocate {
            config.pre_allocate_file = false;
        }
        if self.adaptive {
            config.adaptive = true;
        }
        Ok(())
    }
}

/// Parse a byte count with an optional K/M/G suffix (binary units)
pub fn parse_size(raw: &str) -> Result<u64, String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let digits = lower
        .trim_end_matches("ib")
        .trim_end_matches('b');
    let (number, multiplier) = match digits.chars().last() {
        Some('k') => (&digits[..digits.len() - 1], 1024),
        Some('m') => (&digits[..digits.len() - 1], 1024 * 1024),
        Some('g') => (&digits[..digits.len() - 1], 1024 * 1024 * 1024),
        _ => (digits, 1),
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid size '{}'", trimmed))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size '{}' is too large", trimmed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1024"), Ok(1024));
        assert_eq!(parse_size("512K"), Ok(512 * 1024));
        assert_eq!(parse_size("4M"), Ok(4 * 1024 * 1024));
        assert_eq!(parse_size("4MiB"), Ok(4 * 1024 * 1024));
        assert_eq!(parse_size("1g"), Ok(1024 * 1024 * 1024));
        assert!(parse_size("fast").is_err());
        assert!(parse_size("").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = read_file(Some(&dir.path().join("nope.json"))).unwrap();
        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "thread_count": 12 }"#).unwrap();

        let config = read_file(Some(&path)).unwrap();
        assert_eq!(config.thread_count, 12);
        assert_eq!(config.chunk_size, Configuration::default().chunk_size);
    }

    #[test]
    fn test_overrides_win_over_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "thread_count": 12, "speed_limit": 100000 }"#).unwrap();

        let overrides = Overrides {
            threads: Some(2),
            timeout: Some(10),
            no_resume: true,
            ..Default::default()
        };
        let config = load(Some(&path), &overrides).unwrap();
        assert_eq!(config.thread_count, 2);
        assert_eq!(config.speed_limit, 100000);
        assert_eq!(config.timeout_ms, 10_000);
        assert!(!config.enable_resume_support);
    }

    #[test]
    fn test_invalid_override_rejected() {
        let overrides = Overrides {
            chunk_size: Some(1024),
            ..Default::default()
        };
        let err = load(None, &overrides).unwrap_err();
        assert!(err.to_string().contains("chunk_size"));
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        write_defaults(&path, false).unwrap();
        assert!(write_defaults(&path, false).is_err());
        assert!(write_defaults(&path, true).is_ok());
        assert_eq!(read_file(Some(&path)).unwrap(), Configuration::default());
    }
}
