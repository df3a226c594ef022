//! Application configuration loading for CLI defaults.
//!
//! The file is a flat list of `key = value` lines (a TOML subset): strings
//! are double-quoted, numbers and booleans are bare, `#` starts a comment.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use mirror_core::AssetTypeFilter;

use crate::cli::AdapterKind;

/// File-backed defaults. Every field is optional; CLI flags win.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileConfig {
    /// Default output root.
    pub output_dir: Option<PathBuf>,
    /// Site root URL.
    pub site: Option<String>,
    /// Service segment.
    pub service: Option<String>,
    /// Page reader.
    pub adapter: Option<AdapterKind>,
    /// Concurrent downloads (1..=100).
    pub concurrency: Option<u8>,
    /// Outstanding request ceiling (1..=100).
    pub max_in_flight: Option<u8>,
    /// Request spacing in milliseconds (0..=60000).
    pub request_delay_ms: Option<u64>,
    /// Retries per transient failure (0..=10).
    pub max_retries: Option<u8>,
    /// Base backoff in milliseconds.
    pub retry_delay_ms: Option<u64>,
    /// Backoff cap in milliseconds.
    pub max_retry_delay_ms: Option<u64>,
    /// Additive jitter bound in milliseconds.
    pub retry_jitter_ms: Option<u64>,
    /// Request timeout in seconds (1..=3600).
    pub timeout_secs: Option<u64>,
    /// Skip files already complete.
    pub skip_existing: Option<bool>,
    /// Verify TLS certificates.
    pub verify_ssl: Option<bool>,
    /// User-Agent header.
    pub user_agent: Option<String>,
    /// Asset type filter.
    pub asset_types: Option<AssetTypeFilter>,
    /// Offset step per catalog page.
    pub page_size: Option<u64>,
    /// Consecutive pages without new posts before the walk stops.
    pub max_repeat_pages: Option<u32>,
    /// Requests per batch before `batch_pause_ms`.
    pub batch_size: Option<usize>,
    /// Pause after each batch in milliseconds.
    pub batch_pause_ms: Option<u64>,
    /// Ledger updates between snapshots.
    pub ledger_snapshot_every: Option<usize>,
    /// Grace period for in-flight transfers on shutdown, in milliseconds.
    pub shutdown_grace_ms: Option<u64>,
}

impl FileConfig {
    /// Validates config values against runtime and CLI constraints.
    pub fn validate(&self) -> Result<()> {
        validate_range("concurrency", self.concurrency.map(u64::from), 1, 100)?;
        validate_range("max_in_flight", self.max_in_flight.map(u64::from), 1, 100)?;
        validate_range("request_delay_ms", self.request_delay_ms, 0, 60_000)?;
        validate_range("max_retries", self.max_retries.map(u64::from), 0, 10)?;
        validate_range("timeout_secs", self.timeout_secs, 1, 3600)?;
        validate_range("page_size", self.page_size, 1, u64::MAX)?;
        validate_range(
            "max_repeat_pages",
            self.max_repeat_pages.map(u64::from),
            1,
            1000,
        )?;
        validate_range(
            "ledger_snapshot_every",
            self.ledger_snapshot_every.map(|v| v as u64),
            1,
            u64::MAX,
        )?;
        if let Some(site) = &self.site
            && url::Url::parse(site).is_err()
        {
            bail!("Invalid config value for `site`: '{site}' is not an absolute URL");
        }
        Ok(())
    }
}

fn validate_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Loaded config metadata.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// Resolved config path if a base directory is known.
    pub path: Option<PathBuf>,
    /// Parsed file config when a config file exists and was valid.
    pub config: Option<FileConfig>,
}

/// Resolves default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/creator-mirror/config.toml`
/// 2. `$HOME/.config/creator-mirror/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config_home)
                .join("creator-mirror")
                .join("config.toml"),
        );
    }

    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("creator-mirror")
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads config from `explicit` (which must exist) or from the default path
/// if present.
pub fn load_file_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    if let Some(path) = explicit {
        let config = read_file_config(path)?;
        return Ok(LoadedConfig {
            path: Some(path.to_path_buf()),
            config: Some(config),
        });
    }

    let path = resolve_default_config_path();
    let config = match path.as_deref() {
        Some(path_ref) if path_ref.exists() => Some(read_file_config(path_ref)?),
        _ => None,
    };
    Ok(LoadedConfig { path, config })
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_index + 1;

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_no}: expected key = value");
        };

        let key = raw_key.trim();
        let value = raw_value.trim();
        let invalid = || format!("Invalid `{key}` value on line {line_no}");

        match key {
            "output_dir" => {
                cfg.output_dir = Some(PathBuf::from(
                    parse_string_literal(value).with_context(invalid)?,
                ));
            }
            "site" => cfg.site = Some(parse_string_literal(value).with_context(invalid)?),
            "service" => cfg.service = Some(parse_string_literal(value).with_context(invalid)?),
            "adapter" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.adapter = Some(match parsed.as_str() {
                    "html" => AdapterKind::Html,
                    "api" => AdapterKind::Api,
                    other => bail!("Invalid `adapter` value '{other}' on line {line_no}: expected html or api"),
                });
            }
            "concurrency" => cfg.concurrency = Some(parse_integer(value).with_context(invalid)?),
            "max_in_flight" => {
                cfg.max_in_flight = Some(parse_integer(value).with_context(invalid)?);
            }
            "request_delay_ms" => {
                cfg.request_delay_ms = Some(parse_integer(value).with_context(invalid)?);
            }
            "max_retries" => cfg.max_retries = Some(parse_integer(value).with_context(invalid)?),
            "retry_delay_ms" => {
                cfg.retry_delay_ms = Some(parse_integer(value).with_context(invalid)?);
            }
            "max_retry_delay_ms" => {
                cfg.max_retry_delay_ms = Some(parse_integer(value).with_context(invalid)?);
            }
            "retry_jitter_ms" => {
                cfg.retry_jitter_ms = Some(parse_integer(value).with_context(invalid)?);
            }
            "timeout_secs" => cfg.timeout_secs = Some(parse_integer(value).with_context(invalid)?),
            "skip_existing" => cfg.skip_existing = Some(parse_boolean(value).with_context(invalid)?),
            "verify_ssl" => cfg.verify_ssl = Some(parse_boolean(value).with_context(invalid)?),
            "user_agent" => {
                cfg.user_agent = Some(parse_string_literal(value).with_context(invalid)?);
            }
            "asset_types" => {
                let parsed = parse_string_literal(value).with_context(invalid)?;
                cfg.asset_types = Some(parsed.parse::<AssetTypeFilter>().with_context(invalid)?);
            }
            "page_size" => cfg.page_size = Some(parse_integer(value).with_context(invalid)?),
            "max_repeat_pages" => {
                cfg.max_repeat_pages = Some(parse_integer(value).with_context(invalid)?);
            }
            "batch_size" => cfg.batch_size = Some(parse_integer(value).with_context(invalid)?),
            "batch_pause_ms" => {
                cfg.batch_pause_ms = Some(parse_integer(value).with_context(invalid)?);
            }
            "ledger_snapshot_every" => {
                cfg.ledger_snapshot_every = Some(parse_integer(value).with_context(invalid)?);
            }
            "shutdown_grace_ms" => {
                cfg.shutdown_grace_ms = Some(parse_integer(value).with_context(invalid)?);
            }
            unknown => {
                bail!("Unknown configuration key: '{unknown}' on line {line_no}");
            }
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer<T: TryFrom<u64>>(raw_value: &str) -> Result<T> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    let value = u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range"))?;
    T::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected 'true' or 'false'"),
    }
}
