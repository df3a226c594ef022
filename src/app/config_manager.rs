//! Configuration lifecycle: load file config, merge CLI flags, build the run
//! configuration.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use mirror_core::MirrorConfig;
use url::Url;

use crate::app_config::{FileConfig, load_file_config};
use crate::cli::{AdapterKind, Cli, MirrorArgs};

pub(crate) const DEFAULT_SITE: &str = "https://kemono.cr";
pub(crate) const DEFAULT_SERVICE: &str = "patreon";

/// Everything the runtime needs to build a [`mirror_core::Mirror`].
#[derive(Debug)]
pub(crate) struct ResolvedConfig {
    pub(crate) mirror: MirrorConfig,
    pub(crate) output_dir: PathBuf,
    pub(crate) site: Url,
    pub(crate) service: String,
    pub(crate) adapter: AdapterKind,
    pub(crate) config_path: Option<PathBuf>,
}

/// Loads the config file and merges the command's flags over it.
pub(crate) fn resolve_config(cli: &Cli) -> Result<ResolvedConfig> {
    let loaded = load_file_config(cli.global.config.as_deref())?;
    let file = loaded.config.unwrap_or_default();
    let mut resolved = merge(cli.command.options(), &file)?;
    resolved.config_path = loaded.path;
    Ok(resolved)
}

/// CLI flag, else file value, else built-in default.
pub(crate) fn merge(args: &MirrorArgs, file: &FileConfig) -> Result<ResolvedConfig> {
    let defaults = MirrorConfig::default();

    let max_concurrent_downloads = args
        .concurrency
        .or(file.concurrency)
        .map_or(defaults.max_concurrent_downloads, usize::from);
    let max_in_flight_requests = args
        .max_in_flight
        .or(file.max_in_flight)
        .map_or(max_concurrent_downloads, usize::from);
    let retry_delay = args
        .retry_delay_ms
        .or(file.retry_delay_ms)
        .map_or(defaults.retry_delay, Duration::from_millis);
    let max_retry_delay = file
        .max_retry_delay_ms
        .map_or(defaults.max_retry_delay.max(retry_delay), Duration::from_millis);

    let post_filter = if args.post_filter.is_empty() {
        None
    } else {
        Some(args.post_filter.iter().cloned().collect::<BTreeSet<_>>())
    };

    let mirror = MirrorConfig {
        max_concurrent_downloads,
        max_in_flight_requests,
        request_delay: args
            .delay_ms
            .or(file.request_delay_ms)
            .map_or(defaults.request_delay, Duration::from_millis),
        max_retries: args
            .max_retries
            .or(file.max_retries)
            .map_or(defaults.max_retries, u32::from),
        retry_delay,
        max_retry_delay,
        retry_jitter: file
            .retry_jitter_ms
            .map_or(defaults.retry_jitter, Duration::from_millis),
        timeout: args
            .timeout_secs
            .or(file.timeout_secs)
            .map_or(defaults.timeout, Duration::from_secs),
        skip_existing: !args.no_skip_existing
            && file.skip_existing.unwrap_or(defaults.skip_existing),
        verify_ssl: !args.insecure && file.verify_ssl.unwrap_or(defaults.verify_ssl),
        user_agent: args
            .user_agent
            .clone()
            .or_else(|| file.user_agent.clone())
            .unwrap_or(defaults.user_agent),
        post_filter,
        asset_type_filter: args
            .assets
            .or(file.asset_types)
            .unwrap_or(defaults.asset_type_filter),
        max_repeat_pages: file.max_repeat_pages.unwrap_or(defaults.max_repeat_pages),
        page_size: args.page_size.or(file.page_size).or(defaults.page_size),
        max_posts: args.max_posts,
        batch_size: file.batch_size.unwrap_or(defaults.batch_size),
        batch_pause: file
            .batch_pause_ms
            .map_or(defaults.batch_pause, Duration::from_millis),
        retry_failed: args.retry_failed,
        ledger_snapshot_every: file
            .ledger_snapshot_every
            .unwrap_or(defaults.ledger_snapshot_every),
        shutdown_grace: file
            .shutdown_grace_ms
            .map_or(defaults.shutdown_grace, Duration::from_millis),
    };
    mirror.validate().context("Invalid configuration")?;

    let site_raw = args
        .site
        .as_deref()
        .or(file.site.as_deref())
        .unwrap_or(DEFAULT_SITE);
    let site = Url::parse(site_raw).with_context(|| format!("Invalid site URL '{site_raw}'"))?;

    Ok(ResolvedConfig {
        mirror,
        output_dir: args
            .output_dir
            .clone()
            .or_else(|| file.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from(".")),
        site,
        service: args
            .service
            .clone()
            .or_else(|| file.service.clone())
            .unwrap_or_else(|| DEFAULT_SERVICE.to_string()),
        adapter: args.adapter.or(file.adapter).unwrap_or(AdapterKind::Html),
        config_path: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::AssetTypeFilter;

    #[test]
    fn test_merge_defaults_match_library_defaults() {
        let resolved = merge(&MirrorArgs::default(), &FileConfig::default()).unwrap();
        assert_eq!(resolved.mirror, MirrorConfig::default());
        assert_eq!(resolved.output_dir, PathBuf::from("."));
        assert_eq!(resolved.site.as_str(), "https://kemono.cr/");
        assert_eq!(resolved.service, "patreon");
        assert_eq!(resolved.adapter, AdapterKind::Html);
    }

    #[test]
    fn test_merge_cli_overrides_file_overrides_default() {
        let file = FileConfig {
            concurrency: Some(8),
            max_retries: Some(5),
            asset_types: Some(AssetTypeFilter::All),
            output_dir: Some(PathBuf::from("/srv/file")),
            ..FileConfig::default()
        };
        let args = MirrorArgs {
            concurrency: Some(4),
            output_dir: Some(PathBuf::from("/srv/cli")),
            ..MirrorArgs::default()
        };

        let resolved = merge(&args, &file).unwrap();
        assert_eq!(resolved.mirror.max_concurrent_downloads, 4);
        assert_eq!(resolved.mirror.max_in_flight_requests, 4);
        assert_eq!(resolved.mirror.max_retries, 5);
        assert_eq!(resolved.mirror.asset_type_filter, AssetTypeFilter::All);
        assert_eq!(resolved.output_dir, PathBuf::from("/srv/cli"));
    }

    #[test]
    fn test_merge_negative_flags_win_over_file() {
        let file = FileConfig {
            skip_existing: Some(true),
            verify_ssl: Some(true),
            ..FileConfig::default()
        };
        let args = MirrorArgs {
            no_skip_existing: true,
            insecure: true,
            ..MirrorArgs::default()
        };
        let resolved = merge(&args, &file).unwrap();
        assert!(!resolved.mirror.skip_existing);
        assert!(!resolved.mirror.verify_ssl);
    }

    #[test]
    fn test_merge_large_retry_delay_raises_cap() {
        let args = MirrorArgs {
            retry_delay_ms: Some(120_000),
            ..MirrorArgs::default()
        };
        let resolved = merge(&args, &FileConfig::default()).unwrap();
        assert_eq!(resolved.mirror.retry_delay, Duration::from_secs(120));
        assert_eq!(resolved.mirror.max_retry_delay, Duration::from_secs(120));
    }

    #[test]
    fn test_merge_post_filter_collects_ids() {
        let args = MirrorArgs {
            post_filter: vec!["9".into(), "3".into(), "9".into()],
            ..MirrorArgs::default()
        };
        let resolved = merge(&args, &FileConfig::default()).unwrap();
        assert_eq!(resolved.mirror.post_filter.as_ref().unwrap().len(), 2);
        assert!(resolved.mirror.accepts_post("3"));
        assert!(!resolved.mirror.accepts_post("4"));
    }

    #[test]
    fn test_merge_rejects_bad_site() {
        let args = MirrorArgs {
            site: Some("not a url".into()),
            ..MirrorArgs::default()
        };
        assert!(merge(&args, &FileConfig::default()).is_err());
    }
}
