use std::io::{self, IsTerminal};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use mirror_core::{
    ExtractionAdapter, HtmlAdapter, HttpTransport, JsonApiAdapter, Mirror, RunStatus, Transport,
};
use tracing::{debug, error, info, warn};

use crate::ProcessExit;
use crate::app::{config_manager, exit_handler, progress_manager, terminal};
use crate::cli::{AdapterKind, Cli, Command};

pub(crate) async fn run_mirror(cli: Cli) -> Result<ProcessExit> {
    let default_level = terminal::default_log_level(&cli.global);
    terminal::init_tracing(&default_level, cli.global.log_file.as_deref())?;
    debug!(?cli, "CLI arguments parsed");

    let resolved = config_manager::resolve_config(&cli)?;
    if let Some(path) = &resolved.config_path {
        debug!(path = %path.display(), "config file location");
    }
    info!(
        user_id = cli.command.user_id(),
        site = %resolved.site,
        service = %resolved.service,
        output_dir = %resolved.output_dir.display(),
        "creator-mirror starting"
    );

    let config = Arc::new(resolved.mirror);
    let transport: Arc<dyn Transport> =
        Arc::new(HttpTransport::new(&config).context("Failed to build HTTP client")?);
    let adapter: Arc<dyn ExtractionAdapter> = match resolved.adapter {
        AdapterKind::Html => Arc::new(HtmlAdapter::new(resolved.site, resolved.service)),
        AdapterKind::Api => Arc::new(JsonApiAdapter::new(resolved.site, resolved.service)),
    };

    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_signal = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing in-flight transfers");
            interrupted_signal.store(true, Ordering::SeqCst);
        }
    });

    let mirror = Mirror::new(config, transport, adapter).with_interrupt_flag(interrupted);
    let user_id = cli.command.user_id();
    let target = mirror.target(user_id, &resolved.output_dir)?;

    let use_spinner = terminal::should_use_spinner(
        io::stderr().is_terminal(),
        cli.global.quiet,
        terminal::is_dumb_terminal(),
    );
    let progress = progress_manager::ProgressUi::start(use_spinner, mirror.live_counters());

    let result = match &cli.command {
        Command::Run(_) => mirror.run_for_user(&target).await,
        Command::Resume(_) => mirror.resume(&target).await,
        Command::Posts(args) => mirror.run_for_posts(&target, &args.post_ids).await,
    };

    progress.finish().await;

    let report = result.with_context(|| format!("Mirror of user {user_id} failed"))?;

    if !cli.global.quiet {
        println!("{}", report.summary);
    }
    if report.recovered_from_corruption {
        warn!("ledger snapshot was unreadable; existing files were re-verified");
    }

    match &report.status {
        RunStatus::Success => info!("Mirror complete"),
        RunStatus::PartialFailure => warn!(
            resume_offset = report.resume_offset,
            "Mirror finished with failures. Run `creator-mirror resume {user_id}` to retry."
        ),
        RunStatus::Interrupted => warn!(
            resume_offset = report.resume_offset,
            "Interrupted. Run `creator-mirror resume {user_id}` to continue."
        ),
        RunStatus::Aborted { reason } => error!(%reason, "Mirror aborted"),
    }

    Ok(exit_handler::determine_exit_outcome(&report.status))
}
