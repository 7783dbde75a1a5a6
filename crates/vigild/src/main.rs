use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use vigil_config::{config_path, ensure_workspace_config, validate_config};
use vigil_core::{Language, now_millis};
use vigil_parse::language_for_path;
use vigild::cli::{Cli, Commands, ServeArgs, parse_cli};
use vigild::coordinator::SessionCoordinator;
use vigild::init_tracing;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(cli.log_format);
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    let workspace = cli.workspace.canonicalize().with_context(|| {
        format!(
            "failed to resolve workspace path {}",
            cli.workspace.display()
        )
    })?;

    let config = ensure_workspace_config(&workspace).with_context(|| {
        format!(
            "failed to load or create workspace config at {}",
            config_path(&workspace).display()
        )
    })?;
    for warning in validate_config(&config) {
        tracing::warn!(code = warning.code, "{}", warning.message);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    let coordinator = Arc::new(
        SessionCoordinator::open(&workspace, &config)
            .with_context(|| format!("failed to open session store in {}", workspace.display()))?,
    );

    match cli.command.unwrap_or(Commands::Serve(ServeArgs::default())) {
        Commands::Serve(args) => {
            let bind = args.bind.unwrap_or_else(|| config.server.bind.clone());
            let bind: SocketAddr = bind
                .parse()
                .with_context(|| format!("invalid bind address {bind}"))?;
            let sweep = Duration::from_secs(config.session.sweep_interval_secs);
            runtime.block_on(vigild::server::serve(coordinator, bind, sweep))
        }
        Commands::Validate(args) => runtime.block_on(validate_file(&coordinator, &args.path)),
        Commands::Sessions => print_sessions(&coordinator),
        Commands::Replay(args) => {
            let alerts = runtime.block_on(coordinator.replay_alerts(&args.session, &args.file))?;
            for alert in &alerts {
                println!("{}", serde_json::to_string(alert)?);
            }
            Ok(())
        }
        Commands::Gc => {
            let abandoned = coordinator.collect_garbage(now_millis())?;
            for session_id in &abandoned {
                println!("{session_id}");
            }
            tracing::info!(count = abandoned.len(), "sweep finished");
            Ok(())
        }
    }
}

async fn validate_file(coordinator: &SessionCoordinator, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if language_for_path(path).is_none() {
        tracing::warn!(
            path = %path.display(),
            language = Language::Python.as_str(),
            "unknown extension, assuming default language"
        );
    }

    let issues = coordinator
        .validate_code(&path.to_string_lossy(), &content)
        .await?;

    if issues.is_empty() {
        println!("{}: no issues", path.display());
        return Ok(());
    }
    for issue in &issues {
        println!("{}:{}: {}", path.display(), issue.line, issue.message);
    }
    std::process::exit(1);
}

fn print_sessions(coordinator: &SessionCoordinator) -> Result<()> {
    for session in coordinator.list_sessions()? {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            session.id,
            session.state.as_str(),
            session.snapshot_count,
            session.project_root,
            session.intent
        );
    }
    Ok(())
}
