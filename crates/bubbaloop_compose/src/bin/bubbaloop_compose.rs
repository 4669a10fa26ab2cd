//! Bubbaloop Compose CLI
//!
//! Usage:
//!   bubbaloop_compose
//!   bubbaloop_compose -f deploy/compose.yaml web
//!   bubbaloop_compose --startup-timeout 2m --dependency-policy wait
//!   bubbaloop_compose --dry-run

use bubbaloop_compose::{
    ComposeArgs, ComposeFile, LaunchPlan, ServiceGraph, ServiceSupervisor, SupervisorConfig,
    SupervisorError,
};
use std::path::PathBuf;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: ComposeArgs = argh::from_env();

    // Initialize logging
    let env = env_logger::Env::default().default_filter_or(args.log_filter());
    env_logger::init_from_env(env);

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether every service ended well
async fn run(args: ComposeArgs) -> Result<bool, SupervisorError> {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    // Locate compose file
    let file = match &args.file {
        Some(file) => file.clone(),
        None => ComposeFile::locate(args.project_dir.as_deref().unwrap_or(cwd.as_path()))?,
    };
    let project_dir = match &args.project_dir {
        Some(dir) => dir.clone(),
        None => file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(PathBuf::from)
            .unwrap_or(cwd),
    };

    log::info!("Loading compose file: {}", file.display());
    let compose = ComposeFile::from_file(&file)?;

    // Configuration faults are reported before anything starts
    let graph = ServiceGraph::build(&compose, &project_dir, &args.services)?;

    // Validate only mode
    if args.validate {
        println!("Compose file '{}' is valid", file.display());
        if let Some(name) = &compose.name {
            println!("  Project: {}", name);
        }
        println!("  Services: {}", graph.len());
        println!("  Networks: {}", compose.networks.len());
        println!("  Volumes: {}", compose.volumes.len());
        return Ok(true);
    }

    // Dry run mode
    if args.dry_run {
        println!("{}", LaunchPlan::new(&graph, compose.name.clone()));
        return Ok(true);
    }

    let config = SupervisorConfig {
        project_dir,
        startup_timeout: args.startup_timeout,
        dependency_policy: args.dependency_policy,
        ..Default::default()
    };
    match config.startup_timeout {
        Some(timeout) => log::info!("Startup timeout: {:?}", timeout),
        None => log::info!("No startup timeout, dependents wait until released"),
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    {
        let shutdown_tx = shutdown_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(());
        }) {
            log::warn!("Could not set Ctrl+C handler: {}", e);
        }
    }

    let handle = ServiceSupervisor::new(config).start(graph);

    // Wait for shutdown signal or every service to settle
    handle.wait(shutdown_rx).await;

    let report = handle.status();
    handle.shutdown().await;

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => println!("{}", json),
            Err(e) => log::error!("Failed to serialize status report: {}", e),
        }
    } else {
        println!();
        print!("{}", report);
    }

    drop(shutdown_tx);
    log::info!("Bubbaloop compose exiting");
    Ok(!handle.any_failed())
}
