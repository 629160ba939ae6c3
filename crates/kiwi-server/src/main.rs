// SPDX-License-Identifier: MIT OR Apache-2.0
//! kiwi-mcp server binary.

use anyhow::{Context, Result};
use clap::Parser;
use kiwi_ops::Operations;
use kiwi_server::Server;
use kiwi_store::ContentStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Agent-execution kernel exposed as an MCP server over stdio.
#[derive(Debug, Parser)]
#[command(name = "kiwi-mcp", version, about)]
struct Cli {
    /// Override the user content root (default: $USER_PATH, else ~/.ai).
    #[arg(long)]
    user_path: Option<PathBuf>,

    /// Project directory whose .ai/ layer is preloaded at startup.
    #[arg(long, default_value = ".")]
    project: PathBuf,

    /// Write structured logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Accept tampered local items with a warning instead of failing.
    #[arg(long)]
    lenient_signatures: bool,
}

fn init_tracing(log_file: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the protocol; logs go to a file or stderr only.
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

/// Load `.env` files most-specific first; dotenvy never overrides variables
/// that are already set, so the project-local file wins over the user one.
fn load_env_files(project: &PathBuf) {
    let mut candidates = vec![
        project.join(".env.local"),
        project.join(".env"),
        project.join(".ai").join(".env"),
    ];
    if let Ok(home) = std::env::var("HOME") {
        candidates.push(PathBuf::from(home).join(".ai").join(".env"));
    }
    for path in candidates {
        if path.is_file() {
            let _ = dotenvy::from_path(&path);
        }
    }
}

fn build_store(cli: &Cli) -> ContentStore {
    let store = match &cli.user_path {
        Some(path) => ContentStore::new(path.clone()),
        None => ContentStore::from_env(),
    };
    if cli.lenient_signatures {
        store.with_verify_mode(kiwi_store::VerifyMode::Warn)
    } else {
        store
    }
}

fn main() {
    let cli = Cli::parse();
    load_env_files(&cli.project);

    if let Err(e) = init_tracing(cli.log_file.as_ref()) {
        eprintln!("kiwi-mcp: {e:#}");
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("kiwi-mcp: failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let exit = runtime.block_on(async {
        let store = Arc::new(build_store(&cli));
        if !store.user_root().exists() {
            if let Err(e) = std::fs::create_dir_all(store.user_root()) {
                eprintln!(
                    "kiwi-mcp: user content root {} is unusable: {e}",
                    store.user_root().display()
                );
                return 1;
            }
        }

        let ops = Arc::new(Operations::new(store));
        let preloaded = ops.preload_runtimes(&cli.project);
        info!(
            target: "kiwi.server",
            session = %ops.session().id,
            preloaded,
            project = %cli.project.display(),
            "kernel ready"
        );

        let server = Arc::new(Server::new(ops));
        server
            .serve(tokio::io::stdin(), tokio::io::stdout())
            .await
    });

    std::process::exit(exit);
}
