//! CloakDrop CLI
//!
//! Send a cloaked file to a username, receive drops addressed to you, or run
//! the rendezvous server both sides meet on.

mod config;
mod progress;

use anyhow::Context;
use clap::{Parser, Subcommand};
use console::style;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

use cloakdrop_core::{
    DropConfig, DropError, DropEventKind, DropOrchestrator, DropReceiver, EventBus,
};
use cloakdrop_rendezvous::{DropRequest, RemoteStore, RendezvousServer, RendezvousStore};
use cloakdrop_swarm::SwarmTransportManager;

use config::Config;
use progress::{TransferProgress, format_bytes, format_duration};

/// CloakDrop - disguised peer-to-peer file drops
#[derive(Parser)]
#[command(name = "cloakdrop")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (default: ~/.config/cloakdrop/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rendezvous server address, overriding the configuration
    #[arg(short, long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file to a user
    Send {
        /// File to send
        #[arg(required = true)]
        file: PathBuf,

        /// Receiving username
        #[arg(long)]
        to: String,

        /// Your username
        #[arg(long)]
        from: String,

        /// Transfer policy: direct, swarm or both
        #[arg(long)]
        policy: Option<String>,
    },

    /// Receive drops addressed to you
    Receive {
        /// Your username
        #[arg(long = "as")]
        username: String,

        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        /// Accept every drop without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Run a rendezvous server
    Rendezvous {
        /// Bind address
        #[arg(short, long, default_value = "0.0.0.0:7420")]
        bind: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    if let Some(server) = &cli.server {
        config.rendezvous.server.clone_from(server);
    }

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .init();

    match cli.command {
        Commands::Send {
            file,
            to,
            from,
            policy,
        } => {
            if let Some(policy) = policy {
                config.transfer.policy = policy;
            }
            config.validate()?;
            send_file(&file, &to, &from, &config).await?;
        }
        Commands::Receive {
            username,
            output,
            yes,
        } => {
            config.validate()?;
            receive_drops(&username, &output, yes, &config).await?;
        }
        Commands::Rendezvous { bind } => {
            let bind: SocketAddr = bind
                .parse()
                .with_context(|| format!("invalid bind address {bind:?}"))?;
            run_rendezvous(bind).await?;
        }
    }

    Ok(())
}

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn RendezvousStore>> {
    let addr = config.server_addr()?;
    let store = RemoteStore::connect_with_timeout(
        addr,
        Duration::from_secs(config.rendezvous.request_timeout_secs),
    )
    .await
    .with_context(|| format!("connecting to rendezvous server {addr}"))?;
    Ok(Arc::new(store))
}

async fn start_swarm(drop_config: &DropConfig) -> anyhow::Result<Option<Arc<SwarmTransportManager>>> {
    if !drop_config.policy.offers_swarm() {
        return Ok(None);
    }
    let manager = SwarmTransportManager::start(
        drop_config.swarm.session_config(),
        drop_config.swarm.manager_config(),
    )
    .await
    .context("starting swarm session")?;
    tracing::info!("Swarm session listening on {}", manager.session().listen_addr());
    Ok(Some(Arc::new(manager)))
}

/// Send a file to a user
async fn send_file(file: &Path, to: &str, from: &str, config: &Config) -> anyhow::Result<()> {
    if !file.is_file() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let file_size = std::fs::metadata(file)?.len();
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown")
        .to_string();

    let drop_config = config.to_drop_config()?;
    println!("File: {}", file.display());
    println!("Size: {}", format_bytes(file_size));
    println!("Recipient: {to}");
    println!("Transport: {}", drop_config.policy);

    let store = connect_store(config).await?;
    let swarm = start_swarm(&drop_config).await?;
    let events = EventBus::default();
    let mut updates = events.subscribe();
    let mut orchestrator = DropOrchestrator::new(drop_config, store, events);
    if let Some(swarm) = &swarm {
        orchestrator = orchestrator.with_swarm(swarm.clone());
    }

    let started = Instant::now();
    let handle = orchestrator
        .initiate_send(file, to, from, &filename)
        .await
        .context("starting drop")?;
    let id = handle.id().clone();
    println!("Drop {} published, waiting for {to}", style(id.short()).bold());

    let progress = TransferProgress::new(0, &filename);
    let outcome = handle.wait();
    tokio::pin!(outcome);
    let result = loop {
        tokio::select! {
            result = &mut outcome => break result,
            update = updates.recv() => {
                if let Ok(event) = update {
                    progress.apply(&event);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                orchestrator.cancel(&id);
            }
        }
    };

    if let Some(swarm) = swarm {
        swarm.stop_session().await;
    }

    match result {
        Ok(()) => {
            progress.finish_with_message(format!(
                "{} delivered in {}",
                style("✓").green(),
                format_duration(started.elapsed())
            ));
            Ok(())
        }
        Err(DropError::PeerDeclined) => {
            progress.abandon_with_message(format!("{} {to} declined the drop", style("✗").yellow()));
            Ok(())
        }
        Err(e) => {
            progress.abandon_with_message(format!("{} {}", style("✗").red(), e.label()));
            Err(e).context("drop failed")
        }
    }
}

/// Receive drops addressed to `username`
async fn receive_drops(
    username: &str,
    output: &Path,
    auto_accept: bool,
    config: &Config,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(output)
        .with_context(|| format!("creating {}", output.display()))?;

    let drop_config = config.to_drop_config()?;
    let store = connect_store(config).await?;
    let swarm = start_swarm(&drop_config).await?;
    let events = EventBus::default();
    let mut receiver = DropReceiver::new(drop_config.clone(), store, events.clone(), username);
    if let Some(swarm) = &swarm {
        receiver = receiver.with_swarm(swarm.clone());
    }

    let mut inbox = receiver.inbox().await.context("watching inbox")?;
    println!("Waiting for drops to {} in {}", style(username).bold(), output.display());
    println!("Press Ctrl+C to stop");

    let mut seen = HashSet::new();
    loop {
        let request = tokio::select! {
            request = inbox.next() => match request {
                Some(request) => request,
                None => anyhow::bail!("rendezvous server closed the inbox"),
            },
            _ = tokio::signal::ctrl_c() => break,
        };
        if !seen.insert(request.id.clone()) {
            continue;
        }

        println!();
        println!(
            "{} wants to send you {} ({})",
            style(&request.sender_username).bold(),
            request.original_filename,
            format_bytes(request.cloaked_file_size)
        );
        if !auto_accept && !confirm("Accept?").await? {
            decline_one(&receiver, &request).await;
            continue;
        }

        receive_one(&receiver, &events, &request, output).await;
    }

    println!("\nShutting down...");
    if let Some(swarm) = swarm {
        swarm.stop_session().await;
    }
    Ok(())
}

/// Decline `request`, reporting failures without leaving the inbox loop.
async fn decline_one(receiver: &DropReceiver, request: &DropRequest) -> bool {
    match receiver.decline(request).await {
        Ok(()) => {
            println!("Declined");
            true
        }
        Err(e) => {
            tracing::warn!("Could not decline drop {}: {}", request.id.short(), e);
            println!("{} Could not decline: {}", style("✗").red(), e.label());
            false
        }
    }
}

async fn receive_one(receiver: &DropReceiver, events: &EventBus, request: &DropRequest, output: &Path) {
    let progress = TransferProgress::new(request.cloaked_file_size, &request.original_filename);
    let mut updates = events.subscribe();
    let accepting = receiver.accept(request, output);
    tokio::pin!(accepting);

    let result = loop {
        tokio::select! {
            result = &mut accepting => break result,
            update = updates.recv() => {
                if let Ok(event) = update {
                    if event.drop_request_id.as_ref() == Some(&request.id)
                        && event.kind != DropEventKind::Complete
                    {
                        progress.apply(&event);
                    }
                }
            }
        }
    };

    match result {
        Ok(path) => progress.finish_with_message(format!(
            "{} saved {}",
            style("✓").green(),
            path.display()
        )),
        Err(e) => progress.abandon_with_message(format!("{} {}", style("✗").red(), e)),
    }
}

async fn confirm(question: &str) -> anyhow::Result<bool> {
    let question = question.to_string();
    let answer = tokio::task::spawn_blocking(move || {
        let term = console::Term::stdout();
        term.write_str(&format!("{question} [y/N] "))?;
        term.read_line()
    })
    .await??;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

/// Run a rendezvous server until Ctrl+C
async fn run_rendezvous(bind: SocketAddr) -> anyhow::Result<()> {
    let server = RendezvousServer::bind(bind)
        .await
        .with_context(|| format!("binding rendezvous server on {bind}"))?;
    let handle = server.spawn()?;

    println!("CloakDrop rendezvous server");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Listen: {}", handle.local_addr());
    println!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    tracing::info!("{} drop requests left in store", handle.store().len());
    handle.shutdown().await;
    Ok(())
}
