mod settings;
mod watchdog;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use drift_files::{FileService, TransferSession, TransferStatus};
use drift_net::sim::SimNetwork;
use drift_net::{CodeRegistry, ConnectionKind, Substrate};
use drift_protocol::PeerId;
use settings::Settings;
use tracing_subscriber::EnvFilter;

/// How often expired short codes are swept.
const CODE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "drift", version, about = "Peer-to-peer file transfer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a file between two in-process peers and save the received copy
    Transfer {
        /// File to send
        file: PathBuf,
        /// Directory the received copy is written to
        #[arg(long)]
        out: PathBuf,
        /// Use a relayed link instead of a direct one
        #[arg(long)]
        relayed: bool,
        /// Hold received payloads in memory instead of the spool directory
        #[arg(long)]
        memory_only: bool,
    },
    /// Print the effective settings
    Settings {
        /// Write them to the config file
        #[arg(long)]
        write: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::load();

    match cli.command {
        Command::Transfer {
            file,
            out,
            relayed,
            memory_only,
        } => transfer(&settings, &file, &out, relayed, memory_only).await,
        Command::Settings { write } => show_settings(&settings, write),
    }
}

async fn transfer(
    settings: &Settings,
    file: &Path,
    out: &Path,
    relayed: bool,
    memory_only: bool,
) -> Result<()> {
    if !file.is_file() {
        bail!("not a file: {}", file.display());
    }
    std::fs::create_dir_all(out)
        .with_context(|| format!("failed to create output directory: {}", out.display()))?;

    let net = SimNetwork::new();
    let kind = if relayed {
        ConnectionKind::Relayed
    } else {
        ConnectionKind::Direct
    };
    let sending_node = net.create_node("sender");
    let receiving_node = net.create_node("receiver");
    net.link(&sending_node, &receiving_node, kind);

    let receiver = Arc::new(
        FileService::start(
            Arc::new(receiving_node),
            settings.service_config(memory_only),
        )
        .await
        .context("failed to start receiving peer")?,
    );
    let sender = FileService::start(Arc::new(sending_node), settings.service_config(true))
        .await
        .context("failed to start sending peer")?;
    let _watchdog = watchdog::spawn(&receiver, settings.watchdog_interval());

    let codes = Arc::new(CodeRegistry::with_ttl(settings.code_ttl()));
    let _sweeper = codes.spawn_sweeper(CODE_SWEEP_INTERVAL);
    let code = codes
        .register(&receiver.net().local_id().to_hex())
        .context("failed to register receiver address")?;
    println!("receiver code: {code}");

    let address = codes
        .lookup(&code)
        .context("code expired before it was used")?;
    let peer = PeerId::from_hex(&address).context("registered address is not a peer id")?;

    let mut changes = receiver.registry().subscribe();
    let sent = sender
        .send_file(peer, file)
        .await
        .context("failed to send file")?;
    tracing::info!(session = %sent, "send finished");

    let wait = async {
        loop {
            if let Some(session) = receiver
                .sessions()
                .into_iter()
                .find(|s| s.status.is_terminal())
            {
                return Ok::<TransferSession, anyhow::Error>(session);
            }
            changes
                .changed()
                .await
                .context("receiver stopped before the file arrived")?;
        }
    };
    let session = tokio::time::timeout(settings.timeouts().stream_open, wait)
        .await
        .context("timed out waiting for the receiver")??;

    if session.status == TransferStatus::Error {
        bail!(
            "receive failed: {}",
            session.error.as_deref().unwrap_or("unknown error")
        );
    }

    let received = receiver
        .inbox()
        .get(session.id)
        .context("received file missing from inbox")?;
    // The name comes from the peer; keep only its final component.
    let name = Path::new(&received.filename)
        .file_name()
        .context("received file has no usable name")?;
    let dest = out.join(name);
    let written = received
        .blob
        .export(&dest)
        .await
        .with_context(|| format!("failed to write {}", dest.display()))?;

    println!(
        "received {} ({} bytes, {} spool, {} link) -> {}",
        received.filename,
        written,
        if received.blob.is_persistent() {
            "disk"
        } else {
            "memory"
        },
        if relayed { "relayed" } else { "direct" },
        dest.display()
    );

    sender.shutdown();
    receiver.shutdown();
    Ok(())
}

fn show_settings(settings: &Settings, write: bool) -> Result<()> {
    let rendered = toml::to_string_pretty(settings).context("failed to serialize settings")?;
    println!("# {}", Settings::config_path().display());
    print!("{rendered}");

    if write {
        let path = settings.save()?;
        println!("# written to {}", path.display());
    }
    Ok(())
}
