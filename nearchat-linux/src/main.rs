// Nearchat for Linux: LAN discovery, authenticated chat sessions, terminal client.

mod config;
mod console;
mod discovery;
mod host;
mod session;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nearchat_core::{ControllerConfig, DeviceAddress, PeerConnectionController, StudentId};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::console::Console;
use crate::discovery::{LanDiscovery, LanSettings};
use crate::host::{Host, HostSettings};

#[derive(Debug, Parser)]
#[command(
    name = "nearchat-linux",
    version,
    about = "Authenticated peer-to-peer chat on the local network"
)]
struct Cli {
    /// Nine-digit student id.
    #[arg(long)]
    id: Option<String>,
    /// Config file instead of the default locations.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Chat TCP port.
    #[arg(long)]
    port: Option<u16>,
    /// Discovery UDP port.
    #[arg(long)]
    discovery_port: Option<u16>,
    /// Encrypt message text with the session keys.
    #[arg(long)]
    encrypt: bool,
    /// Skip the challenge-response exchange.
    #[arg(long)]
    no_handshake: bool,
    /// Log as JSON.
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let mut cfg = config::load(cli.config.as_deref());
    if let Some(id) = cli.id {
        cfg.student_id = Some(id);
    }
    if let Some(p) = cli.port {
        cfg.transport_port = p;
    }
    if let Some(p) = cli.discovery_port {
        cfg.discovery_port = p;
    }
    cfg.encrypt_messages |= cli.encrypt;
    cfg.require_handshake &= !cli.no_handshake;

    let student_id = cfg
        .student_id
        .as_deref()
        .map(StudentId::parse)
        .transpose()
        .context("invalid student id")?;

    let mut controller = PeerConnectionController::new(ControllerConfig {
        transport_port: cfg.transport_port,
        require_handshake: cfg.require_handshake,
        announce_identifier: cfg.announce_identifier,
        expected_peer_identifier: cfg.expected_peer_id.clone(),
    });
    if let Some(id) = &student_id {
        controller.set_identifier(id.as_str())?;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let listener = TcpListener::bind(("0.0.0.0", cfg.transport_port))
            .await
            .with_context(|| format!("bind chat port {}", cfg.transport_port))?;

        let local = DeviceAddress::generate();
        let name = cfg
            .device_name
            .clone()
            .or_else(|| student_id.as_ref().map(|id| id.to_string()))
            .unwrap_or_else(|| "nearchat".to_string());
        let (discovery_tx, discovery_rx) = tokio::sync::mpsc::unbounded_channel();
        let discovery = LanDiscovery::start(
            LanSettings {
                local,
                name,
                discovery_port: cfg.discovery_port,
                transport_port: cfg.transport_port,
                link_timeout: Duration::from_secs(cfg.link_timeout_secs),
            },
            discovery_tx,
        )
        .await
        .with_context(|| format!("join discovery group on port {}", cfg.discovery_port))?;

        let settings = HostSettings {
            connect_timeout: Duration::from_secs(cfg.link_timeout_secs),
            handshake_timeout: Duration::from_secs(cfg.handshake_timeout_secs),
            encrypt_messages: cfg.encrypt_messages,
            student_id: student_id.as_ref().map(|id| id.to_string()),
        };
        let host = Host::new(
            controller,
            Arc::new(discovery),
            Arc::new(Console),
            settings,
            listener,
        );

        let (command_tx, command_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(console::read_commands(command_tx));
        println!("{}", console::HELP);
        info!(address = %local, port = cfg.transport_port, "nearchat ready");

        host.run(discovery_rx, command_rx, async {
            if let Err(e) = shutdown_signal().await {
                tracing::warn!(error = %e, "signal handler failed");
                std::future::pending::<()>().await;
            }
        })
        .await;
        Ok::<_, anyhow::Error>(())
    })?;
    // stdin reader may still be blocked.
    rt.shutdown_timeout(Duration::from_millis(100));
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
