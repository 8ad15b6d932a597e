//! Taichi node: discovery, membership and file-sync daemon.

mod config;
mod discovery;
mod membership;
mod sync_client;
mod transport;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use taichi_core::{
    format_endpoint, MembershipEngine, NodeConfig, NodeEvent, PeerId, FILE_SERVICE_MARKER,
};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Overrides};
use crate::membership::{Membership, NodeHandle};
use crate::sync_client::SyncClient;
use crate::transport::{run_listener, TcpConnector};

#[derive(Debug, Parser)]
#[command(name = "taichi-node", version, about = "LAN peer discovery and file distribution")]
struct Cli {
    /// Config file (default: ~/.config/taichi/config.toml, /etc/taichi/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    name: Option<String>,
    #[arg(long)]
    beacon_port: Option<u16>,
    #[arg(long)]
    mailbox_port: Option<u16>,
    #[arg(long)]
    inbox: Option<PathBuf>,
    /// Group to join (repeatable)
    #[arg(short, long = "group")]
    groups: Vec<String>,
    /// Group to stand for leader in (repeatable)
    #[arg(long = "contest")]
    contest: Vec<String>,
    /// Advertise our file service to group members
    #[arg(long)]
    publish: bool,
    /// Do not subscribe to advertised file services
    #[arg(long)]
    no_receive: bool,
    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            name: self.name.clone(),
            beacon_port: self.beacon_port,
            mailbox_port: self.mailbox_port,
            inbox: self.inbox.clone(),
            groups: self.groups.clone(),
            contest: self.contest.clone(),
            publish: self.publish,
            no_receive: self.no_receive,
        }
    }
}

fn init_tracing(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let cfg = config::load(cli.config.as_deref(), &cli.overrides())?;

    let id = PeerId::generate();
    let ip = discovery::local_ip();
    let listener = TcpListener::bind(("0.0.0.0", cfg.mailbox_port))
        .await
        .with_context(|| format!("binding mailbox port {}", cfg.mailbox_port))?;
    let endpoint = format_endpoint(SocketAddr::new(ip, cfg.mailbox_port));
    info!(%id, name = %cfg.name, %endpoint, "starting");

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    let (inbound_tx, inbound_rx) = mpsc::channel(1024);
    let (sighting_tx, sighting_rx) = mpsc::channel(64);

    tracker.spawn(run_listener(
        listener,
        inbound_tx,
        tracker.clone(),
        token.clone(),
    ));
    {
        let token = token.clone();
        let (beacon_port, mailbox_port, interval) =
            (cfg.beacon_port, cfg.mailbox_port, cfg.beacon_interval());
        tracker.spawn(async move {
            if let Err(e) =
                discovery::run_discovery(id, beacon_port, mailbox_port, interval, sighting_tx, token)
                    .await
            {
                warn!(error = %e, "discovery stopped");
            }
        });
    }

    let mut node_cfg = NodeConfig::new(cfg.name.clone(), endpoint);
    node_cfg.headers = cfg.headers.clone();
    node_cfg.evasive_timeout = cfg.evasive_timeout();
    node_cfg.expired_timeout = cfg.expired_timeout();
    node_cfg.file_service_port = cfg.file_service_port;
    let connector = TcpConnector::new(id, tracker.clone(), cfg.connect_timeout());
    let engine = MembershipEngine::new(id, node_cfg, connector);
    let (membership, node, events) = Membership::new(engine, inbound_rx, sighting_rx);
    tracker.spawn(membership.run(token.clone()));

    for group in &cfg.contest {
        node.set_contest(group).await?;
    }
    for group in &cfg.groups {
        node.join(group).await?;
    }
    for group in publish_targets(&cfg, None) {
        node.shout(group, FILE_SERVICE_MARKER).await?;
    }

    tracker.spawn(handle_events(cfg, node, events, tracker.clone(), token.clone()));

    shutdown_signal().await?;
    info!("shutting down");
    token.cancel();
    tracker.close();
    tracker.wait().await;
    Ok(())
}

/// Groups to advertise our file service to: every configured group at
/// startup (`joined` is None), or the group a peer just joined if it is one
/// of ours. Empty unless publishing.
fn publish_targets<'a>(cfg: &'a Config, joined: Option<&str>) -> Vec<&'a str> {
    if !cfg.publish {
        return Vec::new();
    }
    cfg.groups
        .iter()
        .map(String::as_str)
        .filter(|g| joined.map_or(true, |j| j == *g))
        .collect()
}

/// React to membership events: advertise our file service to newcomers and
/// subscribe to every service announced to us.
async fn handle_events(
    cfg: Config,
    node: NodeHandle,
    mut events: mpsc::UnboundedReceiver<NodeEvent>,
    tracker: TaskTracker,
    token: CancellationToken,
) {
    let mut receivers: HashMap<PeerId, CancellationToken> = HashMap::new();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => return,
            event = events.recv() => match event {
                Some(e) => e,
                None => return,
            },
        };
        match event {
            NodeEvent::Enter { peer, name, endpoint, .. } => {
                info!(peer = %peer.short(), %name, %endpoint, "peer entered");
            }
            NodeEvent::Exit { peer, name } => {
                info!(peer = %peer.short(), %name, "peer exited");
                if let Some(stop) = receivers.remove(&peer) {
                    stop.cancel();
                }
            }
            NodeEvent::Join { peer, name, group } => {
                info!(peer = %peer.short(), %name, %group, "joined");
                for target in publish_targets(&cfg, Some(&group)) {
                    if let Err(e) = node.shout(target, FILE_SERVICE_MARKER).await {
                        warn!(error = %e, "cannot advertise file service");
                    }
                }
            }
            NodeEvent::Leave { peer, name, group } => {
                info!(peer = %peer.short(), %name, %group, "left");
            }
            NodeEvent::Shout { name, group, content, .. } => {
                info!(%name, %group, message = %String::from_utf8_lossy(&content), "shout");
            }
            NodeEvent::Whisper { name, content, .. } => {
                info!(%name, message = %String::from_utf8_lossy(&content), "whisper");
            }
            NodeEvent::Evasive { peer, name } => {
                debug!(peer = %peer.short(), %name, "peer is evasive");
            }
            NodeEvent::Leader { group, leader } => {
                let ours = leader == node.id();
                info!(%group, leader = %leader.short(), ours, "leader elected");
            }
            NodeEvent::FileService { peer, name, endpoint } => {
                if !cfg.auto_receive || receivers.contains_key(&peer) {
                    continue;
                }
                let stop = token.child_token();
                receivers.insert(peer, stop.clone());
                let inbox = cfg.inbox.join(&name);
                let timeout = cfg.connect_timeout();
                let client_tracker = tracker.clone();
                tracker.spawn(async move {
                    receive_from(name, endpoint, inbox, timeout, client_tracker, stop).await
                });
            }
        }
    }
}

async fn receive_from(
    name: String,
    endpoint: String,
    inbox: PathBuf,
    timeout: std::time::Duration,
    tracker: TaskTracker,
    stop: CancellationToken,
) {
    let mut client = SyncClient::spawn(&tracker, CancellationToken::new());
    let setup = async {
        client.connect(&endpoint, timeout).await?;
        client.set_inbox(inbox.clone()).await?;
        client.subscribe("/").await
    };
    if let Err(e) = setup.await {
        warn!(%name, %endpoint, error = %e, "cannot subscribe to file service");
        client.destroy().await;
        return;
    }
    info!(%name, inbox = %inbox.display(), "receiving files");
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            n = client.recv() => match n {
                Some(n) => info!(%name, ?n, "file sync"),
                None => break,
            },
        }
    }
    for n in client.destroy().await {
        info!(%name, ?n, "file sync");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
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
