use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use agentmail_core::paths::MailPaths;
use agentmail_core::project::ProjectState;
use agentmail_core::registry::AgentRegistry;
use agentmail_core::store::MessageStore;
use anyhow::Context as _;
use tokio::sync::watch;

use crate::config_store;
use crate::runtime_store;

mod hub;
mod relay;
mod rpc;
mod server;
mod state;

use hub::Hub;
use relay::RelayManager;
use server::Listener;
use state::SharedState;

#[derive(Clone)]
pub struct DaemonHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl DaemonHandle {
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub async fn run_foreground(paths: &MailPaths) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = DaemonHandle { shutdown_tx };

    let config = config_store::load(paths).await?;

    tokio::fs::create_dir_all(&paths.mail_dir)
        .await
        .with_context(|| format!("create mail dir: {}", paths.mail_dir.display()))?;
    let project = ProjectState::load_or_init(&paths.mail_dir, &config.effective_project_id())
        .context("load project state")?;
    if config.project_id.is_some() && project.id != config.effective_project_id() {
        tracing::warn!(
            configured = %config.effective_project_id(),
            project = %project.id,
            "project.json already names a different project; keeping it"
        );
    }

    let store = MessageStore::open(&paths.mail_dir)
        .with_max_body_bytes(config.store.effective_max_body_bytes());
    let hub = Arc::new(Hub::new(
        project.id.clone(),
        store,
        config.hub.effective_replay_window(),
        config.hub.effective_channel_capacity(),
    ));

    let socket = server::bind_socket(&paths.socket_path).await?;
    let tcp = match config
        .server
        .tcp_listen
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(addr) => Some(server::bind_tcp(addr).await?),
        None => None,
    };

    let shared = Arc::new(SharedState {
        pid: std::process::id(),
        started_at: SystemTime::now(),
        started_at_instant: Instant::now(),
        shutdown: handle.clone(),
        next_conn_id: AtomicU64::new(1),
        next_event_id: AtomicU64::new(1),
        paths: paths.clone(),
        project,
        hub: hub.clone(),
        registry: AgentRegistry::new(&paths.mail_dir),
        agent_stale_after: config.effective_agent_stale(),
    });

    tokio::spawn(server::shutdown_signal_watcher(handle.clone()));

    let peers = config.relay.endpoints().context("parse relay peers")?;
    let relay_tasks = if peers.is_empty() {
        Vec::new()
    } else {
        let cursors = match runtime_store::load_relay_cursors(paths).await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(error = %err, "relay cursors unreadable; starting from scratch");
                Default::default()
            }
        };
        RelayManager::new(
            hub,
            shared.paths.clone(),
            peers,
            config.relay.effective_dial_timeout(),
            config.relay.effective_reconnect_interval(),
            cursors,
        )
        .spawn(shutdown_rx.clone())
    };

    tracing::info!(
        project = %shared.project.id,
        mail_dir = %paths.mail_dir.display(),
        "daemon starting (foreground)"
    );
    tracing::info!(socket = %paths.socket_path.display(), "daemon bound socket");

    let mut accept_tasks = vec![tokio::spawn(server::accept_loop(
        Listener::Unix(socket),
        shared.clone(),
        shutdown_rx.clone(),
    ))];
    if let Some(tcp) = tcp {
        match tcp.local_addr() {
            Ok(addr) => tracing::info!(addr = %addr, "daemon bound tcp listener"),
            Err(err) => tracing::warn!(error = %err, "tcp listener has no local address"),
        }
        accept_tasks.push(tokio::spawn(server::accept_loop(
            Listener::Tcp(tcp),
            shared.clone(),
            shutdown_rx.clone(),
        )));
    }

    println!("ready");
    tracing::info!(relay_peers = relay_tasks.len(), "daemon ready");

    for task in accept_tasks.into_iter().chain(relay_tasks) {
        let _ = task.await;
    }

    server::cleanup_socket(&paths.socket_path).await;
    tracing::info!("daemon shutting down");
    Ok(())
}
