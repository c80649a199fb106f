use std::sync::Arc;
use std::time::Duration;

use agentmail_core::config::Endpoint;
use agentmail_core::message::Message;
use agentmail_core::paths::MailPaths;
use agentmail_core::store::WriteOutcome;
use agentmail_core::MailError;
use agentmail_protocol::{
    ErrorInfo, MessageEvent, RelayRequest, Request, EVT_ERROR, EVT_MESSAGE, MSG_RELAY, RELAY_MODE,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::client::new_request_id;
use crate::proto::message_from_info;
use crate::runtime_store::{self, RelayCursors};
use crate::transport::{self, error_from_info, Frame, STREAM_IDLE_TIMEOUT};

use super::hub::Hub;

/// Pulls every peer's full message stream into the local hub.
pub(super) struct RelayManager {
    hub: Arc<Hub>,
    paths: MailPaths,
    peers: Vec<Endpoint>,
    dial_timeout: Duration,
    reconnect_interval: Duration,
    /// A peer stream silent for longer than this is redialed.
    idle_timeout: Duration,
    cursors: Arc<Mutex<RelayCursors>>,
}

impl RelayManager {
    pub(super) fn new(
        hub: Arc<Hub>,
        paths: MailPaths,
        peers: Vec<Endpoint>,
        dial_timeout: Duration,
        reconnect_interval: Duration,
        cursors: RelayCursors,
    ) -> Self {
        Self {
            hub,
            paths,
            peers,
            dial_timeout,
            reconnect_interval,
            idle_timeout: STREAM_IDLE_TIMEOUT,
            cursors: Arc::new(Mutex::new(cursors)),
        }
    }

    /// One task per peer; each stops once `shutdown_rx` flips.
    pub(super) fn spawn(self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let link = Arc::new(self);
        link.peers
            .iter()
            .cloned()
            .map(|peer| tokio::spawn(run_peer(link.clone(), peer, shutdown_rx.clone())))
            .collect()
    }

    async fn cursor(&self, peer: &str) -> Option<String> {
        self.cursors
            .lock()
            .await
            .get(peer, self.hub.project_id())
            .map(str::to_owned)
    }

    async fn advance(&self, peer: &str, id: &str) {
        let mut cursors = self.cursors.lock().await;
        if !cursors.advance(peer, self.hub.project_id(), id) {
            return;
        }
        // Held across the write so concurrent peers never interleave saves.
        if let Err(err) = runtime_store::save_relay_cursors(&self.paths, &cursors).await {
            tracing::warn!(peer, error = %err, "failed to persist relay cursor");
        }
    }
}

async fn run_peer(link: Arc<RelayManager>, peer: Endpoint, mut shutdown_rx: watch::Receiver<bool>) {
    let peer_key = peer.to_string();
    tracing::info!(peer = %peer_key, "relay started");

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        let outcome = tokio::select! {
            outcome = relay_session(&link, &peer, &peer_key) => outcome,
            _ = shutdown_rx.changed() => break,
        };
        match outcome {
            Ok(()) => tracing::info!(peer = %peer_key, "relay stream ended"),
            Err(err) if err.retryable() => {
                tracing::debug!(peer = %peer_key, error = %err, "relay disconnected")
            }
            Err(err) => tracing::warn!(peer = %peer_key, error = %err, "relay failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(link.reconnect_interval) => {},
            _ = shutdown_rx.changed() => break,
        }
    }

    tracing::info!(peer = %peer_key, "relay stopped");
}

async fn relay_session(link: &RelayManager, peer: &Endpoint, peer_key: &str) -> Result<(), MailError> {
    let mut conn = transport::dial(peer, link.dial_timeout).await?;

    let since_id = link.cursor(peer_key).await;
    let payload = RelayRequest {
        mode: RELAY_MODE.to_owned(),
        project_id: link.hub.project_id().to_owned(),
        since_id: since_id.clone(),
    };
    let req = Request {
        r#type: MSG_RELAY.to_owned(),
        id: new_request_id("relay"),
        payload: serde_json::to_value(payload)
            .map_err(|err| MailError::json("encode relay request", err))?,
    };
    conn.call(&req, link.dial_timeout).await?;
    tracing::info!(peer = %peer_key, since = ?since_id, "relay stream open");

    loop {
        let evt = match conn.recv_within(link.idle_timeout).await? {
            Some(Frame::Event(evt)) => evt,
            Some(Frame::Response(_)) => continue,
            None => return Ok(()),
        };

        match evt.r#type.as_str() {
            EVT_MESSAGE => {
                let payload: MessageEvent = serde_json::from_value(evt.payload)
                    .map_err(|err| MailError::Protocol(format!("malformed message event: {err}")))?;
                let msg = message_from_info(payload.msg)?;
                let id = msg.id.clone();
                apply(link, peer_key, msg).await;
                link.advance(peer_key, &id).await;
            }
            EVT_ERROR => {
                let info: ErrorInfo = serde_json::from_value(evt.payload)
                    .map_err(|err| MailError::Protocol(format!("malformed error event: {err}")))?;
                return Err(error_from_info(&info));
            }
            _ => {}
        }
    }
}

/// A message the local store rejects is logged and skipped; the cursor
/// still moves past it. Id conflicts mean two writers handed out the same id
/// for different content, so the peer's copy is kept in the runtime dir.
async fn apply(link: &RelayManager, peer_key: &str, msg: Message) {
    match link.hub.apply_exact(msg.clone()) {
        Ok(WriteOutcome::Created) => {
            tracing::debug!(peer = %peer_key, id = %msg.id, "relayed message applied")
        }
        Ok(WriteOutcome::AlreadyPresent) => {}
        Err(err @ MailError::Conflict { .. }) => {
            tracing::error!(
                peer = %peer_key,
                id = %msg.id,
                error = %err,
                "relayed message conflicts with a local one; copy kept aside"
            );
            if let Err(err) = runtime_store::record_relay_conflict(&link.paths, peer_key, &msg).await
            {
                tracing::error!(peer = %peer_key, id = %msg.id, error = %err, "failed to keep conflicting message");
            }
        }
        Err(err) => {
            tracing::warn!(peer = %peer_key, id = %msg.id, error = %err, "relayed message rejected")
        }
    }
}
