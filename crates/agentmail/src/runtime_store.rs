use std::collections::BTreeMap;
use std::path::PathBuf;

use agentmail_core::message::{rfc3339, Message};
use agentmail_core::paths::MailPaths;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt as _;

const RELAY_CURSORS_FILE: &str = "relay-cursors.json";
const RELAY_CONFLICTS_FILE: &str = "relay-conflicts.jsonl";

/// Last applied message id per relay peer and project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCursors {
    #[serde(default)]
    peers: BTreeMap<String, BTreeMap<String, String>>,
}

impl RelayCursors {
    pub fn get(&self, peer: &str, project_id: &str) -> Option<&str> {
        self.peers
            .get(peer)
            .and_then(|projects| projects.get(project_id))
            .map(String::as_str)
    }

    /// Moves the cursor forward to `id`. Returns false when `id` is not past
    /// the current position.
    pub fn advance(&mut self, peer: &str, project_id: &str, id: &str) -> bool {
        let slot = self
            .peers
            .entry(peer.to_owned())
            .or_default()
            .entry(project_id.to_owned())
            .or_default();
        if id <= slot.as_str() {
            return false;
        }
        *slot = id.to_owned();
        true
    }
}

pub async fn save_relay_cursors(paths: &MailPaths, cursors: &RelayCursors) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&paths.runtime_dir)
        .await
        .with_context(|| format!("create runtime dir: {}", paths.runtime_dir.display()))?;

    let dest = paths.runtime_dir.join(RELAY_CURSORS_FILE);
    let tmp = paths
        .runtime_dir
        .join(format!(".{RELAY_CURSORS_FILE}.{}.tmp", std::process::id()));

    let data = serde_json::to_vec_pretty(cursors).context("serialize relay cursors")?;
    tokio::fs::write(&tmp, &data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, &dest)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), dest.display()))?;

    Ok(())
}

pub async fn load_relay_cursors(paths: &MailPaths) -> anyhow::Result<RelayCursors> {
    let path = paths.runtime_dir.join(RELAY_CURSORS_FILE);
    let data = match tokio::fs::read_to_string(&path).await {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(RelayCursors::default())
        }
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    serde_json::from_str(&data).with_context(|| format!("parse {}", path.display()))
}

/// A relayed message whose id already names different content locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConflict {
    pub peer: String,
    pub received_at: String,
    pub msg: Message,
}

/// Keeps a copy of a relayed message the local store refused, so it can be
/// recovered by hand.
pub async fn record_relay_conflict(
    paths: &MailPaths,
    peer: &str,
    msg: &Message,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&paths.runtime_dir)
        .await
        .with_context(|| format!("create runtime dir: {}", paths.runtime_dir.display()))?;

    let entry = RelayConflict {
        peer: peer.to_owned(),
        received_at: rfc3339::format(OffsetDateTime::now_utc()),
        msg: msg.clone(),
    };
    let mut line = serde_json::to_vec(&entry).context("serialize relay conflict")?;
    line.push(b'\n');

    let path = relay_conflicts_path(paths);
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(&line)
        .await
        .with_context(|| format!("append {}", path.display()))?;
    Ok(())
}

pub fn relay_conflicts_path(paths: &MailPaths) -> PathBuf {
    paths.runtime_dir.join(RELAY_CONFLICTS_FILE)
}
