use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use agentmail_core::paths::MailPaths;
use agentmail_core::project::ProjectState;
use agentmail_core::registry::AgentRegistry;

use super::hub::Hub;
use super::DaemonHandle;

pub(super) struct SharedState {
    pub(super) pid: u32,
    pub(super) started_at: SystemTime,
    pub(super) started_at_instant: Instant,
    pub(super) shutdown: DaemonHandle,
    pub(super) next_conn_id: AtomicU64,
    pub(super) next_event_id: AtomicU64,

    pub(super) paths: MailPaths,
    pub(super) project: ProjectState,
    pub(super) hub: Arc<Hub>,
    pub(super) registry: AgentRegistry,
    pub(super) agent_stale_after: Duration,
}

impl SharedState {
    pub(super) fn next_event_id(&self) -> String {
        let id = self.next_event_id.fetch_add(1, Ordering::Relaxed);
        format!("evt-{id}")
    }

    /// The hub serving `project_id`, if this daemon owns that project.
    pub(super) fn hub_for(&self, project_id: &str) -> Option<&Arc<Hub>> {
        (self.project.id == project_id.trim()).then_some(&self.hub)
    }
}
