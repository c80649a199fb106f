use std::time::UNIX_EPOCH;

use agentmail_protocol::{PingResponse, Request, Response, PROTOCOL_VERSION};

use super::super::SharedState;
use super::ok_response;

pub(in crate::daemon) fn handle_ping(shared: &SharedState, req: Request) -> Response {
    let started_at_ms = shared
        .started_at
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let uptime_ms = shared.started_at_instant.elapsed().as_millis() as u64;

    let payload = PingResponse {
        version: env!("CARGO_PKG_VERSION").to_owned(),
        protocol: PROTOCOL_VERSION.to_owned(),
        pid: shared.pid,
        started_at_ms,
        uptime_ms,
        project_id: shared.project.id.clone(),
    };
    ok_response(req, &payload)
}
