use agentmail_core::MailError;
use agentmail_protocol::{AgentListResponse, AgentRegisterRequest, Request, Response};
use time::OffsetDateTime;

use crate::proto::agent_info;

use super::super::SharedState;
use super::{error_response, ok_response, parse_payload};

pub(in crate::daemon) fn handle_agent_register(shared: &SharedState, req: Request) -> Response {
    let result = parse_payload::<AgentRegisterRequest>(&req).and_then(|payload| {
        let record = shared.registry.ensure(payload.name.trim(), &payload.host)?;
        match payload.status {
            Some(status) => shared.registry.set_status(&record.name, Some(status)),
            None => Ok(record),
        }
    });

    match result {
        Ok(record) => ok_response(
            req,
            &agent_info(&record, OffsetDateTime::now_utc(), shared.agent_stale_after),
        ),
        Err(err) => error_response(req, &err),
    }
}

pub(in crate::daemon) fn handle_agent_list(shared: &SharedState, req: Request) -> Response {
    let now = OffsetDateTime::now_utc();
    let result: Result<AgentListResponse, MailError> = shared.registry.list().map(|records| {
        AgentListResponse {
            agents: records
                .iter()
                .map(|r| agent_info(r, now, shared.agent_stale_after))
                .collect(),
        }
    });

    match result {
        Ok(payload) => ok_response(req, &payload),
        Err(err) => error_response(req, &err),
    }
}
