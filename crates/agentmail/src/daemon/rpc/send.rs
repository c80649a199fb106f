use agentmail_core::message::{Body, Message};
use agentmail_core::MailError;
use agentmail_protocol::{Request, Response, SendRequest, SendResponse};

use super::super::SharedState;
use super::{error_response, ok_response, parse_payload};

pub(in crate::daemon) fn handle_send(shared: &SharedState, req: Request) -> Response {
    match send(shared, &req) {
        Ok(payload) => ok_response(req, &payload),
        Err(err) => {
            tracing::debug!(error = %err, code = err.code(), "send rejected");
            error_response(req, &err)
        }
    }
}

fn send(shared: &SharedState, req: &Request) -> Result<SendResponse, MailError> {
    let payload: SendRequest = parse_payload(req)?;
    let from = payload.from.trim().to_owned();

    let msg = Message::new(from.clone(), payload.to.trim(), Body::from_value(payload.body))
        .with_reply_to(payload.reply_to)
        .with_priority(payload.priority);
    let saved = shared.hub.publish(msg)?;

    if let Err(err) = shared.registry.ensure(&from, &payload.host) {
        tracing::warn!(agent = %from, error = %err, "presence update failed");
    }

    tracing::debug!(id = %saved.id, from = %saved.from, to = %saved.to, "message published");
    Ok(SendResponse { id: saved.id })
}
