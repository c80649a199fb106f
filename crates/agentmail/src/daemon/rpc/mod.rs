use agentmail_core::MailError;
use agentmail_protocol::{Request, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::proto::error_info;

mod agents;
mod ping;
mod send;

pub(super) use agents::{handle_agent_list, handle_agent_register};
pub(super) use ping::handle_ping;
pub(super) use send::handle_send;

pub(super) fn ok_response<T: Serialize>(req: Request, payload: &T) -> Response {
    match serde_json::to_value(payload) {
        Ok(payload) => Response {
            r#type: req.r#type,
            id: req.id,
            success: true,
            error: None,
            payload,
        },
        Err(err) => error_response(req, &MailError::json("encode response", err)),
    }
}

pub(super) fn error_response(req: Request, err: &MailError) -> Response {
    Response {
        r#type: req.r#type,
        id: req.id,
        success: false,
        error: Some(error_info(err)),
        payload: serde_json::Value::Null,
    }
}

/// Decodes a request payload; a missing payload decodes as `null`.
pub(super) fn parse_payload<T: DeserializeOwned>(req: &Request) -> Result<T, MailError> {
    serde_json::from_value(req.payload.clone()).map_err(|err| {
        MailError::Protocol(format!("invalid {} payload: {err}", req.r#type))
    })
}
