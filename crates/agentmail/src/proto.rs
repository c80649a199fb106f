use std::time::Duration;

use agentmail_core::message::{rfc3339, Body, Message};
use agentmail_core::registry::AgentRecord;
use agentmail_core::MailError;
use agentmail_protocol::{AgentInfo, ErrorInfo, MessageInfo};
use time::OffsetDateTime;

pub fn message_info(msg: &Message) -> MessageInfo {
    MessageInfo {
        id: msg.id.clone(),
        from: msg.from.clone(),
        to: msg.to.clone(),
        time: rfc3339::format(msg.time),
        body: msg.body.to_value(),
        reply_to: msg.reply_to.clone(),
        priority: msg.priority.clone(),
    }
}

pub fn message_from_info(info: MessageInfo) -> Result<Message, MailError> {
    let time = rfc3339::parse(&info.time).map_err(|err| {
        MailError::Protocol(format!("message {} has invalid time {:?}: {err}", info.id, info.time))
    })?;
    Ok(Message {
        id: info.id,
        from: info.from,
        to: info.to,
        time,
        body: Body::from_value(info.body),
        reply_to: info.reply_to,
        priority: info.priority,
    })
}

pub fn agent_info(record: &AgentRecord, now: OffsetDateTime, stale_after: Duration) -> AgentInfo {
    AgentInfo {
        name: record.name.clone(),
        host: record.host.clone(),
        first_seen: rfc3339::format(record.first_seen),
        last_seen: rfc3339::format(record.last_seen),
        status: record.status.clone(),
        online: record.is_online(now, stale_after),
    }
}

pub fn error_info(err: &MailError) -> ErrorInfo {
    ErrorInfo {
        code: err.code().to_owned(),
        message: err.to_string(),
        retryable: err.retryable(),
    }
}
