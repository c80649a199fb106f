use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agentmail_core::config::{ConfigFile, Endpoint};
use agentmail_core::paths::MailPaths;
use agentmail_core::MailError;
use agentmail_protocol::{
    AgentInfo, AgentListResponse, AgentRegisterRequest, PingResponse, Request, Response,
    SendRequest, SendResponse, MSG_AGENT_LIST, MSG_AGENT_REGISTER, MSG_PING, MSG_SEND,
    MSG_SHUTDOWN,
};
use anyhow::Context as _;

use crate::transport::{self, Connection};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Where clients look for a daemon: the local socket first, then the
/// configured TCP address.
pub fn endpoints(paths: &MailPaths, config: &ConfigFile) -> Vec<Endpoint> {
    let mut out = vec![Endpoint::Unix(paths.socket_path.clone())];
    if let Some(addr) = config
        .server
        .tcp_connect
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        out.push(Endpoint::Tcp(addr.to_owned()));
    }
    out
}

pub async fn ping(endpoints: &[Endpoint]) -> anyhow::Result<PingResponse> {
    let resp = request(endpoints, MSG_PING, serde_json::Value::Null).await?;
    serde_json::from_value(resp.payload).context("parse ping response payload")
}

pub async fn shutdown(endpoints: &[Endpoint]) -> anyhow::Result<()> {
    request(endpoints, MSG_SHUTDOWN, serde_json::Value::Null).await?;
    Ok(())
}

/// Sends through the daemon. `Ok(None)` means no daemon could be dialed, so
/// nothing was written. Once the request is on the wire every failure is
/// returned as is: the daemon may have stored the message already.
pub async fn send(
    endpoints: &[Endpoint],
    payload: SendRequest,
) -> Result<Option<SendResponse>, MailError> {
    let payload = serde_json::to_value(payload).map_err(|err| MailError::json("encode send", err))?;
    let mut conn = match transport::discover(endpoints, CONNECT_TIMEOUT).await {
        Ok(conn) => conn,
        Err(err) => {
            tracing::debug!(error = %err, "no daemon to send through");
            return Ok(None);
        }
    };
    let resp = exchange(&mut conn, MSG_SEND, payload).await?;
    serde_json::from_value(resp.payload)
        .map(Some)
        .map_err(|err| MailError::json("parse send response", err))
}

pub async fn agent_register(
    endpoints: &[Endpoint],
    payload: AgentRegisterRequest,
) -> anyhow::Result<AgentInfo> {
    let payload = serde_json::to_value(payload).context("serialize payload")?;
    let resp = request(endpoints, MSG_AGENT_REGISTER, payload).await?;
    serde_json::from_value(resp.payload).context("parse agent.register payload")
}

pub async fn agent_list(endpoints: &[Endpoint]) -> anyhow::Result<AgentListResponse> {
    let resp = request(endpoints, MSG_AGENT_LIST, serde_json::Value::Null).await?;
    serde_json::from_value(resp.payload).context("parse agent.list payload")
}

/// One request/response exchange on a fresh connection.
pub async fn request(
    endpoints: &[Endpoint],
    r#type: &str,
    payload: serde_json::Value,
) -> Result<Response, MailError> {
    let mut conn = transport::discover(endpoints, CONNECT_TIMEOUT).await?;
    exchange(&mut conn, r#type, payload).await
}

async fn exchange(
    conn: &mut Connection,
    r#type: &str,
    payload: serde_json::Value,
) -> Result<Response, MailError> {
    let req = Request {
        r#type: r#type.to_owned(),
        id: new_request_id(r#type),
        payload,
    };
    conn.call(&req, READ_TIMEOUT).await
}

pub fn new_request_id(prefix: &str) -> String {
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{prefix}-{now_ns}")
}
