use std::io;
use std::time::Duration;

use agentmail_core::config::Endpoint;
use agentmail_core::MailError;
use agentmail_protocol::{ErrorInfo, Event, Request, Response};
use tokio::io::{AsyncRead, AsyncWrite, BufReader, BufWriter};
use tokio::net::{TcpStream, UnixStream};

use crate::ipc::jsonl::{read_jsonl, write_jsonl};

/// A stream that goes this long without a frame is treated as lost. The
/// daemon sends a heartbeat every few seconds, so this is three missed beats.
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(15);

pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// One inbound line on a client connection.
#[derive(Debug, Clone)]
pub enum Frame {
    Response(Response),
    Event(Event),
}

impl Frame {
    fn from_value(value: serde_json::Value) -> Result<Self, MailError> {
        if value.get("success").is_some() {
            serde_json::from_value(value)
                .map(Frame::Response)
                .map_err(|err| MailError::Protocol(format!("malformed response: {err}")))
        } else {
            serde_json::from_value(value)
                .map(Frame::Event)
                .map_err(|err| MailError::Protocol(format!("malformed event: {err}")))
        }
    }
}

/// A dialed daemon connection, Unix or TCP.
pub struct Connection {
    endpoint: Endpoint,
    reader: BufReader<BoxedRead>,
    writer: BufWriter<BoxedWrite>,
}

impl Connection {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn send(&mut self, req: &Request) -> Result<(), MailError> {
        write_jsonl(&mut self.writer, req)
            .await
            .map_err(|err| classify_io(err, "write request"))
    }

    /// Next frame, or `Ok(None)` when the daemon closed the connection.
    pub async fn recv(&mut self) -> Result<Option<Frame>, MailError> {
        let value: Option<serde_json::Value> = read_jsonl(&mut self.reader)
            .await
            .map_err(|err| classify_io(err, "read frame"))?;
        value.map(Frame::from_value).transpose()
    }

    /// `recv` bounded by `idle`; a peer that stays silent that long is a
    /// transport failure.
    pub async fn recv_within(&mut self, idle: Duration) -> Result<Option<Frame>, MailError> {
        tokio::time::timeout(idle, self.recv())
            .await
            .map_err(|_| MailError::Transport(format!("{} went quiet for {idle:?}", self.endpoint)))?
    }

    /// Reads until the response to `id` arrives. Events seen on the way are
    /// discarded.
    pub async fn read_response(
        &mut self,
        id: &str,
        timeout: Duration,
    ) -> Result<Response, MailError> {
        let wait = async {
            loop {
                match self.recv().await? {
                    Some(Frame::Response(resp)) if resp.id == id || resp.id.is_empty() => {
                        return Ok(resp);
                    }
                    Some(_) => continue,
                    None => {
                        return Err(MailError::Transport(
                            "connection closed before response".to_owned(),
                        ))
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MailError::Transport(format!("no response within {timeout:?}")))?
    }

    /// Sends `req` and waits for its response; a failed response becomes the
    /// matching error.
    pub async fn call(&mut self, req: &Request, timeout: Duration) -> Result<Response, MailError> {
        self.send(req).await?;
        let resp = self.read_response(&req.id, timeout).await?;
        if resp.success {
            Ok(resp)
        } else {
            Err(response_error(&resp))
        }
    }
}

pub async fn dial(endpoint: &Endpoint, timeout: Duration) -> Result<Connection, MailError> {
    let connect = async {
        let (read, write): (BoxedRead, BoxedWrite) = match endpoint {
            Endpoint::Unix(path) => {
                let (r, w) = UnixStream::connect(path).await?.into_split();
                (Box::new(r), Box::new(w))
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };
        Ok::<_, io::Error>((read, write))
    };

    let (read, write) = tokio::time::timeout(timeout, connect)
        .await
        .map_err(|_| MailError::Transport(format!("connect to {endpoint} timed out")))?
        .map_err(|err| MailError::Transport(format!("connect to {endpoint}: {err}")))?;

    Ok(Connection {
        endpoint: endpoint.clone(),
        reader: BufReader::new(read),
        writer: BufWriter::new(write),
    })
}

/// Dials each endpoint in order and returns the first that answers.
pub async fn discover(endpoints: &[Endpoint], timeout: Duration) -> Result<Connection, MailError> {
    let mut last_err = None;
    for endpoint in endpoints {
        match dial(endpoint, timeout).await {
            Ok(conn) => return Ok(conn),
            Err(err) => {
                tracing::debug!(endpoint = %endpoint, error = %err, "endpoint unavailable");
                last_err = Some(err);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| MailError::Transport("no endpoints configured".to_owned())))
}

pub fn response_error(resp: &Response) -> MailError {
    match &resp.error {
        Some(info) => error_from_info(info),
        None => MailError::Protocol(format!("{} failed without error detail", resp.r#type)),
    }
}

pub fn error_from_info(info: &ErrorInfo) -> MailError {
    MailError::from_wire(&info.code, &info.message, info.retryable)
}

fn classify_io(err: io::Error, context: &str) -> MailError {
    if err.kind() == io::ErrorKind::InvalidData {
        MailError::Protocol(format!("{context}: {err}"))
    } else {
        MailError::Transport(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_told_apart_by_success_field() {
        let resp = Frame::from_value(serde_json::json!({
            "type": "ping", "id": "1", "success": true, "payload": null
        }))
        .unwrap();
        assert!(matches!(resp, Frame::Response(_)));

        let evt = Frame::from_value(serde_json::json!({
            "type": "heartbeat", "id": "evt-1", "payload": {"now_ms": 1}
        }))
        .unwrap();
        assert!(matches!(evt, Frame::Event(_)));
    }

    #[test]
    fn failed_response_maps_wire_code() {
        let resp = Response {
            r#type: "mail.watch".to_owned(),
            id: "1".to_owned(),
            success: false,
            error: Some(ErrorInfo {
                code: "access_denied".to_owned(),
                message: "nope".to_owned(),
                retryable: false,
            }),
            payload: serde_json::Value::Null,
        };
        assert_eq!(response_error(&resp).code(), "access_denied");
    }

    #[tokio::test]
    async fn dial_missing_socket_is_transport_error() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::Unix(dir.path().join("missing.sock"));
        let err = match dial(&endpoint, Duration::from_millis(200)).await {
            Ok(_) => panic!("dial should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, MailError::Transport(_)));
        assert!(err.retryable());
    }

    #[tokio::test]
    async fn discover_falls_through_to_live_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let live = dir.path().join("live.sock");
        let listener = tokio::net::UnixListener::bind(&live).unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let endpoints = vec![
            Endpoint::Unix(dir.path().join("dead.sock")),
            Endpoint::Unix(live.clone()),
        ];
        let conn = discover(&endpoints, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(conn.endpoint(), &Endpoint::Unix(live));
        accept.await.unwrap().unwrap();
    }
}
