use std::io;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agentmail_core::cursor::Cursor;
use agentmail_core::message::Message;
use agentmail_core::target::TargetFilter;
use agentmail_core::MailError;
use agentmail_protocol::{
    Event, HeartbeatEvent, MessageEvent, RelayRequest, Request, Response, WatchRequest,
    EVT_ERROR, EVT_HEARTBEAT, EVT_MESSAGE, MSG_AGENT_LIST, MSG_AGENT_REGISTER, MSG_PING,
    MSG_RELAY, MSG_SEND, MSG_SHUTDOWN, MSG_UNWATCH, MSG_WATCH, RELAY_MODE,
};
use anyhow::Context as _;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::ipc::jsonl::{read_jsonl, write_jsonl};
use crate::proto::{error_info, message_info};
use crate::transport::{BoxedRead, BoxedWrite};

use super::hub::Subscription;
use super::{rpc, DaemonHandle, SharedState};

/// Presence refresh and heartbeat cadence for open streams.
pub(super) const PRESENCE_INTERVAL: Duration = Duration::from_secs(5);

const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug)]
enum Outbound {
    Response(Response),
    Event(Event),
}

pub(super) enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    async fn accept(&self) -> io::Result<(BoxedRead, BoxedWrite, String)> {
        match self {
            Self::Unix(listener) => {
                let (stream, _addr) = listener.accept().await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), "unix".to_owned()))
            }
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), addr.to_string()))
            }
        }
    }
}

pub(super) async fn bind_socket(path: &Path) -> anyhow::Result<UnixListener> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create socket dir: {}", parent.display()))?;
    }

    if path.exists() {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("remove existing socket: {}", path.display()))?;
    }

    let listener = UnixListener::bind(path)
        .with_context(|| format!("bind unix socket: {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
    }
    Ok(listener)
}

pub(super) async fn bind_tcp(addr: &str) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind tcp listener: {addr}"))
}

pub(super) async fn cleanup_socket(path: &Path) {
    let _ = tokio::fs::remove_file(path).await;
}

pub(super) async fn accept_loop(
    listener: Listener,
    shared: Arc<SharedState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => {},
            accepted = listener.accept() => {
                match accepted {
                    Ok((read, write, peer)) => {
                        let conn_id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(conn_id, peer = %peer, "connection accepted");
                        let shared = shared.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(read, write, shared, conn_id).await {
                                tracing::debug!(conn_id, error = %err, "connection ended with error");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    read: BoxedRead,
    write: BoxedWrite,
    shared: Arc<SharedState>,
    conn_id: u64,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(read);
    let writer = BufWriter::new(write);

    let (out_tx, out_rx) = mpsc::channel::<Outbound>(OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(connection_writer(writer, out_rx, conn_id));

    let mut stream_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut result = Ok(());

    loop {
        let req: Request = match read_jsonl(&mut reader).await {
            Ok(Some(req)) => req,
            Ok(None) => break,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                let malformed = Request {
                    r#type: "error".to_owned(),
                    id: String::new(),
                    payload: serde_json::Value::Null,
                };
                let err = MailError::Protocol(format!("malformed request: {err}"));
                let _ = out_tx
                    .send(Outbound::Response(rpc::error_response(malformed, &err)))
                    .await;
                break;
            }
            Err(err) => {
                result = Err(anyhow::Error::new(err).context("read request"));
                break;
            }
        };

        let req_type = req.r#type.clone();
        let resp = match req_type.as_str() {
            MSG_PING => rpc::handle_ping(&shared, req),
            MSG_SEND => rpc::handle_send(&shared, req),
            MSG_AGENT_REGISTER => rpc::handle_agent_register(&shared, req),
            MSG_AGENT_LIST => rpc::handle_agent_list(&shared, req),
            MSG_SHUTDOWN => {
                let resp = rpc::ok_response(req, &serde_json::Value::Null);
                let _ = out_tx.send(Outbound::Response(resp)).await;
                shared.shutdown.request_shutdown();
                break;
            }
            MSG_WATCH | MSG_RELAY => {
                if stream_task.as_ref().is_some_and(|t| !t.is_finished()) {
                    let err = MailError::Protocol(
                        "a stream is already open on this connection".to_owned(),
                    );
                    let _ = out_tx
                        .send(Outbound::Response(rpc::error_response(req, &err)))
                        .await;
                    continue;
                }

                let opened = if req_type == MSG_WATCH {
                    open_watch(&shared, &req)
                } else {
                    open_relay(&shared, &req)
                };
                match opened {
                    Ok(stream) => {
                        let resp = rpc::ok_response(req, &serde_json::Value::Null);
                        if out_tx.send(Outbound::Response(resp)).await.is_err() {
                            break;
                        }
                        stream_task = Some(tokio::spawn(run_stream(
                            shared.clone(),
                            stream,
                            out_tx.clone(),
                            conn_id,
                        )));
                        continue;
                    }
                    Err(err) => {
                        tracing::debug!(conn_id, error = %err, "stream refused");
                        rpc::error_response(req, &err)
                    }
                }
            }
            MSG_UNWATCH => {
                if let Some(task) = stream_task.take() {
                    task.abort();
                }
                rpc::ok_response(req, &serde_json::Value::Null)
            }
            other => {
                let err = MailError::Protocol(format!("unknown request type: {other}"));
                rpc::error_response(req, &err)
            }
        };

        if out_tx.send(Outbound::Response(resp)).await.is_err() {
            break;
        }
    }

    drop(out_tx);
    if let Some(task) = stream_task.take() {
        task.abort();
    }
    let _ = writer_task.await;

    result
}

async fn connection_writer<W>(
    mut writer: W,
    mut out_rx: mpsc::Receiver<Outbound>,
    conn_id: u64,
) -> anyhow::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(msg) = out_rx.recv().await {
        match msg {
            Outbound::Response(resp) => {
                write_jsonl(&mut writer, &resp).await?;
            }
            Outbound::Event(evt) => {
                write_jsonl(&mut writer, &evt).await?;
            }
        }
    }

    writer.shutdown().await.ok();
    tracing::debug!(conn_id, "connection writer exiting");
    Ok(())
}

struct OpenStream {
    sub: Subscription,
    /// Watching agent whose presence the stream keeps fresh.
    agent: Option<String>,
    kind: &'static str,
}

fn open_watch(shared: &SharedState, req: &Request) -> Result<OpenStream, MailError> {
    let watch: WatchRequest = rpc::parse_payload(req)?;
    let agent = watch
        .agent
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_owned);

    let filter = TargetFilter::for_watch(&watch.target, agent.as_deref())?;
    filter.check_access(agent.as_deref(), watch.allow_dm)?;
    let cursor = Cursor::from_parts(watch.since_id.as_deref(), watch.since_time.as_deref())?;

    if let Some(agent) = agent.as_deref() {
        shared.registry.ensure(agent, &watch.host)?;
    }

    let sub = shared.hub.subscribe(filter, cursor)?;
    Ok(OpenStream {
        sub,
        agent,
        kind: "watch",
    })
}

fn open_relay(shared: &SharedState, req: &Request) -> Result<OpenStream, MailError> {
    let relay: RelayRequest = rpc::parse_payload(req)?;
    if relay.mode != RELAY_MODE {
        return Err(MailError::Protocol(format!(
            "unsupported relay mode {:?}",
            relay.mode
        )));
    }

    let hub = shared
        .hub_for(&relay.project_id)
        .ok_or_else(|| MailError::NotFound {
            mailbox: format!("project {}", relay.project_id),
        })?;
    let cursor = Cursor::from_parts(relay.since_id.as_deref(), None)?;

    let sub = hub.subscribe(TargetFilter::Everything, cursor)?;
    Ok(OpenStream {
        sub,
        agent: None,
        kind: "relay",
    })
}

async fn run_stream(
    shared: Arc<SharedState>,
    mut stream: OpenStream,
    out_tx: mpsc::Sender<Outbound>,
    conn_id: u64,
) {
    let subscriber = stream.sub.id();
    tracing::debug!(conn_id, subscriber, kind = stream.kind, "stream open");

    let mut presence = tokio::time::interval_at(
        tokio::time::Instant::now() + PRESENCE_INTERVAL,
        PRESENCE_INTERVAL,
    );
    presence.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = stream.sub.next() => match next {
                Ok(Some(msg)) => {
                    if out_tx.send(Outbound::Event(message_event(&shared, &msg))).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::info!(conn_id, subscriber, error = %err, "stream terminated");
                    let evt = event(&shared, EVT_ERROR, &error_info(&err));
                    let _ = out_tx.send(Outbound::Event(evt)).await;
                    break;
                }
            },
            _ = presence.tick() => {
                if let Some(agent) = stream.agent.as_deref() {
                    if let Err(err) = shared.registry.touch(agent) {
                        tracing::warn!(conn_id, agent, error = %err, "presence heartbeat failed");
                    }
                }
                let now_ms = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as u64;
                let evt = event(&shared, EVT_HEARTBEAT, &HeartbeatEvent { now_ms });
                if out_tx.send(Outbound::Event(evt)).await.is_err() {
                    break;
                }
            }
        }
    }

    tracing::debug!(conn_id, subscriber, kind = stream.kind, "stream closed");
}

fn message_event(shared: &SharedState, msg: &Message) -> Event {
    event(
        shared,
        EVT_MESSAGE,
        &MessageEvent {
            msg: message_info(msg),
        },
    )
}

fn event<T: Serialize>(shared: &SharedState, r#type: &str, payload: &T) -> Event {
    Event {
        r#type: r#type.to_owned(),
        id: shared.next_event_id(),
        payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
    }
}

pub(super) async fn shutdown_signal_watcher(handle: DaemonHandle) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                match sigterm.as_mut() {
                    Some(s) => { s.recv().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    handle.request_shutdown();
}
