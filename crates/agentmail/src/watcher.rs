//! Client-side watch that prefers a live daemon stream and falls back to
//! polling the mailbox directly while no daemon answers.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use agentmail_core::config::{Endpoint, WatchConfig};
use agentmail_core::cursor::Cursor;
use agentmail_core::message::{id_time, rfc3339, Message};
use agentmail_core::registry::AgentRegistry;
use agentmail_core::store::MessageStore;
use agentmail_core::target::TargetFilter;
use agentmail_core::MailError;
use agentmail_protocol::{
    ErrorInfo, MessageEvent, Request, WatchRequest, EVT_ERROR, EVT_MESSAGE, MSG_WATCH,
};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::new_request_id;
use crate::proto::message_from_info;
use crate::transport::{self, error_from_info, Connection, Frame, STREAM_IDLE_TIMEOUT};

const OPEN_TIMEOUT: Duration = Duration::from_secs(2);
const SEEN_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Discovering,
    Connected,
    Disconnected,
    Polling,
}

/// What just happened, as far as the state machine cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Dialed,
    DialFailed,
    StreamLost,
    Reconnect,
    RediscoverDue,
}

pub fn next_state(state: WatchState, outcome: Outcome) -> WatchState {
    use Outcome::*;
    use WatchState::*;

    match (state, outcome) {
        (Discovering | Polling, Dialed) => Connected,
        (Discovering | Polling, DialFailed) => Polling,
        (Connected, StreamLost) => Disconnected,
        (Disconnected, Reconnect) => Discovering,
        (Polling, RediscoverDue) => Discovering,
        (state, _) => state,
    }
}

/// Why a watch returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    /// The requested number of messages was delivered.
    Count,
    Deadline,
    /// The receiver was dropped.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub agent: Option<String>,
    pub target: String,
    pub allow_dm: bool,
    /// Resume point. `None` starts at the watch's start time unless
    /// `replay_all` is set.
    pub since: Option<Cursor>,
    pub replay_all: bool,
    pub max_messages: Option<usize>,
    pub timeout: Option<Duration>,
    pub dial_timeout: Duration,
    pub poll_min: Duration,
    pub poll_max: Duration,
    pub rediscover: Duration,
    /// Silence on a live stream longer than this counts as a lost stream.
    pub idle_timeout: Duration,
    /// Recorded in the agent registry alongside `agent`.
    pub host: String,
}

impl WatchOptions {
    pub fn new(target: impl Into<String>, config: &WatchConfig) -> Self {
        Self {
            agent: None,
            target: target.into(),
            allow_dm: false,
            since: None,
            replay_all: false,
            max_messages: None,
            timeout: None,
            dial_timeout: config.effective_dial_timeout(),
            poll_min: config.effective_poll_min(),
            poll_max: config.effective_poll_max(),
            rediscover: config.effective_rediscover(),
            idle_timeout: STREAM_IDLE_TIMEOUT,
            host: String::new(),
        }
    }
}

pub struct Watcher {
    opts: WatchOptions,
    filter: TargetFilter,
    endpoints: Vec<Endpoint>,
    store: MessageStore,
    state: WatchState,
    started: OffsetDateTime,
    last_id: Option<String>,
    seen: SeenIds,
    delivered: usize,
}

enum Flow {
    Lost,
    Done(WatchEnd),
}

impl Watcher {
    /// Fails fast on a malformed target or a DM the caller may not read.
    pub fn new(
        opts: WatchOptions,
        endpoints: Vec<Endpoint>,
        store: MessageStore,
    ) -> Result<Self, MailError> {
        let agent = opts.agent.as_deref().map(str::trim).filter(|a| !a.is_empty());
        let filter = TargetFilter::for_watch(&opts.target, agent)?;
        filter.check_access(agent, opts.allow_dm)?;

        Ok(Self {
            opts,
            filter,
            endpoints,
            store,
            state: WatchState::Discovering,
            started: OffsetDateTime::now_utc(),
            last_id: None,
            seen: SeenIds::new(SEEN_CAPACITY),
            delivered: 0,
        })
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Delivers matching messages to `tx` until a bound is hit, the receiver
    /// goes away, or a non-retryable error occurs.
    pub async fn run(mut self, tx: mpsc::Sender<Message>) -> Result<WatchEnd, MailError> {
        match self.opts.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.drive(&tx)).await {
                Ok(result) => result,
                Err(_) => Ok(WatchEnd::Deadline),
            },
            None => self.drive(&tx).await,
        }
    }

    async fn drive(&mut self, tx: &mpsc::Sender<Message>) -> Result<WatchEnd, MailError> {
        let mut conn: Option<Connection> = None;
        let mut backoff = PollBackoff::new(self.opts.poll_min, self.opts.poll_max);
        let mut next_rediscover = Instant::now();

        loop {
            match self.state {
                WatchState::Discovering => {
                    match transport::discover(&self.endpoints, self.opts.dial_timeout).await {
                        Ok(c) => {
                            tracing::debug!(endpoint = %c.endpoint(), "daemon found");
                            conn = Some(c);
                            self.transition(Outcome::Dialed);
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "no daemon reachable; polling the store");
                            self.record_presence();
                            next_rediscover = Instant::now() + self.opts.rediscover;
                            backoff.reset();
                            self.transition(Outcome::DialFailed);
                        }
                    }
                }
                WatchState::Connected => {
                    let Some(c) = conn.take() else {
                        self.transition(Outcome::StreamLost);
                        continue;
                    };
                    match self.stream(c, tx).await {
                        Ok(Flow::Done(end)) => return Ok(end),
                        Ok(Flow::Lost) => {
                            tracing::info!("watch stream closed by daemon");
                            self.transition(Outcome::StreamLost);
                        }
                        Err(err) if err.retryable() => {
                            tracing::info!(error = %err, "watch stream lost; resuming");
                            self.transition(Outcome::StreamLost);
                        }
                        Err(err) => return Err(err),
                    }
                }
                WatchState::Disconnected => {
                    tokio::time::sleep(self.opts.poll_min).await;
                    self.transition(Outcome::Reconnect);
                }
                WatchState::Polling => {
                    if let Some(end) = self.poll_once(tx, &mut backoff).await? {
                        return Ok(end);
                    }
                    let now = Instant::now();
                    if now >= next_rediscover {
                        self.transition(Outcome::RediscoverDue);
                    } else {
                        let wait = backoff.current().min(next_rediscover - now);
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }
    }

    /// Without a daemon nobody else keeps the watching agent's registry
    /// entry fresh.
    fn record_presence(&self) {
        let Some(agent) = self.opts.agent.as_deref().map(str::trim).filter(|a| !a.is_empty())
        else {
            return;
        };
        if let Err(err) = AgentRegistry::new(self.store.root()).ensure(agent, &self.opts.host) {
            tracing::warn!(agent, error = %err, "presence update failed");
        }
    }

    fn transition(&mut self, outcome: Outcome) {
        let next = next_state(self.state, outcome);
        if next != self.state {
            tracing::debug!(from = ?self.state, to = ?next, ?outcome, "watch state");
        }
        self.state = next;
    }

    /// Resume point for the daemon: strictly after the last delivered id.
    fn resume_cursor(&self) -> Option<Cursor> {
        match &self.last_id {
            Some(id) => Some(Cursor::Id(id.clone())),
            None => self.initial_cursor(),
        }
    }

    /// Polls look back to the start of the last delivered id's second, so a
    /// same-second id written later by another process is still found. The
    /// seen set drops the repeats.
    fn poll_cursor(&self) -> Option<Cursor> {
        match self.last_id.as_deref().and_then(id_time) {
            Some(t) => Some(Cursor::Time(t)),
            None => self.resume_cursor(),
        }
    }

    fn initial_cursor(&self) -> Option<Cursor> {
        if self.opts.since.is_some() {
            return self.opts.since.clone();
        }
        if self.opts.replay_all {
            return None;
        }
        Some(Cursor::Time(self.started))
    }

    async fn stream(
        &mut self,
        mut conn: Connection,
        tx: &mpsc::Sender<Message>,
    ) -> Result<Flow, MailError> {
        let (since_id, since_time) = match self.resume_cursor() {
            Some(Cursor::Id(id)) => (Some(id), None),
            Some(Cursor::Time(t)) => (None, Some(rfc3339::format(t))),
            None => (None, None),
        };
        let payload = WatchRequest {
            agent: self.opts.agent.clone(),
            target: self.opts.target.clone(),
            since_id,
            since_time,
            allow_dm: self.opts.allow_dm,
            host: self.opts.host.clone(),
        };
        let req = Request {
            r#type: MSG_WATCH.to_owned(),
            id: new_request_id("watch"),
            payload: serde_json::to_value(payload)
                .map_err(|err| MailError::json("encode watch request", err))?,
        };
        conn.call(&req, OPEN_TIMEOUT).await?;
        tracing::info!(endpoint = %conn.endpoint(), target = %self.opts.target, "watching live");

        loop {
            let evt = match conn.recv_within(self.opts.idle_timeout).await? {
                Some(Frame::Event(evt)) => evt,
                Some(Frame::Response(_)) => continue,
                None => return Ok(Flow::Lost),
            };

            match evt.r#type.as_str() {
                EVT_MESSAGE => {
                    let payload: MessageEvent = serde_json::from_value(evt.payload).map_err(|err| {
                        MailError::Protocol(format!("malformed message event: {err}"))
                    })?;
                    let msg = message_from_info(payload.msg)?;
                    if let Some(end) = self.deliver(msg, tx).await {
                        return Ok(Flow::Done(end));
                    }
                }
                EVT_ERROR => {
                    let info: ErrorInfo = serde_json::from_value(evt.payload).map_err(|err| {
                        MailError::Protocol(format!("malformed error event: {err}"))
                    })?;
                    return Err(error_from_info(&info));
                }
                _ => {}
            }
        }
    }

    async fn poll_once(
        &mut self,
        tx: &mpsc::Sender<Message>,
        backoff: &mut PollBackoff,
    ) -> Result<Option<WatchEnd>, MailError> {
        let cursor = self.poll_cursor();
        let batch = self.filter.read_since(&self.store, cursor.as_ref())?;

        let mut hit = false;
        for msg in batch {
            if self.seen.contains(&msg.id) {
                continue;
            }
            hit = true;
            if let Some(end) = self.deliver(msg, tx).await {
                return Ok(Some(end));
            }
        }

        if hit {
            backoff.reset();
        } else {
            backoff.grow();
        }
        Ok(None)
    }

    async fn deliver(&mut self, msg: Message, tx: &mpsc::Sender<Message>) -> Option<WatchEnd> {
        if !self.seen.insert(&msg.id) {
            return None;
        }
        let newer = match self.last_id.as_deref() {
            Some(last) => msg.id.as_str() > last,
            None => true,
        };
        if newer {
            self.last_id = Some(msg.id.clone());
        }

        if tx.send(msg).await.is_err() {
            return Some(WatchEnd::Cancelled);
        }
        self.delivered += 1;
        match self.opts.max_messages {
            Some(max) if self.delivered >= max => Some(WatchEnd::Count),
            _ => None,
        }
    }
}

/// Poll interval that doubles on empty polls and snaps back on a hit.
#[derive(Debug, Clone)]
struct PollBackoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl PollBackoff {
    fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            current: min,
        }
    }

    fn current(&self) -> Duration {
        self.current
    }

    fn reset(&mut self) {
        self.current = self.min;
    }

    fn grow(&mut self) {
        self.current = (self.current * 2).min(self.max);
    }
}

/// Recently delivered ids, oldest evicted first.
#[derive(Debug)]
struct SeenIds {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenIds {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    fn insert(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_owned()) {
            return false;
        }
        self.order.push_back(id.to_owned());
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use agentmail_core::message::Body;
    use agentmail_protocol::{Event, Response};
    use tokio::io::BufReader;
    use tokio::net::unix::OwnedWriteHalf;
    use tokio::net::UnixListener;

    use crate::ipc::jsonl::{read_jsonl, write_jsonl};
    use crate::proto::message_info;

    use super::*;

    /// Server end of one accepted watch stream.
    struct DaemonSide {
        watch: WatchRequest,
        writer: OwnedWriteHalf,
    }

    impl DaemonSide {
        async fn push(&mut self, msg: &Message) {
            let payload = MessageEvent {
                msg: message_info(msg),
            };
            self.emit(EVT_MESSAGE, serde_json::to_value(payload).unwrap()).await;
        }

        async fn push_error(&mut self, info: ErrorInfo) {
            self.emit(EVT_ERROR, serde_json::to_value(info).unwrap()).await;
        }

        async fn emit(&mut self, r#type: &str, payload: serde_json::Value) {
            let evt = Event {
                r#type: r#type.to_owned(),
                id: "evt-1".to_owned(),
                payload,
            };
            write_jsonl(&mut self.writer, &evt).await.unwrap();
        }
    }

    /// Accepts the next watcher and acknowledges its watch request.
    async fn accept_watch(listener: &UnixListener) -> DaemonSide {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("watcher never dialed")
            .unwrap();
        let (read, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read);

        let req: Request = read_jsonl(&mut reader).await.unwrap().unwrap();
        assert_eq!(req.r#type, MSG_WATCH);
        let watch: WatchRequest = serde_json::from_value(req.payload).unwrap();
        let ack = Response {
            r#type: MSG_WATCH.to_owned(),
            id: req.id,
            success: true,
            error: None,
            payload: serde_json::Value::Null,
        };
        write_jsonl(&mut writer, &ack).await.unwrap();
        DaemonSide { watch, writer }
    }

    fn fixed(seq: u32, text: &str) -> Message {
        let mut m = Message::new("alice", "task", Body::Text(text.to_owned()));
        m.id = format!("20260209-080000-{seq:04}");
        m.time = rfc3339::parse("2026-02-09T08:00:00Z").unwrap();
        m
    }

    async fn collect(rx: &mut mpsc::Receiver<Message>, n: usize) -> Vec<String> {
        let mut out = Vec::new();
        for _ in 0..n {
            let msg = tokio::time::timeout(Duration::from_secs(3), rx.recv())
                .await
                .expect("message not delivered")
                .unwrap();
            out.push(msg.id);
        }
        out
    }

    fn opts(target: &str) -> WatchOptions {
        let mut o = WatchOptions::new(target, &WatchConfig::default());
        o.poll_min = Duration::from_millis(10);
        o.poll_max = Duration::from_millis(40);
        o.rediscover = Duration::from_secs(60);
        o.dial_timeout = Duration::from_millis(100);
        o
    }

    fn no_daemon(dir: &std::path::Path) -> Vec<Endpoint> {
        vec![Endpoint::Unix(dir.join("absent.sock"))]
    }

    #[test]
    fn state_machine_walks_every_transition() {
        use Outcome::*;
        use WatchState::*;

        assert_eq!(next_state(Discovering, Dialed), Connected);
        assert_eq!(next_state(Discovering, DialFailed), Polling);
        assert_eq!(next_state(Connected, StreamLost), Disconnected);
        assert_eq!(next_state(Disconnected, Reconnect), Discovering);
        assert_eq!(next_state(Polling, RediscoverDue), Discovering);
        assert_eq!(next_state(Polling, Dialed), Connected);
        assert_eq!(next_state(Polling, DialFailed), Polling);

        // Outcomes that do not apply leave the state alone.
        assert_eq!(next_state(Connected, DialFailed), Connected);
        assert_eq!(next_state(Disconnected, Dialed), Disconnected);
    }

    #[test]
    fn backoff_doubles_to_ceiling_and_resets() {
        let mut b = PollBackoff::new(Duration::from_millis(200), Duration::from_millis(1000));
        b.grow();
        assert_eq!(b.current(), Duration::from_millis(400));
        b.grow();
        b.grow();
        assert_eq!(b.current(), Duration::from_millis(1000));
        b.reset();
        assert_eq!(b.current(), Duration::from_millis(200));
    }

    #[test]
    fn seen_ids_are_bounded() {
        let mut s = SeenIds::new(2);
        assert!(s.insert("a"));
        assert!(!s.insert("a"));
        assert!(s.insert("b"));
        assert!(s.insert("c"));
        assert!(!s.contains("a"));
        assert!(s.contains("c"));
    }

    #[test]
    fn reading_someone_elses_dm_is_refused_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = opts("@bob");
        o.agent = Some("carol".to_owned());
        let err = match Watcher::new(o, no_daemon(dir.path()), MessageStore::open(dir.path())) {
            Ok(_) => panic!("watch should be refused"),
            Err(err) => err,
        };
        assert!(matches!(err, MailError::AccessDenied { .. }));
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn standalone_watch_replays_then_polls() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(dir.path());
        let first = store
            .save(Message::new("alice", "task", Body::Text("one".to_owned())))
            .unwrap();

        let mut o = opts("task");
        o.replay_all = true;
        o.max_messages = Some(2);
        o.timeout = Some(Duration::from_secs(5));
        let watcher = Watcher::new(o, no_daemon(dir.path()), MessageStore::open(dir.path())).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(watcher.run(tx));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.id, first.id);

        let second = store
            .save(Message::new("bob", "task", Body::Text("two".to_owned())))
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.id, second.id);

        assert_eq!(handle.await.unwrap().unwrap(), WatchEnd::Count);
    }

    #[tokio::test]
    async fn default_start_skips_backlog() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(dir.path());
        let mut old = Message::new("alice", "task", Body::Text("old".to_owned()));
        old.id = "20200101-000000-0001".to_owned();
        old.time = rfc3339::parse("2020-01-01T00:00:00Z").unwrap();
        store.save_exact(&old).unwrap();

        let mut o = opts("task");
        o.timeout = Some(Duration::from_millis(200));
        let watcher = Watcher::new(o, no_daemon(dir.path()), MessageStore::open(dir.path())).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(watcher.run(tx).await.unwrap(), WatchEnd::Deadline);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropping_receiver_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(dir.path());
        store
            .save(Message::new("alice", "task", Body::Text("x".to_owned())))
            .unwrap();

        let mut o = opts("task");
        o.replay_all = true;
        o.timeout = Some(Duration::from_secs(5));
        let watcher = Watcher::new(o, no_daemon(dir.path()), MessageStore::open(dir.path())).unwrap();

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert_eq!(watcher.run(tx).await.unwrap(), WatchEnd::Cancelled);
    }

    #[tokio::test]
    async fn polling_cursor_resumes_after_last_delivery() {
        let dir = tempfile::tempdir().unwrap();
        let store = MessageStore::open(dir.path());
        let mut ids = Vec::new();
        for i in 1..=3 {
            let mut m = Message::new("alice", "task", Body::Text(format!("m{i}")));
            m.id = format!("20260209-080000-000{i}");
            store.save_exact(&m).unwrap();
            ids.push(m.id);
        }

        let mut o = opts("task");
        o.since = Some(Cursor::Id(ids[0].clone()));
        o.max_messages = Some(2);
        o.timeout = Some(Duration::from_secs(5));
        let watcher = Watcher::new(o, no_daemon(dir.path()), MessageStore::open(dir.path())).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(watcher.run(tx).await.unwrap(), WatchEnd::Count);
        assert_eq!(rx.recv().await.unwrap().id, ids[1]);
        assert_eq!(rx.recv().await.unwrap().id, ids[2]);
    }

    #[tokio::test]
    async fn lost_stream_resumes_after_last_delivered_id() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("am.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let mut o = opts("task");
        o.replay_all = true;
        o.max_messages = Some(4);
        o.timeout = Some(Duration::from_secs(5));
        let watcher =
            Watcher::new(o, vec![Endpoint::Unix(sock)], MessageStore::open(dir.path())).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(watcher.run(tx));

        let mut first = accept_watch(&listener).await;
        assert_eq!(first.watch.since_id, None);
        first.push(&fixed(5, "m5")).await;
        first.push(&fixed(6, "m6")).await;
        assert_eq!(collect(&mut rx, 2).await, ["20260209-080000-0005", "20260209-080000-0006"]);
        drop(first);

        // The replacement stream repeats the boundary message; it must not
        // surface twice.
        let mut second = accept_watch(&listener).await;
        assert_eq!(second.watch.since_id.as_deref(), Some("20260209-080000-0006"));
        assert_eq!(second.watch.since_time, None);
        for seq in 6..=9 {
            second.push(&fixed(seq, "again")).await;
        }

        assert_eq!(collect(&mut rx, 2).await, ["20260209-080000-0007", "20260209-080000-0008"]);
        assert_eq!(handle.await.unwrap().unwrap(), WatchEnd::Count);
    }

    #[tokio::test]
    async fn backpressure_event_reconnects_from_last_id() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("am.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let mut o = opts("task");
        o.replay_all = true;
        o.max_messages = Some(2);
        o.timeout = Some(Duration::from_secs(5));
        let watcher =
            Watcher::new(o, vec![Endpoint::Unix(sock)], MessageStore::open(dir.path())).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(watcher.run(tx));

        let mut first = accept_watch(&listener).await;
        first.push(&fixed(1, "one")).await;
        first
            .push_error(ErrorInfo {
                code: "backpressure".to_owned(),
                message: "subscriber fell behind".to_owned(),
                retryable: true,
            })
            .await;

        let mut second = accept_watch(&listener).await;
        assert_eq!(second.watch.since_id.as_deref(), Some("20260209-080000-0001"));
        second.push(&fixed(2, "two")).await;

        assert_eq!(collect(&mut rx, 2).await, ["20260209-080000-0001", "20260209-080000-0002"]);
        assert_eq!(handle.await.unwrap().unwrap(), WatchEnd::Count);
        drop(first);
    }

    #[tokio::test]
    async fn silent_stream_is_dropped_and_redialed() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("am.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        let mut o = opts("task");
        o.replay_all = true;
        o.max_messages = Some(1);
        o.idle_timeout = Duration::from_millis(100);
        o.timeout = Some(Duration::from_secs(5));
        let watcher =
            Watcher::new(o, vec![Endpoint::Unix(sock)], MessageStore::open(dir.path())).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(watcher.run(tx));

        // Accepted and never written to again.
        let quiet = accept_watch(&listener).await;
        let mut second = accept_watch(&listener).await;
        second.push(&fixed(3, "three")).await;

        assert_eq!(collect(&mut rx, 1).await, ["20260209-080000-0003"]);
        assert_eq!(handle.await.unwrap().unwrap(), WatchEnd::Count);
        drop(quiet);
    }

    #[tokio::test]
    async fn polling_watch_switches_to_daemon_once_it_appears() {
        let dir = tempfile::tempdir().unwrap();
        let sock = dir.path().join("am.sock");
        let store = MessageStore::open(dir.path());
        let on_disk = store.save(fixed(1, "written without a daemon")).unwrap();

        let mut o = opts("task");
        o.replay_all = true;
        o.max_messages = Some(2);
        o.rediscover = Duration::from_millis(100);
        o.timeout = Some(Duration::from_secs(5));
        let watcher = Watcher::new(
            o,
            vec![Endpoint::Unix(sock.clone())],
            MessageStore::open(dir.path()),
        )
        .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = tokio::spawn(watcher.run(tx));

        assert_eq!(collect(&mut rx, 1).await, [on_disk.id.clone()]);

        let listener = UnixListener::bind(&sock).unwrap();
        let mut live = accept_watch(&listener).await;
        assert_eq!(live.watch.since_id.as_deref(), Some(on_disk.id.as_str()));
        // Only the stream knows about this one.
        live.push(&fixed(2, "live")).await;

        assert_eq!(collect(&mut rx, 1).await, ["20260209-080000-0002"]);
        assert_eq!(handle.await.unwrap().unwrap(), WatchEnd::Count);
    }

    #[tokio::test]
    async fn polling_watch_records_agent_presence() {
        let dir = tempfile::tempdir().unwrap();
        let mut o = opts("task");
        o.agent = Some("carol".to_owned());
        o.host = "build-7".to_owned();
        o.timeout = Some(Duration::from_millis(150));
        let watcher = Watcher::new(o, no_daemon(dir.path()), MessageStore::open(dir.path())).unwrap();

        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(watcher.run(tx).await.unwrap(), WatchEnd::Deadline);

        let record = AgentRegistry::new(dir.path()).get("carol").unwrap().unwrap();
        assert_eq!(record.host, "build-7");
    }
}
