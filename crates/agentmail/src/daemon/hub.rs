use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use agentmail_core::cursor::Cursor;
use agentmail_core::message::{Mailbox, Message};
use agentmail_core::store::{MessageStore, WriteOutcome};
use agentmail_core::target::TargetFilter;
use agentmail_core::MailError;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Live broker for one project: persists through the store and fans out to
/// subscribers without waiting on any of them.
pub(crate) struct Hub {
    project_id: String,
    store: MessageStore,
    channel_capacity: usize,
    inner: Mutex<HubInner>,
}

struct HubInner {
    next_subscriber_id: u64,
    subscribers: BTreeMap<u64, Subscriber>,
    window: ReplayWindow,
}

struct Subscriber {
    filter: TargetFilter,
    tx: mpsc::Sender<Message>,
    lagged: Arc<AtomicBool>,
}

impl Hub {
    pub(crate) fn new(
        project_id: impl Into<String>,
        store: MessageStore,
        replay_window: usize,
        channel_capacity: usize,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            store,
            channel_capacity: channel_capacity.max(1),
            inner: Mutex::new(HubInner {
                next_subscriber_id: 1,
                subscribers: BTreeMap::new(),
                window: ReplayWindow::new(replay_window),
            }),
        }
    }

    pub(crate) fn project_id(&self) -> &str {
        &self.project_id
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &MessageStore {
        &self.store
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Saves a new message (assigning its id) and delivers it live.
    pub(crate) fn publish(&self, msg: Message) -> Result<Message, MailError> {
        let mut inner = self.lock();
        let saved = self.store.save(msg)?;
        inner.deliver(&saved);
        Ok(saved)
    }

    /// Writes a message under its existing id. Only a first-time write is
    /// delivered live, so a message bounced back by a peer goes nowhere.
    pub(crate) fn apply_exact(&self, msg: Message) -> Result<WriteOutcome, MailError> {
        let mut inner = self.lock();
        let outcome = self.store.save_exact(&msg)?;
        if outcome == WriteOutcome::Created {
            inner.deliver(&msg);
        }
        Ok(outcome)
    }

    /// Registers a live subscription, then loads the backlog past `since`.
    /// `None` replays everything the filter covers.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        filter: TargetFilter,
        since: Option<Cursor>,
    ) -> Result<Subscription, MailError> {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let lagged = Arc::new(AtomicBool::new(false));

        let id = {
            let mut inner = self.lock();
            let id = inner.next_subscriber_id;
            inner.next_subscriber_id += 1;
            inner.subscribers.insert(
                id,
                Subscriber {
                    filter: filter.clone(),
                    tx,
                    lagged: lagged.clone(),
                },
            );
            id
        };

        // Dropped on error, which unregisters.
        let mut sub = Subscription {
            id,
            hub: self.clone(),
            backlog: VecDeque::new(),
            replayed: HashSet::new(),
            rx,
            lagged,
        };

        let backlog = self.backlog(&filter, since.as_ref())?;
        sub.replayed = backlog.iter().map(|m| m.id.clone()).collect();
        sub.backlog = backlog.into();

        tracing::debug!(
            subscriber = id,
            filter = ?filter,
            backlog = sub.backlog.len(),
            "subscriber registered"
        );
        Ok(sub)
    }

    fn unsubscribe(&self, id: u64) {
        if self.lock().subscribers.remove(&id).is_some() {
            tracing::debug!(subscriber = id, "subscriber removed");
        }
    }

    fn backlog(
        &self,
        filter: &TargetFilter,
        since: Option<&Cursor>,
    ) -> Result<Vec<Message>, MailError> {
        let mut wanted: Vec<(Mailbox, String)> = Vec::new();
        for mailbox in filter.mailboxes(&self.store)? {
            for id in self.store.list_ids(&mailbox)? {
                if since.is_some_and(|c| !c.may_admit(&id)) {
                    continue;
                }
                wanted.push((mailbox.clone(), id));
            }
        }

        let cached: HashMap<String, Message> = {
            let inner = self.lock();
            wanted
                .iter()
                .filter_map(|(mailbox, id)| inner.window.get(mailbox, id).cloned())
                .map(|m| (m.id.clone(), m))
                .collect()
        };

        let mut out = Vec::with_capacity(wanted.len());
        for (mailbox, id) in wanted {
            let msg = match cached.get(&id) {
                Some(msg) => msg.clone(),
                None => match self.store.load(&mailbox, &id) {
                    Ok(msg) => msg,
                    Err(err) => {
                        tracing::warn!(id = %id, mailbox = %mailbox, error = %err, "skipping unreadable message");
                        continue;
                    }
                },
            };
            if since.is_some_and(|c| !c.admits(&msg)) {
                continue;
            }
            out.push(msg);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HubInner {
    fn deliver(&mut self, msg: &Message) {
        let Ok(mailbox) = msg.mailbox() else {
            return;
        };
        self.window.push(msg);

        let mut dropped = Vec::new();
        for (id, sub) in &self.subscribers {
            if !sub.filter.matches(&mailbox) {
                continue;
            }
            match sub.tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(subscriber = id, id = %msg.id, "subscriber queue full; dropping subscriber");
                    sub.lagged.store(true, Ordering::Release);
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = id, "subscriber channel closed");
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            self.subscribers.remove(&id);
        }
    }
}

/// A live feed: backlog first, then messages published after registration.
/// Dropping it unregisters from the hub.
pub(crate) struct Subscription {
    id: u64,
    hub: Arc<Hub>,
    backlog: VecDeque<Message>,
    replayed: HashSet<String>,
    rx: mpsc::Receiver<Message>,
    lagged: Arc<AtomicBool>,
}

impl Subscription {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// `Ok(None)` when the hub ended the feed cleanly; `Err(Backpressure)`
    /// when this subscriber fell behind and was cut off.
    pub(crate) async fn next(&mut self) -> Result<Option<Message>, MailError> {
        if let Some(msg) = self.backlog.pop_front() {
            return Ok(Some(msg));
        }
        loop {
            match self.rx.recv().await {
                Some(msg) if self.replayed.remove(&msg.id) => continue,
                Some(msg) => return Ok(Some(msg)),
                None if self.lagged.load(Ordering::Acquire) => return Err(MailError::Backpressure),
                None => return Ok(None),
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

/// Recently delivered messages, served to new subscribers before touching disk.
struct ReplayWindow {
    capacity: usize,
    order: VecDeque<(Mailbox, String)>,
    messages: HashMap<(Mailbox, String), Message>,
}

impl ReplayWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            messages: HashMap::with_capacity(capacity),
        }
    }

    fn push(&mut self, msg: &Message) {
        if self.capacity == 0 {
            return;
        }
        let Ok(mailbox) = msg.mailbox() else {
            return;
        };
        let key = (mailbox, msg.id.clone());
        if self.messages.contains_key(&key) {
            return;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.messages.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.messages.insert(key, msg.clone());
    }

    fn get(&self, mailbox: &Mailbox, id: &str) -> Option<&Message> {
        self.messages.get(&(mailbox.clone(), id.to_owned()))
    }
}
