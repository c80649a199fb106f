//! File-backed mailbox storage.
//!
//! Layout under the mailbox root:
//!
//! ```text
//! topics/<topic>/<id>.json
//! dm/<agent>/<id>.json
//! ```
//!
//! Every message is its own file. New files are staged under a hidden name
//! and hard-linked into place, so a message either appears complete or not at
//! all, and two writers racing on the same id cannot both win.

use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use time::OffsetDateTime;

use crate::cursor::Cursor;
use crate::error::MailError;
use crate::message::{id_time, is_valid_id, validate_name, IdGenerator, Mailbox, Message};

pub const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024;

const TOPICS_DIR: &str = "topics";
const DM_DIR: &str = "dm";
const MAX_ID_ATTEMPTS: usize = 64;

#[cfg(unix)]
const DM_DIR_MODE: u32 = 0o700;
#[cfg(unix)]
const DM_FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const TOPIC_DIR_MODE: u32 = 0o755;
#[cfg(unix)]
const TOPIC_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    AlreadyPresent,
}

#[derive(Debug)]
pub struct MessageStore {
    root: PathBuf,
    max_body_bytes: usize,
    ids: Mutex<IdGenerator>,
}

impl MessageStore {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            ids: Mutex::new(IdGenerator::default()),
        }
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Pins the per-second sequence offset. Stores sharing a directory
    /// already retry past each other's ids; stores that only meet through
    /// relay rely on distinct offsets.
    pub fn with_id_start(self, start: u32) -> Self {
        *self.ids.lock().unwrap_or_else(PoisonError::into_inner) = IdGenerator::with_start(start);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mailbox_dir(&self, mailbox: &Mailbox) -> PathBuf {
        match mailbox {
            Mailbox::Topic(name) => self.root.join(TOPICS_DIR).join(name),
            Mailbox::Dm(name) => self.root.join(DM_DIR).join(name),
        }
    }

    pub fn message_path(&self, mailbox: &Mailbox, id: &str) -> PathBuf {
        self.mailbox_dir(mailbox).join(format!("{id}.json"))
    }

    /// Persists `msg`, assigning a fresh id when it has none.
    ///
    /// A message that already carries an id is written with `save_exact`
    /// semantics.
    pub fn save(&self, mut msg: Message) -> Result<Message, MailError> {
        let mailbox = self.validate(&msg)?;

        if !msg.id.is_empty() {
            self.save_exact(&msg)?;
            return Ok(msg);
        }

        for _ in 0..MAX_ID_ATTEMPTS {
            let now = OffsetDateTime::now_utc();
            msg.id = self
                .ids
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .next(now);
            msg.time = now;

            let data = encode(&msg)?;
            if self.write_new(&mailbox, &msg.id, &data)? {
                return Ok(msg);
            }
            // Another process took this id in the same second.
        }

        Err(MailError::io(
            format!("allocate message id in {mailbox}"),
            io::Error::new(io::ErrorKind::AlreadyExists, "id space exhausted"),
        ))
    }

    /// Writes `msg` under its own id. Re-writing identical content is a no-op.
    pub fn save_exact(&self, msg: &Message) -> Result<WriteOutcome, MailError> {
        let mailbox = self.validate(msg)?;
        if !is_valid_id(&msg.id) {
            return Err(MailError::InvalidId { id: msg.id.clone() });
        }

        let data = encode(msg)?;
        if self.write_new(&mailbox, &msg.id, &data)? {
            return Ok(WriteOutcome::Created);
        }

        let existing = self.load(&mailbox, &msg.id)?;
        if existing == *msg {
            Ok(WriteOutcome::AlreadyPresent)
        } else {
            Err(MailError::Conflict { id: msg.id.clone() })
        }
    }

    pub fn list_topic(&self, name: &str) -> Result<Vec<Message>, MailError> {
        self.list(&Mailbox::Topic(name.to_owned()))
    }

    pub fn list_dm(&self, agent: &str) -> Result<Vec<Message>, MailError> {
        self.list(&Mailbox::Dm(agent.to_owned()))
    }

    /// All messages in a mailbox, oldest first. Fails with `NotFound` when the
    /// mailbox was never written to.
    pub fn list(&self, mailbox: &Mailbox) -> Result<Vec<Message>, MailError> {
        let dir = self.mailbox_dir(mailbox);
        if !dir.is_dir() {
            return Err(MailError::NotFound {
                mailbox: mailbox.to_string(),
            });
        }
        self.list_since(mailbox, None)
    }

    /// Messages past `cursor`, oldest first. A missing mailbox is empty.
    ///
    /// Files that fail to parse are skipped so one bad message cannot hide
    /// the rest of the mailbox.
    pub fn list_since(
        &self,
        mailbox: &Mailbox,
        cursor: Option<&Cursor>,
    ) -> Result<Vec<Message>, MailError> {
        let mut out = Vec::new();
        for id in self.list_ids(mailbox)? {
            if cursor.is_some_and(|c| !c.may_admit(&id)) {
                continue;
            }
            let Ok(msg) = self.load(mailbox, &id) else {
                continue;
            };
            if cursor.is_some_and(|c| !c.admits(&msg)) {
                continue;
            }
            out.push(msg);
        }
        Ok(out)
    }

    /// Sorted ids present in a mailbox.
    pub fn list_ids(&self, mailbox: &Mailbox) -> Result<Vec<String>, MailError> {
        let dir = self.mailbox_dir(mailbox);
        let entries = match fs::read_dir(&dir) {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(MailError::io(format!("read {}", dir.display()), err)),
        };

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| MailError::io(format!("read {}", dir.display()), err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_suffix(".json") else {
                continue;
            };
            if is_valid_id(id) {
                ids.push(id.to_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn load(&self, mailbox: &Mailbox, id: &str) -> Result<Message, MailError> {
        if !is_valid_id(id) {
            return Err(MailError::InvalidId { id: id.to_owned() });
        }
        let path = self.message_path(mailbox, id);
        let data = fs::read(&path).map_err(|err| MailError::io(format!("read {}", path.display()), err))?;
        serde_json::from_slice(&data)
            .map_err(|err| MailError::json(format!("parse {}", path.display()), err))
    }

    pub fn list_topics(&self) -> Result<Vec<String>, MailError> {
        list_subdirs(&self.root.join(TOPICS_DIR))
    }

    pub fn list_dm_mailboxes(&self) -> Result<Vec<String>, MailError> {
        list_subdirs(&self.root.join(DM_DIR))
    }

    /// Every existing mailbox, topics first.
    pub fn mailboxes(&self) -> Result<Vec<Mailbox>, MailError> {
        let mut out = self
            .list_topics()?
            .into_iter()
            .map(Mailbox::Topic)
            .collect::<Vec<_>>();
        out.extend(self.list_dm_mailboxes()?.into_iter().map(Mailbox::Dm));
        Ok(out)
    }

    /// Removes (or with `dry_run`, only reports) every message created before
    /// `cutoff`. Returns the affected paths, sorted.
    pub fn gc(&self, cutoff: OffsetDateTime, dry_run: bool) -> Result<Vec<PathBuf>, MailError> {
        let mut affected = Vec::new();
        for mailbox in self.mailboxes()? {
            for id in self.list_ids(&mailbox)? {
                let created = match self.load(&mailbox, &id) {
                    Ok(msg) => Some(msg.time),
                    Err(_) => id_time(&id),
                };
                let Some(created) = created else { continue };
                if created >= cutoff {
                    continue;
                }

                let path = self.message_path(&mailbox, &id);
                if !dry_run {
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                        Err(err) => {
                            return Err(MailError::io(format!("remove {}", path.display()), err))
                        }
                    }
                }
                affected.push(path);
            }
        }
        affected.sort();
        Ok(affected)
    }

    fn validate(&self, msg: &Message) -> Result<Mailbox, MailError> {
        validate_name(&msg.from).map_err(|reason| MailError::InvalidAddress {
            address: msg.from.clone(),
            reason,
        })?;
        let mailbox = msg.mailbox()?;

        let size = msg.body.encoded_len();
        if size > self.max_body_bytes {
            return Err(MailError::SizeLimitExceeded {
                size,
                limit: self.max_body_bytes,
            });
        }
        Ok(mailbox)
    }

    /// Returns `false` when `<id>.json` already exists.
    fn write_new(&self, mailbox: &Mailbox, id: &str, data: &[u8]) -> Result<bool, MailError> {
        let dir = self.ensure_mailbox_dir(mailbox)?;
        let dest = dir.join(format!("{id}.json"));
        let staging = dir.join(staging_name(id));

        write_staging(&staging, data, mailbox.is_dm())
            .map_err(|err| MailError::io(format!("write {}", staging.display()), err))?;

        let linked = fs::hard_link(&staging, &dest);
        let _ = fs::remove_file(&staging);
        match linked {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(MailError::io(format!("link {}", dest.display()), err)),
        }
    }

    fn ensure_mailbox_dir(&self, mailbox: &Mailbox) -> Result<PathBuf, MailError> {
        let (parent, dm) = match mailbox {
            Mailbox::Topic(_) => (self.root.join(TOPICS_DIR), false),
            Mailbox::Dm(_) => (self.root.join(DM_DIR), true),
        };
        let dir = self.mailbox_dir(mailbox);
        fs::create_dir_all(&self.root)
            .map_err(|err| MailError::io(format!("create {}", self.root.display()), err))?;
        ensure_dir(&parent, dm)
            .and_then(|()| ensure_dir(&dir, dm))
            .map_err(|err| MailError::io(format!("create {}", dir.display()), err))?;
        Ok(dir)
    }
}

fn encode(msg: &Message) -> Result<Vec<u8>, MailError> {
    let mut data = serde_json::to_vec_pretty(msg)
        .map_err(|err| MailError::json(format!("serialize message {}", msg.id), err))?;
    data.push(b'\n');
    Ok(data)
}

fn staging_name(id: &str) -> String {
    let nonce = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!(".{id}.{}.{nonce}.tmp", std::process::id())
}

fn list_subdirs(dir: &Path) -> Result<Vec<String>, MailError> {
    let entries = match fs::read_dir(dir) {
        Ok(v) => v,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(MailError::io(format!("read {}", dir.display()), err)),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| MailError::io(format!("read {}", dir.display()), err))?;
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if validate_name(name).is_ok() {
                names.push(name.to_owned());
            }
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(unix)]
fn ensure_dir(dir: &Path, dm: bool) -> io::Result<()> {
    use std::os::unix::fs::{DirBuilderExt as _, PermissionsExt as _};

    let mode = if dm { DM_DIR_MODE } else { TOPIC_DIR_MODE };
    match fs::DirBuilder::new().recursive(true).mode(mode).create(dir) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {}
        Err(err) => return Err(err),
    }

    // umask or an earlier writer may have left a different mode behind.
    let current = fs::metadata(dir)?.permissions().mode() & 0o777;
    if current != mode {
        fs::set_permissions(dir, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_dir(dir: &Path, _dm: bool) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn write_staging(path: &Path, data: &[u8], dm: bool) -> io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _};

    let mode = if dm { DM_FILE_MODE } else { TOPIC_FILE_MODE };
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(mode))?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_staging(path: &Path, data: &[u8], _dm: bool) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
