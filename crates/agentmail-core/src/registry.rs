use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::MailError;
use crate::message::{rfc3339, validate_name};
use crate::paths::safe_join;

/// Presence record stored at `agents/<name>.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(with = "rfc3339")]
    pub first_seen: OffsetDateTime,
    #[serde(with = "rfc3339")]
    pub last_seen: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl AgentRecord {
    /// Offline is inferred from heartbeat age; the registry never marks it.
    pub fn is_online(&self, now: OffsetDateTime, threshold: Duration) -> bool {
        let age_ms = (now - self.last_seen).whole_milliseconds();
        age_ms <= threshold.as_millis() as i128
    }
}

#[derive(Debug, Clone)]
pub struct AgentRegistry {
    dir: PathBuf,
}

impl AgentRegistry {
    pub fn new(root: &Path) -> Self {
        Self {
            dir: root.join("agents"),
        }
    }

    pub fn ensure(&self, name: &str, host: &str) -> Result<AgentRecord, MailError> {
        let now = OffsetDateTime::now_utc();
        let record = match self.get(name)? {
            Some(mut existing) => {
                if !host.trim().is_empty() {
                    existing.host = host.trim().to_owned();
                }
                existing.last_seen = now;
                existing
            }
            None => AgentRecord {
                name: name.to_owned(),
                host: host.trim().to_owned(),
                first_seen: now,
                last_seen: now,
                status: None,
            },
        };
        self.write(&record)?;
        Ok(record)
    }

    /// Bumps `last_seen`. Unknown agents are `NotFound`; register them with
    /// `ensure` first.
    pub fn touch(&self, name: &str) -> Result<AgentRecord, MailError> {
        let mut record = self.get(name)?.ok_or_else(|| MailError::NotFound {
            mailbox: format!("agent {name}"),
        })?;
        record.last_seen = OffsetDateTime::now_utc();
        self.write(&record)?;
        Ok(record)
    }

    pub fn set_status(&self, name: &str, status: Option<String>) -> Result<AgentRecord, MailError> {
        let mut record = self.get(name)?.ok_or_else(|| MailError::NotFound {
            mailbox: format!("agent {name}"),
        })?;
        record.status = status.map(|s| s.trim().to_owned()).filter(|s| !s.is_empty());
        record.last_seen = OffsetDateTime::now_utc();
        self.write(&record)?;
        Ok(record)
    }

    pub fn get(&self, name: &str) -> Result<Option<AgentRecord>, MailError> {
        let path = self.record_path(name)?;
        let data = match fs::read(&path) {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(MailError::io(format!("read {}", path.display()), err)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|err| MailError::json(format!("parse {}", path.display()), err))
    }

    /// All records sorted by name. Unreadable records are skipped.
    pub fn list(&self) -> Result<Vec<AgentRecord>, MailError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(MailError::io(format!("read {}", self.dir.display()), err)),
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| MailError::io(format!("read {}", self.dir.display()), err))?;
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(Some(record)) = self.get(name) {
                out.push(record);
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn record_path(&self, name: &str) -> Result<PathBuf, MailError> {
        validate_name(name).map_err(|reason| MailError::InvalidAddress {
            address: name.to_owned(),
            reason,
        })?;
        safe_join(&self.dir, &format!("{name}.json")).map_err(|_| MailError::InvalidAddress {
            address: name.to_owned(),
            reason: "not a plain file name",
        })
    }

    fn write(&self, record: &AgentRecord) -> Result<(), MailError> {
        let path = self.record_path(&record.name)?;
        fs::create_dir_all(&self.dir)
            .map_err(|err| MailError::io(format!("create {}", self.dir.display()), err))?;

        let data = serde_json::to_vec_pretty(record)
            .map_err(|err| MailError::json(format!("serialize agent {}", record.name), err))?;

        let tmp = path.with_extension(format!("json.{}.tmp", std::process::id()));
        fs::write(&tmp, &data).map_err(|err| MailError::io(format!("write {}", tmp.display()), err))?;
        fs::rename(&tmp, &path).map_err(|err| {
            MailError::io(format!("rename {} -> {}", tmp.display(), path.display()), err)
        })
    }
}
