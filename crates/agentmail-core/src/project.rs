use std::fs;
use std::io::{self, Write as _};
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::MailError;
use crate::message::rfc3339;

/// Identity of one mailbox root, written once to `project.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub id: String,
    #[serde(with = "rfc3339")]
    pub created: OffsetDateTime,
}

#[derive(Debug, Default, Deserialize)]
struct RawProjectFile {
    #[serde(default)]
    id: String,
    #[serde(default)]
    created: Option<String>,
}

impl ProjectState {
    /// Reads `project.json` under `root`, creating it with `derived_id` on
    /// first use. An existing id always wins over `derived_id`. A file with a
    /// missing id or timestamp is repaired, keeping whatever it did record.
    pub fn load_or_init(root: &Path, derived_id: &str) -> Result<Self, MailError> {
        let path = root.join("project.json");
        match fs::read(&path) {
            Ok(data) => {
                let raw: RawProjectFile = serde_json::from_slice(&data).unwrap_or_default();
                let created = raw.created.as_deref().and_then(|s| rfc3339::parse(s).ok());
                match (raw.id.trim().is_empty(), created) {
                    (false, Some(created)) => Ok(Self {
                        id: raw.id,
                        created,
                    }),
                    (id_missing, created) => {
                        let state = Self {
                            id: if id_missing {
                                derived_id.to_owned()
                            } else {
                                raw.id
                            },
                            created: created.unwrap_or_else(OffsetDateTime::now_utc),
                        };
                        state.rewrite(root)?;
                        Ok(state)
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                let state = Self {
                    id: derived_id.to_owned(),
                    created: OffsetDateTime::now_utc(),
                };
                match state.create(root) {
                    Ok(()) => Ok(state),
                    // Lost a race with another initializer; theirs stands.
                    Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                        Self::load_or_init(root, derived_id)
                    }
                    Err(err) => Err(MailError::io(format!("create {}", path.display()), err)),
                }
            }
            Err(err) => Err(MailError::io(format!("read {}", path.display()), err)),
        }
    }

    fn encode(&self) -> Result<Vec<u8>, MailError> {
        serde_json::to_vec_pretty(self).map_err(|err| MailError::json("serialize project.json", err))
    }

    fn create(&self, root: &Path) -> io::Result<()> {
        fs::create_dir_all(root)?;
        let data = self.encode().map_err(io::Error::other)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(root.join("project.json"))?;
        file.write_all(&data)
    }

    fn rewrite(&self, root: &Path) -> Result<(), MailError> {
        let path = root.join("project.json");
        let tmp = root.join(format!(".project.json.{}.tmp", std::process::id()));
        fs::write(&tmp, self.encode()?)
            .map_err(|err| MailError::io(format!("write {}", tmp.display()), err))?;
        fs::rename(&tmp, &path).map_err(|err| {
            MailError::io(format!("rename {} -> {}", tmp.display(), path.display()), err)
        })
    }
}
