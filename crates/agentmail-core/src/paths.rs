use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathInputs {
    pub home_dir: PathBuf,
    pub xdg_config_home: Option<PathBuf>,
    pub base_dir_override: Option<PathBuf>,
    pub socket_path_override: Option<PathBuf>,
    pub mail_dir_override: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailPaths {
    pub base_dir: PathBuf,

    pub socket_path: PathBuf,
    pub log_path: PathBuf,
    pub runtime_dir: PathBuf,

    /// Root of the on-disk mailbox (topics, dm, agents, project.json).
    pub mail_dir: PathBuf,

    pub config_dir: PathBuf,
    pub config_file: PathBuf,
}

pub fn compute_paths(inputs: PathInputs) -> MailPaths {
    let base_dir = inputs
        .base_dir_override
        .clone()
        .unwrap_or_else(|| inputs.home_dir.join(".agentmail"));

    let config_dir = match inputs.base_dir_override {
        Some(ref override_dir) => override_dir.join("config"),
        None => inputs
            .xdg_config_home
            .unwrap_or_else(|| inputs.home_dir.join(".config"))
            .join("agentmail"),
    };

    let socket_path = inputs
        .socket_path_override
        .unwrap_or_else(|| base_dir.join("agentmail.sock"));

    let mail_dir = inputs
        .mail_dir_override
        .unwrap_or_else(|| base_dir.join("mail"));

    MailPaths {
        socket_path,
        log_path: base_dir.join("agentmail.log"),
        runtime_dir: base_dir.join("runtime"),
        mail_dir,
        config_file: config_dir.join("config.toml"),
        config_dir,
        base_dir,
    }
}

#[derive(Debug, Error)]
pub enum SafeJoinError {
    #[error("path segment is empty")]
    Empty,
    #[error("path segment is not a normal component: {segment:?}")]
    NotNormal { segment: String },
}

pub fn safe_join(base: &Path, segment: &str) -> Result<PathBuf, SafeJoinError> {
    let segment = segment.trim();
    if segment.is_empty() {
        return Err(SafeJoinError::Empty);
    }

    let segment_path = Path::new(segment);
    if segment_path.is_absolute() {
        return Err(SafeJoinError::NotNormal {
            segment: segment.to_owned(),
        });
    }

    let mut components = segment_path.components();
    match (components.next(), components.next()) {
        (Some(std::path::Component::Normal(_)), None) => Ok(base.join(segment)),
        _ => Err(SafeJoinError::NotNormal {
            segment: segment.to_owned(),
        }),
    }
}
