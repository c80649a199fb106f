use agentmail_core::config::ConfigFile;
use agentmail_core::paths::MailPaths;
use anyhow::{Context as _, Result};

/// Reads `config.toml`; a missing file yields defaults.
pub async fn load(paths: &MailPaths) -> Result<ConfigFile> {
    let path = &paths.config_file;
    match tokio::fs::read_to_string(path).await {
        Ok(s) => {
            let cfg: ConfigFile = toml::from_str(&s)
                .with_context(|| format!("parse config: {}", path.display()))?;
            cfg.validate()
                .with_context(|| format!("validate config: {}", path.display()))?;
            Ok(cfg)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(err) => Err(err).with_context(|| format!("read config: {}", path.display())),
    }
}
