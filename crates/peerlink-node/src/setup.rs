//! Config loading and persistent peer identity.

use std::path::{Path, PathBuf};

use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::NodeError;

/// Load configuration from the given path, or the default location.
pub fn load_config(path: Option<&str>) -> Result<Config, NodeError> {
    let config_path = match path {
        Some(p) => PathBuf::from(p),
        None => default_config_path(),
    };

    if config_path.exists() {
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| NodeError::Config(format!("failed to read config: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| NodeError::Config(format!("failed to parse config: {e}")))?;
        info!(path = %config_path.display(), "loaded config");
        Ok(config)
    } else {
        info!("no config file found, using defaults");
        Ok(Config::default())
    }
}

/// Load or create the persistent peer id.
pub fn load_or_create_peer_id(config_dir: &Path) -> Result<String, NodeError> {
    let id_path = config_dir.join("peer-id");

    if id_path.exists() {
        let content = std::fs::read_to_string(&id_path)
            .map_err(|e| NodeError::Config(format!("failed to read peer-id: {e}")))?;
        let id = content.trim();
        if id.is_empty() {
            return Err(NodeError::Config(format!(
                "{} is empty",
                id_path.display()
            )));
        }
        info!(id, "loaded peer id");
        Ok(id.to_string())
    } else {
        std::fs::create_dir_all(config_dir)
            .map_err(|e| NodeError::Config(format!("failed to create config dir: {e}")))?;

        let id = Uuid::new_v4().to_string();
        std::fs::write(&id_path, &id)
            .map_err(|e| NodeError::Config(format!("failed to write peer-id: {e}")))?;

        info!(id = %id, "created new peer id");
        Ok(id)
    }
}

/// Get the default config directory path.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("peerlink")
}

fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("peerlink-{name}-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn peer_id_is_created_once_and_reloaded() {
        let dir = scratch_dir("id");
        let first = load_or_create_peer_id(&dir).unwrap();
        let second = load_or_create_peer_id(&dir).unwrap();
        assert_eq!(first, second);
        assert!(Uuid::parse_str(&first).is_ok());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_config_file_gives_defaults() {
        let dir = scratch_dir("cfg");
        let path = dir.join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.connection.max_connection_attempts, 3);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = scratch_dir("bad");
        let path = dir.join("config.toml");
        std::fs::write(&path, "[connection]\nmax_connection_attempts = \"lots\"\n").unwrap();
        let result = load_config(path.to_str());
        assert!(matches!(result, Err(NodeError::Config(_))));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
