//! Config file loading.

use cilantro_types::config::{default_home_dir, NodeConfig};
use cilantro_wire::NodeKeys;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Overrides `signing_key` from the config file.
pub const SIGNING_KEY_ENV: &str = "CILANTRO_SIGNING_KEY";

pub fn default_config_path() -> PathBuf {
    default_home_dir().join("config.toml")
}

/// A loaded configuration and, when the file was unusable, why defaults were
/// used instead. Loading happens before tracing is set up, so the caller
/// logs the warning.
pub struct LoadedConfig {
    pub config: NodeConfig,
    pub path: PathBuf,
    pub warning: Option<String>,
}

/// Load the node config. A missing file yields defaults silently; an
/// unreadable or invalid one yields defaults with a warning.
pub fn load_config(path: Option<&Path>) -> LoadedConfig {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    let (mut config, warning) = if !path.exists() {
        (NodeConfig::default(), None)
    } else {
        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<NodeConfig>(&contents) {
                Ok(config) => (config, None),
                Err(e) => (
                    NodeConfig::default(),
                    Some(format!("Failed to parse config, using defaults: {e}")),
                ),
            },
            Err(e) => (
                NodeConfig::default(),
                Some(format!("Failed to read config file, using defaults: {e}")),
            ),
        }
    };

    let env_key = std::env::var(SIGNING_KEY_ENV).ok().map(Zeroizing::new);
    apply_signing_override(&mut config, env_key.as_deref().map(String::as_str));

    LoadedConfig {
        config,
        path,
        warning,
    }
}

fn apply_signing_override(config: &mut NodeConfig, key: Option<&str>) {
    if let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) {
        config.signing_key = Some(key.to_string());
    }
}

/// The node identity from config, if one is configured.
pub fn node_keys(config: &NodeConfig) -> Result<Option<NodeKeys>, String> {
    config
        .signing_key
        .as_deref()
        .map(NodeKeys::from_seed_hex)
        .transpose()
        .map_err(|e| format!("Invalid signing key: {e}"))
}

/// The node identity, or an error telling the user how to create one.
pub fn require_node_keys(config: &NodeConfig) -> Result<NodeKeys, String> {
    node_keys(config)?.ok_or_else(|| {
        format!(
            "No signing key configured. Run `cilantro keys generate` and set \
             signing_key in the config file or {SIGNING_KEY_ENV}."
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_config(Some(&dir.path().join("absent.toml")));
        assert!(loaded.warning.is_none());
        assert_eq!(loaded.config.name, NodeConfig::default().name);
    }

    #[test]
    fn test_invalid_file_warns() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "role = 42").unwrap();
        let loaded = load_config(Some(&path));
        assert!(loaded.warning.unwrap().contains("parse"));
        assert_eq!(loaded.config.host_ip, "127.0.0.1");
    }

    #[test]
    fn test_valid_file_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "name = \"witness-1\"\nrole = \"witness\"\n[[sockets]]\nname = \"in\"\nport = 9100\n",
        )
        .unwrap();
        let loaded = load_config(Some(&path));
        assert!(loaded.warning.is_none());
        assert_eq!(loaded.config.name, "witness-1");
        assert_eq!(loaded.config.sockets[0].port, 9100);
    }

    #[test]
    fn test_signing_override() {
        let mut config = NodeConfig {
            signing_key: Some("aa".into()),
            ..NodeConfig::default()
        };
        apply_signing_override(&mut config, Some("  "));
        assert_eq!(config.signing_key.as_deref(), Some("aa"));
        apply_signing_override(&mut config, Some("bb"));
        assert_eq!(config.signing_key.as_deref(), Some("bb"));
    }

    #[test]
    fn test_node_keys_from_config() {
        let keys = NodeKeys::generate();
        let config = NodeConfig {
            signing_key: Some(keys.seed_hex().to_string()),
            ..NodeConfig::default()
        };
        let loaded = require_node_keys(&config).unwrap();
        assert_eq!(loaded.verifying_key_hex(), keys.verifying_key_hex());

        assert!(require_node_keys(&NodeConfig::default()).is_err());
        let bad = NodeConfig {
            signing_key: Some("zz".into()),
            ..NodeConfig::default()
        };
        assert!(node_keys(&bad).is_err());
    }
}
