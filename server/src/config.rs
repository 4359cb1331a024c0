use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server page size when the client does not ask for fewer documents.
pub const DEFAULT_BATCH_SIZE: usize = 101;

/// Largest document the server accepts and advertises.
pub const DEFAULT_MAX_BSON_SIZE: i32 = 16 * 1024 * 1024;

/// Account created in `<db>.system.users` at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub db: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub unix_socket: Option<PathBuf>,
    /// Replica set name reported by `ismaster`.
    pub set_name: Option<String>,
    /// Members reported by `ismaster`, as `host:port`.
    pub hosts: Vec<String>,
    pub primary: bool,
    pub batch_size: usize,
    pub max_bson_size: i32,
    pub max_connections: usize,
    pub users: Vec<UserConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 27017,
            unix_socket: None,
            set_name: None,
            hosts: Vec::new(),
            primary: true,
            batch_size: DEFAULT_BATCH_SIZE,
            max_bson_size: DEFAULT_MAX_BSON_SIZE,
            max_connections: 256,
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Loads a JSON config file; missing fields keep their defaults.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 4000, "set_name": "rs0", "hosts": ["a:1"]}"#).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.set_name.as_deref(), Some("rs0"));
        assert_eq!(config.hosts, vec!["a:1".to_string()]);
        assert!(config.primary);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.address(), "127.0.0.1:4000");
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docwired.json");
        std::fs::write(
            &path,
            r#"{"primary": false, "users": [{"db": "admin", "user": "root", "password": "pw"}]}"#,
        )
        .unwrap();
        let config = ServerConfig::load_from_path(&path).unwrap();
        assert!(!config.primary);
        assert_eq!(config.users[0].user, "root");

        assert!(ServerConfig::load_from_path(dir.path().join("missing.json")).is_err());
    }
}
