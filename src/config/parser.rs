use super::Config;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAMES: [&str; 2] = ["fleet.yaml", "fleet.yml"];

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Find config file starting from current directory
    pub fn find_config_file(&self) -> Result<PathBuf> {
        let current_dir = std::env::current_dir()?;
        Self::find_config_in_dir(&current_dir)
    }

    pub fn find_config_in_dir(dir: &Path) -> Result<PathBuf> {
        for name in CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            if candidate.exists() {
                return Ok(candidate);
            }
        }

        if let Some(parent) = dir.parent() {
            return Self::find_config_in_dir(parent);
        }

        Err(Error::Config(
            "Could not find fleet.yaml in current directory or any parent".to_string(),
        ))
    }

    /// Load config from file path
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<Config> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        self.parse_config(&content)
    }

    /// Parse config from YAML string
    pub fn parse_config(&self, content: &str) -> Result<Config> {
        // An empty file is a valid, all-defaults config
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(content)
            .map_err(|e| Error::Parse(format!("Failed to parse YAML config: {}", e)))?;

        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ServiceType;
    use std::time::Duration;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
data_dir: /var/lib/fleet

supervisor:
  heartbeat_interval: 10s
  settle_delay: 500ms
  stale_record_age: 7d

runtime:
  sync_interval: 1m

host:
  name: workstation
  tags: [gpu, lab]

services:
  infra-api:
    type: infra-api
    program: ./bin/infra-api
    args: ["--port", "{port}"]
    port: 8400
  mcp-files:
    type: mcp-server
    program: npx
    args: ["mcp-files"]
    env:
      ROOT: /srv
"#;

        let config = Parser::new().parse_config(yaml).unwrap();

        assert_eq!(config.data_dir, "/var/lib/fleet");
        assert_eq!(config.supervisor.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.supervisor.settle_delay(), Duration::from_millis(500));
        assert_eq!(config.supervisor.stop_grace(), Duration::from_secs(5));
        assert_eq!(
            config.supervisor.stale_record_age(),
            Some(Duration::from_secs(7 * 86_400))
        );
        assert_eq!(config.runtime.sync_interval(), Duration::from_secs(60));
        assert_eq!(config.runtime.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.host.tags, vec!["gpu", "lab"]);
        assert_eq!(config.services.len(), 2);
        assert_eq!(
            config.services["mcp-files"].service_type,
            ServiceType::McpServer
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Parser::new().parse_config("").unwrap();
        assert_eq!(config.data_dir, ".fleet");
        assert_eq!(config.runtime.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.runtime.sync_interval(), Duration::from_secs(30));
        assert!(config.services.is_empty());
    }

    #[test]
    fn test_unknown_service_type_is_a_parse_error() {
        let yaml = r#"
services:
  x:
    type: database
    program: postgres
"#;
        assert!(matches!(
            Parser::new().parse_config(yaml),
            Err(Error::Parse(_))
        ));
    }

    #[test]
    fn test_find_config_walks_up() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("fleet.yml"), "").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = Parser::find_config_in_dir(&nested).unwrap();
        assert_eq!(found, dir.path().join("fleet.yml"));
    }
}
