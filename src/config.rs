//! TOML configuration, mirroring `examples/original_source/config.py`'s flat
//! value list. Loaded once at startup from the single CLI argument (no
//! subcommands, no flags beyond the config path).

use std::path::Path;

use serde::Deserialize;

use crate::consts::DEFAULT_MAX_COMMAND_LENGTH;

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bind_port() -> u16 {
    32
}

fn default_max_connections() -> usize {
    100
}

fn default_max_command_length() -> usize {
    DEFAULT_MAX_COMMAND_LENGTH
}

fn default_target_ssh_port() -> u16 {
    22
}

fn default_log_dir() -> String {
    "logs".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Path to the PEM-encoded host key presented to downstream clients.
    pub server_key_file: String,

    pub db_host: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    pub db_username: String,
    pub db_password: String,
    pub db_name: String,

    #[serde(default = "default_max_command_length")]
    pub max_command_length: usize,

    #[serde(default = "default_target_ssh_port")]
    pub target_ssh_port: u16,

    /// Directory session transcripts (component C) are written under.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_db_port() -> u16 {
    3306
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("reading config file {:?}: {}", path.as_ref(), e))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing config file {:?}: {}", path.as_ref(), e))?;
        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in_when_omitted() {
        let toml_src = r#"
            server_key_file = "ssh_host_rsa_key"
            db_host = "127.0.0.1"
            db_username = "root"
            db_password = ""
            db_name = "bastion"
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.bind_address, "0.0.0.0");
        assert_eq!(config.bind_port, 32);
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.max_command_length, DEFAULT_MAX_COMMAND_LENGTH);
        assert_eq!(config.target_ssh_port, 22);
        assert_eq!(config.db_port, 3306);
        assert_eq!(config.log_dir, "logs");
    }

    #[test]
    fn explicit_values_override_defaults() {
        let toml_src = r#"
            bind_address = "127.0.0.1"
            bind_port = 2222
            server_key_file = "key.pem"
            db_host = "db.internal"
            db_port = 3307
            db_username = "svc"
            db_password = "secret"
            db_name = "bastion"
            max_command_length = 500
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:2222");
        assert_eq!(config.db_port, 3307);
        assert_eq!(config.max_command_length, 500);
    }
}
