//! Server configuration: defaults, key=value config file, CLI overrides

use log::{info, warn};
use std::fs;
use std::path::Path;

/// Read-only settings record handed to the acceptor and liveness monitor.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub ip: String,
    /// Listen port.
    pub port: u16,
    /// Upper bound on concurrently existing rooms.
    pub max_rooms: usize,
    /// Seats per room. The game currently supports exactly two.
    pub max_players_per_room: usize,
    /// Consecutive invalid frames tolerated before a connection is closed.
    pub invalid_message_limit: u32,
    /// Seconds without a PING before an attached player is detached.
    pub player_timeout_seconds: u64,
    /// Liveness monitor tick period in seconds.
    pub heartbeat_check_interval: u64,
    /// Seconds a detached player may reconnect before being cleaned up.
    pub cleanup_threshold_seconds: u64,
    /// Log file path, used when `enable_file_logging` is set.
    pub log_file: String,
    /// Route log output to `log_file` instead of stderr.
    pub enable_file_logging: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            ip: "127.0.0.1".to_string(),
            port: 8080,
            max_rooms: 10,
            max_players_per_room: 2,
            invalid_message_limit: 3,
            player_timeout_seconds: 60,
            heartbeat_check_interval: 10,
            cleanup_threshold_seconds: 120,
            log_file: "logs/gamba_server.log".to_string(),
            enable_file_logging: false,
        }
    }
}

impl ServerConfig {
    /// Loads `key=value` settings from `path`, overriding current values.
    ///
    /// Lines starting with `#` and blank lines are skipped; keys and values
    /// are whitespace-trimmed. Unknown keys and unparseable values produce a
    /// warning and are otherwise ignored. A missing file is not an error.
    pub fn load_from_file(&mut self, path: &Path) -> std::io::Result<()> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "Config file {} not found, using defaults",
                    path.display()
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(pos) = line.find('=') else {
                warn!("Ignoring config line without '=': {:?}", line);
                continue;
            };
            let key = line[..pos].trim();
            let value = line[pos + 1..].trim();

            match key {
                "ip" => self.ip = value.to_string(),
                "port" => self.set_number(key, value, |c, v| c.port = v),
                "max_rooms" => self.set_number(key, value, |c, v| c.max_rooms = v),
                "max_players_per_room" => {
                    self.set_number(key, value, |c, v| c.max_players_per_room = v)
                }
                "invalid_message_limit" => {
                    self.set_number(key, value, |c, v| c.invalid_message_limit = v)
                }
                "player_timeout_seconds" => {
                    self.set_number(key, value, |c, v| c.player_timeout_seconds = v)
                }
                "heartbeat_check_interval" => {
                    self.set_number(key, value, |c, v| c.heartbeat_check_interval = v)
                }
                "cleanup_threshold_seconds" => {
                    self.set_number(key, value, |c, v| c.cleanup_threshold_seconds = v)
                }
                "log_file" => self.log_file = value.to_string(),
                "enable_file_logging" => self.enable_file_logging = value == "true",
                _ => warn!("Unknown config key {:?}", key),
            }
        }

        info!("Configuration loaded from {}", path.display());
        Ok(())
    }

    fn set_number<T: std::str::FromStr>(
        &mut self,
        key: &str,
        value: &str,
        apply: impl FnOnce(&mut Self, T),
    ) {
        match value.parse::<T>() {
            Ok(parsed) => apply(self, parsed),
            Err(_) => warn!("Invalid value {:?} for config key {:?}", value, key),
        }
    }

    /// Address string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}
