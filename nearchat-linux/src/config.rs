//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use nearchat_core::DEFAULT_TRANSPORT_PORT;

/// Client configuration. File: ~/.config/nearchat/config.toml or /etc/nearchat/config.toml.
/// Env overrides: NEARCHAT_STUDENT_ID, NEARCHAT_TRANSPORT_PORT, NEARCHAT_DISCOVERY_PORT,
/// NEARCHAT_ENCRYPT_MESSAGES.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Nine-digit student id presented in the handshake.
    #[serde(default)]
    pub student_id: Option<String>,
    /// Advertised name before discovery starts (defaults to the student id).
    #[serde(default)]
    pub device_name: Option<String>,
    /// Chat TCP port, the same on every device (default 8888).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Discovery UDP port (default 45678).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// How long a link request may go unanswered.
    #[serde(default = "default_link_timeout")]
    pub link_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub require_handshake: bool,
    #[serde(default)]
    pub encrypt_messages: bool,
    /// Initiator sends "Student ID: <id>" once authenticated.
    #[serde(default = "default_true")]
    pub announce_identifier: bool,
    /// Accepting side verifies against this id instead of the presented one.
    #[serde(default)]
    pub expected_peer_id: Option<String>,
}

fn default_transport_port() -> u16 {
    DEFAULT_TRANSPORT_PORT
}
fn default_discovery_port() -> u16 {
    45678
}
fn default_handshake_timeout() -> u64 {
    10
}
fn default_link_timeout() -> u64 {
    15
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            student_id: None,
            device_name: None,
            transport_port: default_transport_port(),
            discovery_port: default_discovery_port(),
            handshake_timeout_secs: default_handshake_timeout(),
            link_timeout_secs: default_link_timeout(),
            require_handshake: true,
            encrypt_messages: false,
            announce_identifier: true,
            expected_peer_id: None,
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
/// `path` replaces the default file locations.
pub fn load(path: Option<&Path>) -> Config {
    let file = match path {
        Some(p) => load_file(p),
        None => config_paths().into_iter().find(|p| p.exists()).and_then(|p| load_file(&p)),
    };
    let mut c = file.unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/nearchat/config.toml"));
    }
    out.push(PathBuf::from("/etc/nearchat/config.toml"));
    out
}

fn load_file(path: &Path) -> Option<Config> {
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file; using defaults");
            return None;
        }
    };
    match parse(&s) {
        Ok(c) => Some(c),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "invalid config file; using defaults");
            None
        }
    }
}

pub fn parse(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str(s)
}

/// Overlay environment variables. Unparseable values are ignored with a warning.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("NEARCHAT_STUDENT_ID") {
        c.student_id = Some(s);
    }
    if let Some(s) = var("NEARCHAT_TRANSPORT_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.transport_port = p,
            Err(_) => warn!(value = %s, "ignoring NEARCHAT_TRANSPORT_PORT"),
        }
    }
    if let Some(s) = var("NEARCHAT_DISCOVERY_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.discovery_port = p,
            Err(_) => warn!(value = %s, "ignoring NEARCHAT_DISCOVERY_PORT"),
        }
    }
    if let Some(s) = var("NEARCHAT_ENCRYPT_MESSAGES") {
        match parse_flag(&s) {
            Some(b) => c.encrypt_messages = b,
            None => warn!(value = %s, "ignoring NEARCHAT_ENCRYPT_MESSAGES"),
        }
    }
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(parse("").unwrap(), Config::default());
        assert_eq!(Config::default().transport_port, 8888);
    }

    #[test]
    fn file_values_override_defaults() {
        let c = parse(
            r#"
            student_id = "816012345"
            transport_port = 9000
            encrypt_messages = true
            expected_peer_id = "816000000"
            "#,
        )
        .unwrap();
        assert_eq!(c.student_id.as_deref(), Some("816012345"));
        assert_eq!(c.transport_port, 9000);
        assert!(c.encrypt_messages);
        assert_eq!(c.expected_peer_id.as_deref(), Some("816000000"));
        assert_eq!(c.discovery_port, 45678);
        assert!(c.require_handshake);
    }

    #[test]
    fn unknown_keys_rejected() {
        assert!(parse("proxy_port = 3128").is_err());
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            ("NEARCHAT_STUDENT_ID", "816099999"),
            ("NEARCHAT_DISCOVERY_PORT", "5000"),
            ("NEARCHAT_TRANSPORT_PORT", "not a port"),
            ("NEARCHAT_ENCRYPT_MESSAGES", "yes"),
        ]
        .into_iter()
        .collect();
        let mut c = Config::default();
        apply_env(&mut c, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.student_id.as_deref(), Some("816099999"));
        assert_eq!(c.discovery_port, 5000);
        assert_eq!(c.transport_port, 8888);
        assert!(c.encrypt_messages);
    }

    #[test]
    fn missing_explicit_file_falls_back_to_defaults() {
        assert_eq!(load_file(Path::new("/nonexistent/nearchat.toml")), None);
    }
}
