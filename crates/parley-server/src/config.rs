//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use parley_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_TOKEN_TTL_SECS, MAX_FILE_SIZE};

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP + WebSocket server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:5000`
    pub http_addr: SocketAddr,

    /// Directory where uploaded file content is stored.
    /// Env: `UPLOAD_DIR`
    /// Default: `./uploads`
    pub upload_dir: PathBuf,

    /// File registry snapshot.
    /// Env: `REGISTRY_SNAPSHOT`
    /// Default: `./file_tracking.json`
    pub snapshot_path: PathBuf,

    /// Maximum upload size in bytes.
    /// Env: `MAX_UPLOAD_SIZE`
    /// Default: 16 MiB
    pub max_upload_size: usize,

    /// Session token lifetime.
    /// Env: `TOKEN_TTL_SECS`
    /// Default: 900 (15 minutes)
    pub token_ttl: chrono::Duration,

    /// Ed25519 seed used to sign session tokens (hex-encoded, 64 chars).
    /// Env: `TOKEN_SIGNING_KEY`
    /// Default: none, a random key is generated at startup.
    pub token_signing_key: Option<[u8; 32]>,

    /// Accounts as `(username, password)` pairs.
    /// Env: `CHAT_USERS` (`alice:secret,bob:hunter2`)
    /// Default: `user1:password123` (development only).
    pub users: Vec<(String, String)>,

    /// Per-peer timeout for writing one event to its socket.
    /// Env: `SEND_TIMEOUT_MS`
    /// Default: 5000
    pub send_timeout: Duration,

    /// Capacity of each connection's outbound queue. A peer whose queue is
    /// full during fan-out is disconnected.
    /// Env: `OUTBOUND_QUEUE`
    /// Default: 64
    pub outbound_queue: usize,

    /// Protocol violations tolerated before a connection is closed.
    /// Env: `MAX_PROTOCOL_VIOLATIONS`
    /// Default: 5
    pub max_protocol_violations: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            upload_dir: PathBuf::from("./uploads"),
            snapshot_path: PathBuf::from("./file_tracking.json"),
            max_upload_size: MAX_FILE_SIZE,
            token_ttl: chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            token_signing_key: None,
            users: vec![("user1".to_string(), "password123".to_string())],
            send_timeout: Duration::from_millis(5000),
            outbound_queue: 64,
            max_protocol_violations: 5,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(path) = var("UPLOAD_DIR") {
            config.upload_dir = PathBuf::from(path);
        }

        if let Some(path) = var("REGISTRY_SNAPSHOT") {
            config.snapshot_path = PathBuf::from(path);
        }

        if let Some(val) = var("MAX_UPLOAD_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_upload_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_UPLOAD_SIZE, using default"),
            }
        }

        if let Some(val) = var("TOKEN_TTL_SECS") {
            match val
                .parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .and_then(chrono::Duration::try_seconds)
            {
                Some(ttl) => config.token_ttl = ttl,
                None => tracing::warn!(value = %val, "Invalid TOKEN_TTL_SECS, using default"),
            }
        }

        if let Some(hex_key) = var("TOKEN_SIGNING_KEY") {
            match parse_hex_seed(&hex_key) {
                Ok(key) => config.token_signing_key = Some(key),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid TOKEN_SIGNING_KEY, a random key will be generated"
                    );
                }
            }
        }

        if let Some(val) = var("CHAT_USERS") {
            let users = parse_users(&val);
            if users.is_empty() {
                tracing::warn!("CHAT_USERS contains no valid entries, using default account");
            } else {
                config.users = users;
            }
        }

        if let Some(val) = var("SEND_TIMEOUT_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                config.send_timeout = Duration::from_millis(ms.max(1));
            }
        }

        if let Some(val) = var("OUTBOUND_QUEUE") {
            if let Ok(n) = val.parse::<usize>() {
                config.outbound_queue = n.max(1);
            }
        }

        if let Some(val) = var("MAX_PROTOCOL_VIOLATIONS") {
            if let Ok(n) = val.parse::<u32>() {
                config.max_protocol_violations = n.max(1);
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }
}

// Keeps passwords and the signing key out of the startup log.
impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let usernames: Vec<&str> = self.users.iter().map(|(u, _)| u.as_str()).collect();
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("upload_dir", &self.upload_dir)
            .field("snapshot_path", &self.snapshot_path)
            .field("max_upload_size", &self.max_upload_size)
            .field("token_ttl_secs", &self.token_ttl.num_seconds())
            .field("token_signing_key", &self.token_signing_key.map(|_| "<set>"))
            .field("users", &usernames)
            .field("send_timeout", &self.send_timeout)
            .field("outbound_queue", &self.outbound_queue)
            .field("max_protocol_violations", &self.max_protocol_violations)
            .finish()
    }
}

/// Parse a 64-character hex string into a 32-byte seed.
fn parse_hex_seed(hex_str: &str) -> Result<[u8; 32], String> {
    let hex_str = hex_str.trim();
    if hex_str.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", hex_str.len()));
    }
    let bytes = hex::decode(hex_str).map_err(|e| format!("invalid hex: {e}"))?;
    let mut seed = [0u8; 32];
    seed.copy_from_slice(&bytes);
    Ok(seed)
}

/// Parse `name:password` pairs separated by commas. Entries without a colon
/// or with an empty side are skipped.
fn parse_users(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (name, password) = entry.trim().split_once(':')?;
            let name = name.trim();
            if name.is_empty() || password.is_empty() {
                tracing::warn!(entry = %name, "Skipping malformed CHAT_USERS entry");
                return None;
            }
            Some((name.to_string(), password.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 5000).into());
        assert_eq!(config.max_upload_size, 16 * 1024 * 1024);
        assert_eq!(config.token_ttl.num_seconds(), 900);
        assert!(config.token_signing_key.is_none());
    }

    #[test]
    fn test_env_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "127.0.0.1:9000"),
            ("TOKEN_TTL_SECS", "60"),
            ("TOKEN_SIGNING_KEY", &"ab".repeat(32)),
            ("CHAT_USERS", "alice:secret, bob:pa:ss"),
            ("MAX_PROTOCOL_VIOLATIONS", "2"),
        ]));
        assert_eq!(config.http_addr, ([127, 0, 0, 1], 9000).into());
        assert_eq!(config.token_ttl.num_seconds(), 60);
        assert_eq!(config.token_signing_key, Some([0xab; 32]));
        assert_eq!(
            config.users,
            vec![
                ("alice".to_string(), "secret".to_string()),
                ("bob".to_string(), "pa:ss".to_string()),
            ]
        );
        assert_eq!(config.max_protocol_violations, 2);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("HTTP_ADDR", "nonsense"),
            ("TOKEN_TTL_SECS", "-5"),
            ("TOKEN_SIGNING_KEY", "abcd"),
            ("CHAT_USERS", "nocolon,:nopass"),
        ]));
        let defaults = ServerConfig::default();
        assert_eq!(config.http_addr, defaults.http_addr);
        assert_eq!(config.token_ttl, defaults.token_ttl);

        // Parses as i64 but does not fit a chrono::Duration.
        let huge_ttl = ServerConfig::from_lookup(lookup(&[(
            "TOKEN_TTL_SECS",
            "9223372036854775807",
        )]));
        assert_eq!(huge_ttl.token_ttl, defaults.token_ttl);
        assert!(config.token_signing_key.is_none());
        assert_eq!(config.users, defaults.users);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut config = ServerConfig::default();
        config.token_signing_key = Some([1; 32]);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("password123"));
        assert!(rendered.contains("user1"));
        assert!(rendered.contains("<set>"));
    }

    #[test]
    fn test_parse_hex_seed_wrong_length() {
        assert!(parse_hex_seed("abcd").is_err());
        assert!(parse_hex_seed(&"zz".repeat(32)).is_err());
    }
}
