/// Application name
pub const APP_NAME: &str = "Parley";

/// Maximum username length in characters
pub const MAX_USERNAME_CHARS: usize = 64;

/// Maximum chat message length in characters
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Maximum length kept for a file's display name
pub const MAX_FILE_NAME_CHARS: usize = 255;

/// Maximum upload size in bytes (16 MiB)
pub const MAX_FILE_SIZE: usize = 16 * 1024 * 1024;

/// Default session token lifetime in seconds (15 minutes)
pub const DEFAULT_TOKEN_TTL_SECS: i64 = 900;

/// Tolerated clock skew for a token's issued-at in seconds
pub const TOKEN_IAT_SKEW_SECS: i64 = 60;

/// Text used when a file is shared without a caption
pub const DEFAULT_FILE_CAPTION: &str = "Shared a file";

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Path prefix for download URLs handed to clients
pub const DOWNLOAD_PATH: &str = "/download";
