pub const APP_DIR_NAME: &str = "jitsi-meet-launcher";

pub const PROTOCOL_SCHEME: &str = "jitsi-meet://";

pub const DEFAULT_SERVER_URL: &str = "https://meet.jit.si";

// Changing this breaks the single-instance guarantee across an upgrade:
// old and new builds would no longer find each other.
pub const ENDPOINT_NAME: &str = "jitsi-meet-launcher.v1";

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_FLUSH_TIMEOUT_MS: u64 = 500;

pub const DESKTOP_ENTRY_NAME: &str = "jitsi-meet-launcher.desktop";
pub const SCHEME_HANDLER_MIME: &str = "x-scheme-handler/jitsi-meet";
