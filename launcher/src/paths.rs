use std::path::PathBuf;

use crate::consts::APP_DIR_NAME;

pub fn effective_uid() -> u32 {
    unsafe { libc::geteuid() }
}

/// Per-user runtime directory; socket-file endpoints live here.
pub fn default_state_dir() -> PathBuf {
    if let Ok(d) = std::env::var("XDG_RUNTIME_DIR") {
        let base = PathBuf::from(d);
        return base.join(APP_DIR_NAME);
    }
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR_NAME, effective_uid()))
}

pub fn config_path() -> PathBuf {
    let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
    base.join(APP_DIR_NAME).join("launcher.toml")
}

/// Where freedesktop `.desktop` entries for the current user go.
pub fn applications_dir() -> PathBuf {
    if let Some(d) = dirs::data_dir() {
        return d.join("applications");
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local/share/applications");
    }
    PathBuf::from("/tmp").join(APP_DIR_NAME).join("applications")
}
