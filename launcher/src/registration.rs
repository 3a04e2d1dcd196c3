use anyhow::Context;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::consts::{DESKTOP_ENTRY_NAME, SCHEME_HANDLER_MIME};

pub fn desktop_entry_path(applications_dir: &Path) -> PathBuf {
    applications_dir.join(DESKTOP_ENTRY_NAME)
}

/// Quote a path for an `Exec=` line (freedesktop rules: reserved characters
/// inside double quotes are backslash-escaped).
fn quote_exec_arg(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if matches!(c, '"' | '`' | '$' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

pub fn render_desktop_entry(exe: &Path) -> String {
    let exec = quote_exec_arg(&exe.to_string_lossy());
    format!(
        "[Desktop Entry]\n\
         Type=Application\n\
         Name=Jitsi Meet\n\
         Comment=Join Jitsi Meet conferences from jitsi-meet:// links\n\
         Exec={exec} %u\n\
         Terminal=false\n\
         NoDisplay=true\n\
         MimeType={SCHEME_HANDLER_MIME};\n\
         Categories=Network;AudioVideo;\n"
    )
}

pub fn is_registered(applications_dir: &Path) -> bool {
    std::fs::read_to_string(desktop_entry_path(applications_dir))
        .map(|s| s.contains(SCHEME_HANDLER_MIME))
        .unwrap_or(false)
}

pub fn register(exe: &Path, applications_dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(applications_dir)
        .with_context(|| format!("mkdir {}", applications_dir.display()))?;
    let path = desktop_entry_path(applications_dir);
    std::fs::write(&path, render_desktop_entry(exe))
        .with_context(|| format!("write desktop entry: {}", path.display()))?;
    log::info!("registration: wrote {}", path.display());

    refresh_desktop_database(applications_dir);
    Ok(path)
}

/// Ask xdg-utils to prefer our entry for `jitsi-meet://`. Best effort; desktops
/// without xdg-utils pick the entry up from its `MimeType=` line.
pub fn set_default_handler() -> bool {
    run_best_effort("xdg-mime", &["default", DESKTOP_ENTRY_NAME, SCHEME_HANDLER_MIME])
}

/// Returns whether an entry was removed.
pub fn unregister(applications_dir: &Path) -> anyhow::Result<bool> {
    let path = desktop_entry_path(applications_dir);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            log::info!("registration: removed {}", path.display());
            refresh_desktop_database(applications_dir);
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("remove desktop entry: {}", path.display())),
    }
}

fn refresh_desktop_database(applications_dir: &Path) {
    let dir = applications_dir.to_string_lossy();
    run_best_effort("update-desktop-database", &[dir.as_ref()]);
}

/// Run a desktop integration tool, logging instead of failing.
fn run_best_effort(program: &str, args: &[&str]) -> bool {
    match Command::new(program)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(s) if s.success() => true,
        Ok(s) => {
            log::warn!("registration: {} exited with {}", program, s);
            false
        }
        Err(e) => {
            log::warn!("registration: {} not run: {}", program, e);
            false
        }
    }
}
