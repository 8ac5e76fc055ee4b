use std::io;
use std::path::{Path, PathBuf};

/// Base directory for the control socket and PID file:
/// `$XDG_RUNTIME_DIR/webctl`, or `/tmp/webctl-<uid>` when unset.
pub fn runtime_dir() -> PathBuf {
    runtime_dir_from(std::env::var_os("XDG_RUNTIME_DIR").as_deref(), process_uid())
}

fn runtime_dir_from(xdg_runtime: Option<&std::ffi::OsStr>, uid: u32) -> PathBuf {
    match xdg_runtime {
        Some(base) if !base.is_empty() => Path::new(base).join("webctl"),
        _ => std::env::temp_dir().join(format!("webctl-{uid}")),
    }
}

pub fn socket_path() -> PathBuf {
    runtime_dir().join("webctl.sock")
}

pub fn pid_path() -> PathBuf {
    runtime_dir().join("webctl.pid")
}

/// State directory for body dumps and logs:
/// `$XDG_STATE_HOME/webctl`, falling back to `~/.local/state/webctl`.
pub fn state_dir() -> PathBuf {
    state_dir_from(
        std::env::var_os("XDG_STATE_HOME").as_deref(),
        std::env::var_os("HOME").as_deref(),
    )
}

fn state_dir_from(
    xdg_state: Option<&std::ffi::OsStr>,
    home: Option<&std::ffi::OsStr>,
) -> PathBuf {
    match xdg_state {
        Some(base) if !base.is_empty() => Path::new(base).join("webctl"),
        _ => match home {
            Some(home) if !home.is_empty() => {
                Path::new(home).join(".local").join("state").join("webctl")
            }
            _ => std::env::temp_dir().join("webctl-state"),
        },
    }
}

/// Where this daemon process writes non-textual response bodies.
pub fn body_dir(pid: u32) -> PathBuf {
    state_dir().join("bodies").join(pid.to_string())
}

/// Create the runtime directory with owner-only access.
pub fn ensure_runtime_dir() -> io::Result<PathBuf> {
    let dir = runtime_dir();
    std::fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(dir)
}

/// Restrict a freshly bound socket to the owning user.
#[cfg(unix)]
pub fn restrict_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
pub fn restrict_socket(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn process_uid() -> u32 {
    #[cfg(unix)]
    {
        // Safety: getuid has no failure modes.
        unsafe { libc::getuid() }
    }
    #[cfg(not(unix))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    #[test]
    fn runtime_dir_prefers_xdg() {
        let dir = runtime_dir_from(Some(OsStr::new("/run/user/1000")), 1000);
        assert_eq!(dir, Path::new("/run/user/1000/webctl"));
    }

    #[test]
    fn runtime_dir_falls_back_to_tmp_with_uid() {
        let dir = runtime_dir_from(None, 1000);
        assert!(dir.ends_with("webctl-1000"));
        let dir = runtime_dir_from(Some(OsStr::new("")), 42);
        assert!(dir.ends_with("webctl-42"));
    }

    #[test]
    fn state_dir_fallback_chain() {
        let dir = state_dir_from(Some(OsStr::new("/var/state")), None);
        assert_eq!(dir, Path::new("/var/state/webctl"));
        let dir = state_dir_from(None, Some(OsStr::new("/home/me")));
        assert_eq!(dir, Path::new("/home/me/.local/state/webctl"));
    }
}
