use std::path::{Path, PathBuf};

/// Resolve the platform address for a channel name.
///
/// Windows: `\\.\pipe\<name>` (the runtime directory is not used).
/// Unix: `<runtime_dir>/<name>.sock`.
pub fn channel_address(name: &str, runtime_dir: &Path) -> PathBuf {
    #[cfg(windows)]
    {
        let _ = runtime_dir;
        PathBuf::from(format!(r"\\.\pipe\{name}"))
    }

    #[cfg(not(windows))]
    {
        runtime_dir.join(format!("{name}.sock"))
    }
}

/// Directory holding per-user runtime files (sockets, lock files).
///
/// Uses `$XDG_RUNTIME_DIR` when set, otherwise the system temp directory.
pub fn default_runtime_dir() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn unix_address_appends_sock_suffix() {
        let addr = channel_address("NativeLangHookWrapperIPC", Path::new("/run/user/1000"));
        assert_eq!(
            addr,
            PathBuf::from("/run/user/1000/NativeLangHookWrapperIPC.sock")
        );
    }

    #[test]
    #[cfg(windows)]
    fn windows_address_uses_pipe_namespace() {
        let addr = channel_address("NativeLangHookWrapperIPC", Path::new("C:\\ignored"));
        assert_eq!(addr, PathBuf::from(r"\\.\pipe\NativeLangHookWrapperIPC"));
    }

    #[test]
    fn default_runtime_dir_is_absolute() {
        assert!(default_runtime_dir().is_absolute());
    }
}
