use std::path::{Path, PathBuf};

/// Platform-specific operations abstracted behind a common interface.
/// Each OS provides its own `NativePlatform` implementation so call sites
/// remain free of `#[cfg]` blocks.
pub trait Platform {
    /// Set restrictive *directory* permissions (0o700 on Unix, no-op on Windows).
    fn restrict_dir_permissions(path: &Path);

    /// Set restrictive *file* permissions (0o600 on Unix, no-op on Windows).
    fn restrict_file_permissions(path: &Path);

    /// Root data directory for optiagent.
    /// Unix: `~/.optiagent`, Windows: `%APPDATA%\optiagent`.
    fn data_dir() -> PathBuf;
}

/// Environment variable that relocates the whole data directory (store, logs, config).
pub const DATA_DIR_ENV: &str = "OPTIAGENT_DATA_DIR";

/// Honour `OPTIAGENT_DATA_DIR` when set and non-empty, otherwise use `default`.
pub(crate) fn resolve_data_dir(default: PathBuf) -> PathBuf {
    resolve_data_dir_with(default, |key| std::env::var(key).ok())
}

fn resolve_data_dir_with(default: PathBuf, lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
    match lookup(DATA_DIR_ENV) {
        Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir.trim()),
        _ => default,
    }
}

#[cfg(unix)]
mod unix;
#[cfg(unix)]
pub use unix::NativePlatform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::NativePlatform;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins_over_default() {
        let dir = resolve_data_dir_with(PathBuf::from("/home/u/.optiagent"), |_| {
            Some("/tmp/oa-data".to_string())
        });
        assert_eq!(dir, PathBuf::from("/tmp/oa-data"));
    }

    #[test]
    fn blank_override_falls_back_to_default() {
        let dir = resolve_data_dir_with(PathBuf::from("/home/u/.optiagent"), |_| {
            Some("   ".to_string())
        });
        assert_eq!(dir, PathBuf::from("/home/u/.optiagent"));
    }
}
