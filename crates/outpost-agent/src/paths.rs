use std::{
    env,
    path::{Path, PathBuf},
};

pub const CONFIG_FILE: &str = "config.enc";
pub const DATABASE_FILE: &str = "data.db";
pub const FINGERPRINT_FILE: &str = "machine_id";

/// Default data directory: the OS service-state location, with a per-user
/// fallback when the platform convention is unavailable.
pub fn default_data_dir() -> PathBuf {
    if cfg!(windows) {
        if let Some(base) = env::var_os("PROGRAMDATA") {
            return PathBuf::from(base).join("Outpost");
        }
    } else {
        return PathBuf::from("/var/lib/outpost");
    }

    dirs::data_dir()
        .map(|base| base.join("outpost"))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn resolve_data_dir(explicit: Option<&Path>) -> PathBuf {
    explicit
        .map(Path::to_path_buf)
        .unwrap_or_else(default_data_dir)
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

pub fn database_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DATABASE_FILE)
}

pub fn fingerprint_path(data_dir: &Path) -> PathBuf {
    data_dir.join(FINGERPRINT_FILE)
}
