use std::path::{Path, PathBuf};

use libbwt_core::Network;

pub const COOKIE_FILE: &str = ".cookie";

/// Default bitcoind data directory relative to `home`, following Bitcoin
/// Core's per-platform conventions.
pub fn bitcoind_dir_at(home: &Path) -> PathBuf {
    if cfg!(target_os = "macos") {
        home.join("Library").join("Application Support").join("Bitcoin")
    } else if cfg!(windows) {
        home.join("AppData").join("Roaming").join("Bitcoin")
    } else {
        home.join(".bitcoin")
    }
}

/// Default bitcoind data directory for the current user, if a home
/// directory can be determined.
pub fn default_bitcoind_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| bitcoind_dir_at(&home))
}

/// `<bitcoind_dir>/[<network subdir>/].cookie`
pub fn cookie_path(bitcoind_dir: &Path, network: Network) -> PathBuf {
    match network.data_subdir() {
        Some(sub) => bitcoind_dir.join(sub).join(COOKIE_FILE),
        None => bitcoind_dir.join(COOKIE_FILE),
    }
}
