//! Platform-specific utilities for backend install locations and library
//! search paths.
//!
//! Provides cross-platform functions to determine where llama.cpp backends
//! live on Windows, macOS, and Linux, and how a spawned server finds the
//! shared libraries shipped next to it.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "llamactl";

/// Get the default data directory for the current platform.
///
/// Returns platform-specific paths:
/// - **Windows**: `%APPDATA%\llamactl\`
/// - **macOS**: `~/Library/Application Support/llamactl/`
/// - **Linux**: `$XDG_DATA_HOME/llamactl/` or `~/.local/share/llamactl/`
///
/// Falls back to `./llamactl` when no data directory can be resolved.
pub fn get_default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

/// Directory holding installed backends as `<version>/<backend>/`.
pub fn get_default_backends_dir() -> PathBuf {
    get_default_data_dir().join("llamacpp").join("backends")
}

/// Name of the server executable on this platform.
pub fn server_executable_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "llama-server.exe"
    } else {
        "llama-server"
    }
}

/// Environment variable the dynamic loader consults for shared libraries.
pub fn library_path_var() -> &'static str {
    if cfg!(target_os = "windows") {
        "PATH"
    } else if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// Build a library search path with `extra` directories in front of the
/// current value of [`library_path_var`].
///
/// Returns the variable name and the joined value, ready for
/// `Command::env`. Directories that cannot be joined (they contain the path
/// separator) are skipped.
pub fn library_search_path(extra: &[&Path]) -> (&'static str, OsString) {
    let var = library_path_var();
    let mut paths: Vec<PathBuf> = extra
        .iter()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .collect();

    if let Some(existing) = env::var_os(var) {
        paths.extend(env::split_paths(&existing));
    }

    let joined = match env::join_paths(paths.iter()) {
        Ok(joined) => joined,
        Err(_) => {
            let valid: Vec<&PathBuf> = paths
                .iter()
                .filter(|p| env::join_paths([p]).is_ok())
                .collect();
            env::join_paths(valid).unwrap_or_default()
        }
    };

    (var, joined)
}
