//! Path validation and library directories for a spawned server.

use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

use crate::error::{ServerError, ServerResult};

pub fn validate_binary_path(backend_path: &Path) -> ServerResult<PathBuf> {
    if !backend_path.is_file() {
        error!("Server binary not found at expected path: {:?}", backend_path);
        return Err(ServerError::BackendNotFound(backend_path.display().to_string()));
    }
    Ok(backend_path.to_path_buf())
}

pub fn validate_model_path(model_path: &Path) -> ServerResult<PathBuf> {
    if !model_path.is_file() {
        error!("Invalid or inaccessible model path: {}", model_path.display());
        return Err(ServerError::FileNotFound(model_path.display().to_string()));
    }
    Ok(model_path.to_path_buf())
}

/// `None` and empty paths mean "no projector"
pub fn validate_mmproj_path(mmproj_path: Option<&Path>) -> ServerResult<Option<PathBuf>> {
    match mmproj_path.filter(|p| !p.as_os_str().is_empty()) {
        None => Ok(None),
        Some(path) => validate_model_path(path).map(Some),
    }
}

/// CUDA runtime library directories present on this machine
pub fn cuda_library_dirs() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(cuda_path) = env::var_os("CUDA_PATH") {
        let root = PathBuf::from(cuda_path);
        if cfg!(target_os = "windows") {
            candidates.push(root.join("bin"));
        } else {
            candidates.push(root.join("lib64"));
            candidates.push(root.join("lib"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        candidates.push(PathBuf::from("/usr/local/cuda/lib64"));
        candidates.push(PathBuf::from("/usr/lib/x86_64-linux-gnu"));
    }

    candidates.retain(|dir| dir.is_dir());
    candidates.dedup();
    debug!("CUDA library directories: {:?}", candidates);
    candidates
}

/// The binary's own directory first, then any CUDA runtime directories
pub fn library_dirs_for(binary: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = binary.parent().map(Path::to_path_buf).into_iter().collect();
    for dir in cuda_library_dirs() {
        if !dirs.contains(&dir) {
            dirs.push(dir);
        }
    }
    dirs
}
