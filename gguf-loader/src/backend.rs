//! Backend release bookkeeping: naming migrations, host compatibility,
//! update checks and on-disk installs under `<backends_dir>/<version>/<backend>/`.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use llamactl_hardware::{GpuInfo, GpuVendor};

use crate::variant::{server_binary_path, SupportedFeatures};
use crate::{GgufError, Result};

/// A published or installed backend build, e.g. `b7523` / `linux-cuda-12-common_cpus-x64`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BackendInfo {
    pub version: String,
    pub backend: String,
}

impl BackendInfo {
    pub fn new(version: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            backend: backend.into(),
        }
    }

    /// `version/backend`
    pub fn backend_string(&self) -> String {
        format!("{}/{}", self.version, self.backend)
    }
}

pub type InstalledBackend = BackendInfo;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestBackendResult {
    pub backend_string: String,
    pub version: String,
    pub backend_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCheckResult {
    pub update_needed: bool,
    pub new_version: String,
    pub target_backend: Option<String>,
}

impl UpdateCheckResult {
    fn up_to_date() -> Self {
        Self {
            update_needed: false,
            new_version: "0".to_string(),
            target_backend: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingUpdateResult {
    pub backend_type_updated: bool,
    pub effective_backend_type: Option<String>,
    pub needs_backend_installation: bool,
    pub version: Option<String>,
    pub backend: Option<String>,
}

/// Rename a pre-`common_cpus` asset name to its current equivalent.
/// Names that need no migration come back unchanged.
pub fn map_old_backend_to_new(old_backend: &str) -> String {
    let os_prefix = if old_backend.starts_with("win-") {
        "win-"
    } else if old_backend.starts_with("linux-") {
        "linux-"
    } else {
        ""
    };
    let arch = if old_backend.contains("-arm64") {
        "arm64"
    } else {
        "x64"
    };

    if old_backend.contains("cuda-cu12.0") {
        return format!("{}cuda-12-common_cpus-{}", os_prefix, arch);
    }
    if old_backend.contains("cuda-cu11.7") {
        return format!("{}cuda-11-common_cpus-{}", os_prefix, arch);
    }
    if old_backend.contains("vulkan") {
        if old_backend.contains("vulkan-common_cpus") {
            return old_backend.to_string();
        }
        return format!("{}vulkan-common_cpus-{}", os_prefix, arch);
    }

    let is_old_cpu_backend = old_backend.contains("avx512")
        || old_backend.contains("avx2")
        || old_backend.contains("avx-x64")
        || old_backend.contains("noavx-x64");
    if is_old_cpu_backend {
        return format!("{}common_cpus-{}", os_prefix, arch);
    }

    old_backend.to_string()
}

/// Asset names runnable on `os`/`arch` given the host features.
pub fn determine_supported_backends(
    os: &str,
    arch: &str,
    features: &SupportedFeatures,
) -> Result<Vec<String>> {
    let prefix = match (os, arch) {
        ("windows", "x86_64") => "win",
        ("linux", "x86_64") | ("linux", "x86") => "linux",
        ("windows", "aarch64") | ("windows", "arm64") => return Ok(vec!["win-arm64".to_string()]),
        ("linux", "aarch64") | ("linux", "arm64") => return Ok(vec!["linux-arm64".to_string()]),
        ("macos", "x86_64") | ("macos", "x86") => return Ok(vec!["macos-x64".to_string()]),
        ("macos", "aarch64") | ("macos", "arm64") => return Ok(vec!["macos-arm64".to_string()]),
        _ => {
            return Err(GgufError::InvalidArgument(format!(
                "Unsupported system type: {}-{}",
                os, arch
            )))
        }
    };

    let mut backends = vec![format!("{}-common_cpus-x64", prefix)];
    for (enabled, kind) in [
        (features.cuda11, "cuda-11"),
        (features.cuda12, "cuda-12"),
        (features.cuda13, "cuda-13"),
        (features.vulkan, "vulkan"),
    ] {
        if enabled {
            backends.push(format!("{}-{}-common_cpus-x64", prefix, kind));
        }
    }
    Ok(backends)
}

/// Minimum NVIDIA driver for CUDA 11, 12 and 13 on `os`
fn cuda_driver_minimums(os: &str) -> Option<[&'static str; 3]> {
    match os {
        "linux" => Some(["450.80.02", "525.60.13", "580"]),
        "windows" => Some(["452.39", "527.41", "580"]),
        _ => None,
    }
}

/// Host capabilities from CPU extensions and GPU driver details.
///
/// CUDA is only reported on Linux and Windows, derived from each NVIDIA
/// card's driver version.
pub fn get_supported_features<S: AsRef<str>>(
    os: &str,
    cpu_extensions: &[S],
    gpus: &[GpuInfo],
) -> SupportedFeatures {
    let has = |name: &str| cpu_extensions.iter().any(|e| e.as_ref() == name);
    let mut features = SupportedFeatures {
        avx: has("avx"),
        avx2: has("avx2"),
        avx512: has("avx512"),
        ..Default::default()
    };

    features.vulkan = gpus.iter().any(|gpu| gpu.vulkan);

    let Some([cuda11, cuda12, cuda13]) = cuda_driver_minimums(os) else {
        return features;
    };

    for gpu in gpus.iter().filter(|gpu| gpu.vendor == GpuVendor::Nvidia) {
        let Some(driver) = gpu.driver_version.as_deref() else {
            continue;
        };
        features.cuda11 |= compare_versions(driver, cuda11) != Ordering::Less;
        features.cuda12 |= compare_versions(driver, cuda12) != Ordering::Less;
        features.cuda13 |= compare_versions(driver, cuda13) != Ordering::Less;
    }

    features
}

/// Dotted numeric comparison; missing or non-numeric parts count as 0.
pub fn compare_versions(v1: &str, v2: &str) -> Ordering {
    let parts1: Vec<&str> = v1.split('.').collect();
    let parts2: Vec<&str> = v2.split('.').collect();
    let part = |parts: &[&str], i: usize| -> u64 {
        parts.get(i).and_then(|s| s.trim().parse().ok()).unwrap_or(0)
    };

    (0..parts1.len().max(parts2.len()))
        .map(|i| part(&parts1, i).cmp(&part(&parts2, i)))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// `b7523` → 7523. Anything unparsable is 0.
pub fn parse_backend_version(version: &str) -> u32 {
    version
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .unwrap_or(0)
}

fn newest_first(a: &BackendInfo, b: &BackendInfo) -> Ordering {
    parse_backend_version(&b.version)
        .cmp(&parse_backend_version(&a.version))
        .then_with(|| b.version.cmp(&a.version))
}

/// Newest `version/backend` whose (migrated) backend name is `backend_type`
pub fn find_latest_version_for_backend(
    available: &[BackendInfo],
    backend_type: &str,
) -> Option<String> {
    available
        .iter()
        .filter(|info| map_old_backend_to_new(&info.backend) == backend_type)
        .min_by(|a, b| newest_first(a, b))
        .map(BackendInfo::backend_string)
}

fn backend_category(backend: &str) -> Option<&'static str> {
    if backend.contains("cuda-13-common_cpus") {
        Some("cuda-cu13.0")
    } else if backend.contains("cuda-12-common_cpus") || backend.contains("cu12.0") {
        Some("cuda-cu12.0")
    } else if backend.contains("cuda-11-common_cpus") || backend.contains("cu11.7") {
        Some("cuda-cu11.7")
    } else if backend.contains("vulkan") {
        Some("vulkan")
    } else if backend.contains("common_cpus") {
        Some("common_cpus")
    } else if backend.contains("avx512") {
        Some("avx512")
    } else if backend.contains("avx2") {
        Some("avx2")
    } else if backend.contains("noavx") {
        Some("noavx")
    } else if backend.contains("avx") {
        Some("avx")
    } else if backend.ends_with("arm64") {
        Some("arm64")
    } else if backend.ends_with("x64") {
        Some("x64")
    } else {
        None
    }
}

/// Pick the preferred build from `available` (assumed newest first).
///
/// Vulkan ranks right after CUDA when the GPU has room for the model and
/// drops below every CPU category otherwise.
pub fn prioritize_backends(
    available: &[BackendInfo],
    has_enough_gpu_memory: bool,
) -> Result<BestBackendResult> {
    let first = available
        .first()
        .ok_or_else(|| GgufError::InvalidArgument("No backends available".to_string()))?;

    const CUDA: [&str; 3] = ["cuda-cu13.0", "cuda-cu12.0", "cuda-cu11.7"];
    const CPU: [&str; 7] = ["common_cpus", "avx512", "avx2", "avx", "noavx", "arm64", "x64"];

    let mut priorities: Vec<&str> = CUDA.to_vec();
    if has_enough_gpu_memory {
        priorities.push("vulkan");
        priorities.extend(CPU);
    } else {
        priorities.extend(CPU);
        priorities.push("vulkan");
    }

    let best = priorities.iter().find_map(|&category| {
        available
            .iter()
            .find(|info| backend_category(&info.backend) == Some(category))
            .map(|info| (info, category))
    });

    let (chosen, category) = match best {
        Some(found) => found,
        None => (first, "fallback"),
    };
    log::info!(
        "Determined best available backend: {} (category: {})",
        chosen.backend_string(),
        category
    );

    Ok(BestBackendResult {
        backend_string: chosen.backend_string(),
        version: chosen.version.clone(),
        backend_type: chosen.backend.clone(),
    })
}

/// Compare the configured `version/backend` against the newest release of the
/// same (migrated) backend type.
pub fn check_backend_for_updates(
    current_backend_string: &str,
    available: &[BackendInfo],
) -> Result<UpdateCheckResult> {
    let (current_version, current_backend) = validate_backend_string(current_backend_string)?;
    let effective = map_old_backend_to_new(&current_backend);

    let Some(target) = find_latest_version_for_backend(available, &effective) else {
        log::warn!("No available versions found for backend type {}", effective);
        return Ok(UpdateCheckResult::up_to_date());
    };
    let latest_version = target.split('/').next().unwrap_or_default().to_string();

    if parse_backend_version(&latest_version) > parse_backend_version(&current_version) {
        log::info!("New update available: {} -> {}", current_version, target);
        Ok(UpdateCheckResult {
            update_needed: true,
            new_version: latest_version,
            target_backend: Some(target),
        })
    } else {
        log::info!("Already at latest version: {}", current_version);
        Ok(UpdateCheckResult::up_to_date())
    }
}

/// Split and validate `version/backend`
pub fn validate_backend_string(backend_string: &str) -> Result<(String, String)> {
    let invalid = || GgufError::InvalidArgument(format!("Invalid backend format: {}", backend_string));

    let mut parts = backend_string.split('/');
    let (Some(version), Some(backend), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };
    let (version, backend) = (version.trim(), backend.trim());
    if version.is_empty() || backend.is_empty() {
        return Err(invalid());
    }
    Ok((version.to_string(), backend.to_string()))
}

/// New backend name for a stored legacy name, when that build is available
pub fn should_migrate_backend(stored_backend_type: &str, available: &[BackendInfo]) -> Option<String> {
    let mapped = map_old_backend_to_new(stored_backend_type);
    if mapped == stored_backend_type {
        return None;
    }

    if available
        .iter()
        .any(|info| map_old_backend_to_new(&info.backend) == mapped)
    {
        log::info!("Migration needed from '{}' to '{}'", stored_backend_type, mapped);
        Some(mapped)
    } else {
        log::warn!(
            "Migration from '{}' to '{}' skipped: new type not available",
            stored_backend_type,
            mapped
        );
        None
    }
}

/// Effect of changing a setting. Only `version_backend` has consequences.
pub fn handle_setting_update(
    key: &str,
    value: &str,
    current_stored_backend: Option<&str>,
) -> Result<SettingUpdateResult> {
    if key != "version_backend" {
        return Ok(SettingUpdateResult {
            backend_type_updated: false,
            effective_backend_type: None,
            needs_backend_installation: false,
            version: None,
            backend: None,
        });
    }

    let (version, backend) = validate_backend_string(value)?;
    let effective = map_old_backend_to_new(&backend);
    let backend_type_updated = current_stored_backend != Some(effective.as_str());

    log::info!(
        "Setting update for version_backend: {}/{} (effective: {})",
        version,
        backend,
        effective
    );

    Ok(SettingUpdateResult {
        backend_type_updated,
        effective_backend_type: Some(effective),
        needs_backend_installation: true,
        version: Some(version),
        backend: Some(backend),
    })
}

/// Merge remote and local lists, dropping duplicates. Newest version first,
/// ties ordered by backend name.
pub fn list_supported_backends(remote: &[BackendInfo], local: &[BackendInfo]) -> Vec<BackendInfo> {
    let mut merged: HashMap<(&str, &str), &BackendInfo> = HashMap::new();
    for info in remote.iter().chain(local) {
        merged.insert((info.version.as_str(), info.backend.as_str()), info);
    }

    let mut list: Vec<BackendInfo> = merged.into_values().cloned().collect();
    list.sort_by(|a, b| newest_first(a, b).then_with(|| a.backend.cmp(&b.backend)));
    list
}

/// Scan `<backends_dir>/<version>/<backend>/` for builds containing a server binary
pub fn get_local_installed_backends(backends_dir: &Path) -> Result<Vec<InstalledBackend>> {
    let mut installed = Vec::new();
    if !backends_dir.is_dir() {
        return Ok(installed);
    }

    for version_entry in fs::read_dir(backends_dir)? {
        let version_path = version_entry?.path();
        if !version_path.is_dir() {
            continue;
        }
        let Some(version) = version_path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };

        for backend_entry in fs::read_dir(&version_path)? {
            let backend_path = backend_entry?.path();
            if !backend_path.is_dir() || server_binary_path(&backend_path).is_err() {
                continue;
            }
            if let Some(backend) = backend_path.file_name() {
                installed.push(BackendInfo::new(
                    version.clone(),
                    backend.to_string_lossy().into_owned(),
                ));
            }
        }
    }

    installed.sort_by(|a, b| newest_first(a, b).then_with(|| a.backend.cmp(&b.backend)));
    Ok(installed)
}

/// Delete installed copies of `backend_type` in every version except
/// `latest_version`. Returns the removed directories.
pub fn remove_old_backend_versions(
    backends_dir: &Path,
    latest_version: &str,
    backend_type: &str,
) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    if !backends_dir.is_dir() {
        return Ok(removed);
    }

    for version_entry in fs::read_dir(backends_dir)? {
        let version_path = version_entry?.path();
        if version_path.file_name().is_some_and(|n| n == latest_version) {
            continue;
        }

        let backend_path = version_path.join(backend_type);
        if !backend_path.is_dir() || server_binary_path(&backend_path).is_err() {
            continue;
        }

        match fs::remove_dir_all(&backend_path) {
            Ok(()) => {
                log::info!("Removed old version of {}: {}", backend_type, backend_path.display());
                removed.push(backend_path.to_string_lossy().into_owned());
            }
            Err(e) => {
                log::warn!(
                    "Failed to remove old backend version {}: {}",
                    backend_path.display(),
                    e
                );
            }
        }
    }

    Ok(removed)
}
