//! Backend variant selection.
//!
//! Every llama.cpp release ships several builds of `llama-server` per
//! platform (CUDA 11/12/13, Vulkan, plain CPU with different SIMD levels).
//! A build *requires* a set of host capabilities; the host *supports* a set.
//! The best build is the highest tier whose requirements are all met.
//!
//! # Precedence
//! 1. **CUDA 13**
//! 2. **CUDA 12**
//! 3. **CUDA 11**
//! 4. **Vulkan**
//! 5. **AVX-512**
//! 6. **AVX2**
//! 7. **AVX**
//! 8. **Baseline CPU**

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{GgufError, Result};

/// Capabilities a backend build needs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFeatures {
    pub avx: bool,
    pub avx2: bool,
    pub avx512: bool,
    pub cuda11: bool,
    pub cuda12: bool,
    pub cuda13: bool,
    pub vulkan: bool,
}

/// Capabilities the host offers. Same flags, opposite side of the match.
pub type SupportedFeatures = BackendFeatures;

impl BackendFeatures {
    /// Every flag set in `self` is also set in `host`
    pub fn satisfied_by(&self, host: &SupportedFeatures) -> bool {
        (!self.avx || host.avx)
            && (!self.avx2 || host.avx2)
            && (!self.avx512 || host.avx512)
            && (!self.cuda11 || host.cuda11)
            && (!self.cuda12 || host.cuda12)
            && (!self.cuda13 || host.cuda13)
            && (!self.vulkan || host.vulkan)
    }

    pub fn tier(&self) -> BackendTier {
        if self.cuda13 {
            BackendTier::Cuda13
        } else if self.cuda12 {
            BackendTier::Cuda12
        } else if self.cuda11 {
            BackendTier::Cuda11
        } else if self.vulkan {
            BackendTier::Vulkan
        } else if self.avx512 {
            BackendTier::Avx512
        } else if self.avx2 {
            BackendTier::Avx2
        } else if self.avx {
            BackendTier::Avx
        } else {
            BackendTier::Baseline
        }
    }
}

/// Ordered best-first: `Cuda13 < Cuda12 < ... < Baseline`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BackendTier {
    Cuda13,
    Cuda12,
    Cuda11,
    Vulkan,
    Avx512,
    Avx2,
    Avx,
    Baseline,
}

impl fmt::Display for BackendTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Cuda13 => "cuda13",
            Self::Cuda12 => "cuda12",
            Self::Cuda11 => "cuda11",
            Self::Vulkan => "vulkan",
            Self::Avx512 => "avx512",
            Self::Avx2 => "avx2",
            Self::Avx => "avx",
            Self::Baseline => "baseline",
        };
        f.write_str(name)
    }
}

/// Outcome of [`select_best_backend`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BackendSelection {
    Selected { name: String, tier: BackendTier },
    Unsupported,
}

impl BackendSelection {
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Selected { name, .. } => Some(name),
            Self::Unsupported => None,
        }
    }
}

/// Pick the highest-tier candidate the host can run.
///
/// Candidates in the same tier keep their input order. No eligible candidate
/// is a normal outcome on minimal hardware, not an error.
pub fn select_best_backend<S: AsRef<str>>(
    supported: &SupportedFeatures,
    candidates: &[(S, BackendFeatures)],
) -> BackendSelection {
    let best = candidates
        .iter()
        .filter(|(_, required)| required.satisfied_by(supported))
        .min_by_key(|(_, required)| required.tier());

    match best {
        Some((name, required)) => {
            log::info!(
                "Selected backend {} (tier {})",
                name.as_ref(),
                required.tier()
            );
            BackendSelection::Selected {
                name: name.as_ref().to_string(),
                tier: required.tier(),
            }
        }
        None => {
            log::warn!("No eligible backend among {} candidates", candidates.len());
            BackendSelection::Unsupported
        }
    }
}

/// Requirement flags implied by a release asset name such as
/// `linux-cuda-12-common_cpus-x64` or the legacy `win-avx2-cuda-cu12.0-x64`.
///
/// `common_cpus` builds dispatch SIMD at runtime and need nothing beyond a
/// baseline CPU.
pub fn features_for_backend(name: &str) -> BackendFeatures {
    let name = name.to_lowercase();
    let mut features = BackendFeatures::default();

    if name.contains("cuda-13") || name.contains("cu13") {
        features.cuda13 = true;
    } else if name.contains("cuda-12") || name.contains("cu12") {
        features.cuda12 = true;
    } else if name.contains("cuda-11") || name.contains("cu11") {
        features.cuda11 = true;
    }
    if name.contains("vulkan") {
        features.vulkan = true;
    }

    if !name.contains("common_cpus") && !name.contains("noavx") {
        if name.contains("avx512") {
            features.avx512 = true;
        } else if name.contains("avx2") {
            features.avx2 = true;
        } else if name.contains("avx") {
            features.avx = true;
        }
    }

    features
}

/// Location of the server executable inside an installed backend directory.
///
/// Releases unpack either to `build/bin/` or flat; both layouts are accepted.
pub fn server_binary_path(backend_dir: &Path) -> Result<PathBuf> {
    let exe = common::platform::server_executable_name();
    let candidates = [backend_dir.join("build").join("bin").join(exe), backend_dir.join(exe)];

    candidates
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| {
            GgufError::FileNotFound(format!(
                "{} not found under {}",
                exe,
                backend_dir.display()
            ))
        })
}
