/*!
CPU Detection

Vendor, model and the SIMD extensions that decide which llama.cpp CPU build
can run.
*/

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::constants::*;
use crate::{HardwareError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuVendor {
    Intel,
    Amd,
    Apple,
    Unknown,
}

impl CpuVendor {
    fn from_brand(brand: &str) -> Self {
        let brand = brand.to_lowercase();
        if brand.contains(CPU_KEYWORD_INTEL) || brand.contains("genuineintel") {
            Self::Intel
        } else if brand.contains(CPU_KEYWORD_AMD) || brand.contains("authenticamd") {
            Self::Amd
        } else if brand.contains(CPU_KEYWORD_APPLE) {
            Self::Apple
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuInfo {
    pub vendor: CpuVendor,
    pub model_name: String,
    /// Logical processors
    pub threads: u32,
    /// Lower-case extension names, e.g. `avx2`, `avx512`
    pub extensions: Vec<String>,
}

impl CpuInfo {
    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|e| e == name)
    }
}

/// Detect the host CPU
pub fn detect_cpu() -> Result<CpuInfo> {
    let mut sys = System::new();
    sys.refresh_cpu_all();

    let cpus = sys.cpus();
    let first = cpus
        .first()
        .ok_or_else(|| HardwareError::CpuDetection("no CPUs reported".to_string()))?;

    let model_name = first.brand().trim().to_string();
    let vendor = match CpuVendor::from_brand(&model_name) {
        CpuVendor::Unknown => CpuVendor::from_brand(first.vendor_id()),
        vendor => vendor,
    };

    Ok(CpuInfo {
        vendor,
        model_name,
        threads: cpus.len() as u32,
        extensions: detect_extensions(),
    })
}

/// Runtime-detected instruction-set extensions relevant to llama.cpp builds
pub fn detect_extensions() -> Vec<String> {
    let mut extensions = Vec::new();

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        if std::arch::is_x86_feature_detected!("avx") {
            extensions.push(EXT_AVX.to_string());
        }
        if std::arch::is_x86_feature_detected!("avx2") {
            extensions.push(EXT_AVX2.to_string());
        }
        if std::arch::is_x86_feature_detected!("avx512f") {
            extensions.push(EXT_AVX512.to_string());
        }
        if std::arch::is_x86_feature_detected!("fma") {
            extensions.push(EXT_FMA.to_string());
        }
        if std::arch::is_x86_feature_detected!("f16c") {
            extensions.push(EXT_F16C.to_string());
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        if std::arch::is_aarch64_feature_detected!("neon") {
            extensions.push(EXT_NEON.to_string());
        }
    }

    extensions
}
