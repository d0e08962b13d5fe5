/*!
Hardware Detection Constants

Centralized constants for hardware detection to avoid string literals across crates.
*/

// ========== GPU Vendors ==========
pub const GPU_VENDOR_NVIDIA: &str = "NVIDIA";
pub const GPU_VENDOR_AMD: &str = "AMD";
pub const GPU_VENDOR_INTEL: &str = "Intel";
pub const GPU_VENDOR_APPLE: &str = "Apple";
pub const GPU_VENDOR_UNKNOWN: &str = "Unknown";

// ========== Detection Command Names ==========
pub const CMD_NVIDIA_SMI: &str = "nvidia-smi";
pub const CMD_LSPCI: &str = "lspci";
pub const CMD_SYSTEM_PROFILER: &str = "system_profiler";
pub const CMD_POWERSHELL: &str = "powershell";

// ========== nvidia-smi Query ==========
pub const NVIDIA_SMI_QUERY: &str = "--query-gpu=name,memory.total,memory.free,driver_version,compute_cap";
pub const NVIDIA_SMI_FORMAT: &str = "--format=csv,noheader,nounits";

// ========== Backend Device Listing ==========
pub const DEVICE_LIST_FLAG: &str = "--list-devices";
pub const DEVICE_LIST_HEADER: &str = "Available devices:";
pub const DEVICE_PROBE_TIMEOUT_SECS: u64 = 30;

// ========== Vulkan Loader Locations ==========
pub const VULKAN_LOADER_PATHS_LINUX: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/libvulkan.so.1",
    "/usr/lib/aarch64-linux-gnu/libvulkan.so.1",
    "/usr/lib64/libvulkan.so.1",
    "/usr/lib/libvulkan.so.1",
];
pub const VULKAN_LOADER_WINDOWS: &str = "vulkan-1.dll";

// ========== CPU Extensions ==========
pub const EXT_AVX: &str = "avx";
pub const EXT_AVX2: &str = "avx2";
pub const EXT_AVX512: &str = "avx512";
pub const EXT_FMA: &str = "fma";
pub const EXT_F16C: &str = "f16c";
pub const EXT_NEON: &str = "neon";

// ========== GPU Keywords for Classification ==========
pub const GPU_KEYWORD_NVIDIA: &str = "nvidia";
pub const GPU_KEYWORD_AMD: &str = "amd";
pub const GPU_KEYWORD_ATI: &str = "ati";
pub const GPU_KEYWORD_RADEON: &str = "radeon";
pub const GPU_KEYWORD_INTEL: &str = "intel";
pub const GPU_KEYWORD_APPLE: &str = "apple";

// ========== CPU Keywords ==========
pub const CPU_KEYWORD_INTEL: &str = "intel";
pub const CPU_KEYWORD_AMD: &str = "amd";
pub const CPU_KEYWORD_APPLE: &str = "apple";

// ========== Detection Keywords ==========
pub const KEYWORD_BASIC_DISPLAY: &str = "basic display";
pub const KEYWORD_MICROSOFT_BASIC: &str = "microsoft basic";
pub const KEYWORD_VGA: &str = "vga";
pub const KEYWORD_3D: &str = "3d";
