//! GGUF Loader - model inspection and load planning for llama.cpp
//!
//! Nothing here runs inference. The crate answers the questions asked before
//! a `llama-server` process is started:
//!
//! - what does the model file say about itself ([`read_gguf_metadata`])
//! - how much memory will its KV cache take ([`estimate_kv_cache_size`])
//! - which backend build should run it ([`select_best_backend`], [`prioritize_backends`])
//! - how should layers and cache be split between GPU and RAM ([`plan_model_load`])
//!
//! # Backend Directory Structure
//!
//! ```text
//! backends/
//!   ├── b7523/
//!   │   ├── linux-common_cpus-x64/build/bin/llama-server
//!   │   └── linux-cuda-12-common_cpus-x64/build/bin/llama-server
//!   └── b7610/
//!       └── linux-vulkan-common_cpus-x64/llama-server
//! ```

pub mod backend;
pub mod error;
pub mod kv_cache;
pub mod planner;
pub mod reader;
pub mod variant;

pub use backend::{
    check_backend_for_updates, compare_versions, determine_supported_backends,
    find_latest_version_for_backend, get_local_installed_backends, get_supported_features,
    handle_setting_update, list_supported_backends, map_old_backend_to_new,
    prioritize_backends, remove_old_backend_versions, should_migrate_backend,
    validate_backend_string, BackendInfo, BestBackendResult, InstalledBackend,
    SettingUpdateResult, UpdateCheckResult,
};
pub use error::{GgufError, Result};
pub use kv_cache::{
    estimate_kv_cache_size, CacheType, KvCacheEstimate, KvCacheEstimator, KvCacheFormula,
    KvCacheTypes, MultiLatentAttention, StandardAttention,
};
pub use planner::{
    get_model_size, is_model_supported, plan_from_inputs, plan_model_load, support_from_plan,
    MemoryMode, ModelMode, ModelPlan, ModelSupport, PlanInputs,
};
pub use reader::{parse_gguf_metadata, read_gguf_metadata, read_gguf_metadata_async, GgufMetadata};
pub use variant::{
    features_for_backend, select_best_backend, server_binary_path, BackendFeatures,
    BackendSelection, BackendTier, SupportedFeatures,
};
