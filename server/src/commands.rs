//! Command surface exposed to callers.
//!
//! [`Orchestrator`] bundles the session manager with a hardware probe and
//! forwards each command to the crate that implements it. Errors from the
//! lower crates come back as [`ServerError`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use common::LlamacppConfig;
use gguf_loader::{
    BackendInfo, BackendSelection, BackendTier, GgufMetadata, KvCacheEstimate, ModelMode,
    ModelPlan, ModelSupport, SupportedFeatures,
};
use llamactl_hardware::{DeviceInfo, HardwareProbe, SystemProbe};

use crate::error::{ServerError, ServerResult};
use crate::session::{LoadRequest, SessionInfo, SessionManager, UnloadResult};

/// Installed backend chosen for this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedBackend {
    pub backend: BackendInfo,
    pub tier: BackendTier,
    pub binary_path: PathBuf,
}

pub struct Orchestrator {
    sessions: SessionManager,
    probe: Arc<dyn HardwareProbe>,
}

impl Orchestrator {
    pub fn new(api_secret: impl Into<String>, probe: Arc<dyn HardwareProbe>) -> Self {
        Self {
            sessions: SessionManager::new(api_secret),
            probe,
        }
    }

    /// Plans against what the OS reports
    pub fn with_system_probe(api_secret: impl Into<String>) -> Self {
        Self::new(api_secret, Arc::new(SystemProbe))
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    // ========== Sessions ==========

    pub async fn load_llama_model(&self, request: LoadRequest) -> ServerResult<SessionInfo> {
        self.sessions.load_llama_model(request).await
    }

    pub async fn unload_llama_model(&self, pid: u32) -> UnloadResult {
        self.sessions.unload_llama_model(pid).await
    }

    pub async fn is_process_running(&self, pid: u32) -> bool {
        self.sessions.is_process_running(pid).await
    }

    pub async fn get_random_port(&self) -> ServerResult<u16> {
        self.sessions.get_random_port().await
    }

    pub async fn find_session_by_model(&self, model_id: &str) -> Option<SessionInfo> {
        self.sessions.find_session_by_model(model_id).await
    }

    pub async fn get_session_by_model(&self, model_id: &str) -> Option<SessionInfo> {
        self.sessions.get_session_by_model(model_id).await
    }

    pub async fn get_loaded_models(&self) -> Vec<String> {
        self.sessions.get_loaded_models().await
    }

    pub async fn get_all_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.get_all_sessions().await
    }

    pub async fn cleanup_llama_processes(&self) -> usize {
        self.sessions.cleanup_llama_processes().await
    }

    pub fn generate_api_key(&self, model_id: &str, api_secret: &str) -> ServerResult<String> {
        crate::api_key::generate_api_key(model_id, api_secret)
    }

    // ========== Hardware ==========

    pub async fn get_devices(
        &self,
        backend_path: &Path,
        library_path: Option<&Path>,
    ) -> ServerResult<Vec<DeviceInfo>> {
        Ok(llamactl_hardware::get_devices(backend_path, library_path).await?)
    }

    // ========== Models ==========

    pub async fn read_gguf_metadata(&self, path: &Path) -> ServerResult<GgufMetadata> {
        Ok(gguf_loader::read_gguf_metadata_async(path).await?)
    }

    pub async fn estimate_kv_cache_size(
        &self,
        path: &Path,
        ctx_size: Option<u64>,
    ) -> ServerResult<KvCacheEstimate> {
        let meta = gguf_loader::read_gguf_metadata_async(path).await?;
        Ok(gguf_loader::estimate_kv_cache_size(&meta, ctx_size)?)
    }

    pub async fn get_model_size(&self, path: &Path) -> ServerResult<u64> {
        Ok(gguf_loader::get_model_size(path).await?)
    }

    pub async fn is_model_supported(
        &self,
        path: &Path,
        ctx_size: Option<u64>,
    ) -> ServerResult<ModelSupport> {
        Ok(gguf_loader::is_model_supported(self.probe.as_ref(), path, ctx_size).await?)
    }

    pub async fn plan_model_load(
        &self,
        path: &Path,
        memory_mode: &str,
        mmproj_path: Option<&Path>,
        requested_ctx: Option<u64>,
    ) -> ServerResult<ModelPlan> {
        Ok(gguf_loader::plan_model_load(
            self.probe.as_ref(),
            path,
            memory_mode,
            mmproj_path,
            requested_ctx,
        )
        .await?)
    }

    // ========== Backends ==========

    /// Pick the best installed backend under `backends_dir` for this host.
    ///
    /// Newer versions win within the same tier.
    pub async fn resolve_backend(&self, backends_dir: &Path) -> ServerResult<ResolvedBackend> {
        let installed = gguf_loader::get_local_installed_backends(backends_dir)?;
        if installed.is_empty() {
            return Err(ServerError::BackendNotFound(format!(
                "no backends installed under {}",
                backends_dir.display()
            )));
        }
        let features = detect_supported_features().await?;
        select_installed_backend(backends_dir, &installed, &features)
    }
}

/// Capabilities of this machine, in the terms backends are described in
pub async fn detect_supported_features() -> ServerResult<SupportedFeatures> {
    let system = tokio::task::spawn_blocking(llamactl_hardware::detect_system)
        .await
        .map_err(|e| ServerError::ProbeFailed(format!("hardware detection task failed: {}", e)))??;

    Ok(gguf_loader::get_supported_features(
        &system.os.name,
        system.cpu.extensions.as_slice(),
        &system.gpus,
    ))
}

/// Best entry of `installed` (newest first) that `features` can run
pub fn select_installed_backend(
    backends_dir: &Path,
    installed: &[BackendInfo],
    features: &SupportedFeatures,
) -> ServerResult<ResolvedBackend> {
    let candidates: Vec<(String, gguf_loader::BackendFeatures)> = installed
        .iter()
        .map(|info| (info.backend_string(), gguf_loader::features_for_backend(&info.backend)))
        .collect();

    match gguf_loader::select_best_backend(features, &candidates) {
        BackendSelection::Selected { name, tier } => {
            let backend = installed
                .iter()
                .find(|info| info.backend_string() == name)
                .cloned()
                .ok_or_else(|| ServerError::NotFound(name.clone()))?;
            let dir = backends_dir.join(&backend.version).join(&backend.backend);
            let binary_path = gguf_loader::server_binary_path(&dir)?;
            info!("Resolved backend {} -> {}", name, binary_path.display());
            Ok(ResolvedBackend {
                backend,
                tier,
                binary_path,
            })
        }
        BackendSelection::Unsupported => Err(ServerError::BackendNotFound(format!(
            "no installed backend under {} runs on this machine",
            backends_dir.display()
        ))),
    }
}

/// Write a plan's decisions into the run configuration
pub fn apply_plan(config: &mut LlamacppConfig, plan: &ModelPlan) -> ServerResult<()> {
    if plan.mode == ModelMode::Unsupported {
        return Err(ServerError::InvalidArgument(
            "model does not fit in the available memory".to_string(),
        ));
    }

    let to_i32 = |value: u64| i32::try_from(value).unwrap_or(i32::MAX);
    config.n_gpu_layers = to_i32(plan.gpu_layers);
    config.ctx_size = to_i32(plan.max_context_length);
    config.no_kv_offload = plan.no_offload_kv_cache;
    config.offload_mmproj = plan.offload_mmproj;
    config.batch_size = to_i32(plan.batch_size);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn install(dir: &Path, version: &str, backend: &str) {
        let bin = dir.join(version).join(backend);
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(bin.join(common::platform::server_executable_name()), b"").unwrap();
    }

    #[test]
    fn test_select_installed_backend_prefers_tier_then_version() {
        let dir = tempfile::tempdir().unwrap();
        install(dir.path(), "b7000", "linux-cuda-12-common_cpus-x64");
        install(dir.path(), "b7500", "linux-vulkan-common_cpus-x64");
        install(dir.path(), "b7500", "linux-common_cpus-x64");
        install(dir.path(), "b7600", "linux-common_cpus-x64");

        let installed = gguf_loader::get_local_installed_backends(dir.path()).unwrap();
        let features = SupportedFeatures {
            cuda12: true,
            ..Default::default()
        };
        let resolved = select_installed_backend(dir.path(), &installed, &features).unwrap();
        assert_eq!(resolved.backend.backend, "linux-cuda-12-common_cpus-x64");
        assert_eq!(resolved.tier, BackendTier::Cuda12);

        let cpu_only = select_installed_backend(dir.path(), &installed, &SupportedFeatures::default())
            .unwrap();
        assert_eq!(cpu_only.backend.backend_string(), "b7600/linux-common_cpus-x64");
    }

    #[test]
    fn test_select_installed_backend_none() {
        let dir = tempfile::tempdir().unwrap();
        let err = select_installed_backend(dir.path(), &[], &SupportedFeatures::default()).unwrap_err();
        assert!(matches!(err, ServerError::BackendNotFound(_)));
    }

    #[test]
    fn test_apply_plan() {
        let mut config = LlamacppConfig::default();
        let plan = ModelPlan {
            gpu_layers: 12,
            max_context_length: 4096,
            no_offload_kv_cache: true,
            offload_mmproj: false,
            batch_size: 256,
            mode: ModelMode::Hybrid,
        };
        apply_plan(&mut config, &plan).unwrap();
        assert_eq!(config.n_gpu_layers, 12);
        assert_eq!(config.ctx_size, 4096);
        assert!(config.no_kv_offload);
        assert!(!config.offload_mmproj);
        assert_eq!(config.batch_size, 256);

        assert!(apply_plan(&mut config, &ModelPlan::unsupported()).is_err());
    }
}
