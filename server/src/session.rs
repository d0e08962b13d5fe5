//! Session registry and lifecycle of `llama-server` processes.
//!
//! Per model id a session moves `Absent → Starting → Running → Absent`, or
//! drops out of `Running` when the process dies on its own. The registry
//! lock is only taken to reserve a slot, to commit or release it, and for
//! reads. It is never held while spawning or waiting for readiness.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, PoisonError};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use common::{ArgumentBuilder, LlamacppConfig};

use crate::api_key::generate_api_key;
use crate::error::{ServerError, ServerResult};
use crate::paths::{library_dirs_for, validate_binary_path, validate_mmproj_path, validate_model_path};
use crate::ports::{is_port_free, pick_random_port, PortReservations};
use crate::process::{is_pid_alive, spawn_output_reader, terminate_child, wait_for_ready};

pub const API_KEY_ENV: &str = "LLAMA_API_KEY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub pid: u32,
    pub port: u16,
    pub model_id: String,
    pub model_path: String,
    pub is_embedding: bool,
    pub api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mmproj_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnloadResult {
    pub success: bool,
    pub error: Option<String>,
}

/// Everything needed to start one server
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub backend_path: PathBuf,
    pub model_id: String,
    pub model_path: PathBuf,
    pub port: u16,
    pub config: LlamacppConfig,
    pub envs: HashMap<String, String>,
    pub mmproj_path: Option<PathBuf>,
    pub is_embedding: bool,
    pub timeout: Duration,
}

struct LlamaSession {
    child: Child,
    info: SessionInfo,
}

/// Model id → port of loads in flight.
///
/// Kept behind its own lock so a dropped load can release its slot
/// synchronously, even while the registry lock is held elsewhere.
#[derive(Clone, Default)]
struct StartingSlots(Arc<StdMutex<HashMap<String, u16>>>);

impl StartingSlots {
    fn slots(&self) -> StdMutexGuard<'_, HashMap<String, u16>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, model_id: &str, port: u16) {
        self.slots().insert(model_id.to_string(), port);
    }

    fn remove(&self, model_id: &str) {
        self.slots().remove(model_id);
    }

    fn has_model(&self, model_id: &str) -> bool {
        self.slots().contains_key(model_id)
    }

    fn ports(&self) -> Vec<u16> {
        self.slots().values().copied().collect()
    }

    fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<u32, LlamaSession>,
    starting: StartingSlots,
    reservations: PortReservations,
}

impl Registry {
    /// Drop sessions whose process has exited (Crashed → Absent)
    fn reap_exited(&mut self) {
        self.sessions.retain(|pid, session| match session.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(
                    "Model '{}' (PID {}) exited on its own: {}",
                    session.info.model_id, pid, status
                );
                false
            }
            Err(e) => {
                warn!("Failed to poll PID {}: {}", pid, e);
                true
            }
        });
    }

    fn model_busy(&self, model_id: &str) -> bool {
        self.starting.has_model(model_id)
            || self.sessions.values().any(|s| s.info.model_id == model_id)
    }

    fn used_ports(&self) -> HashSet<u16> {
        self.starting
            .ports()
            .into_iter()
            .chain(self.sessions.values().map(|s| s.info.port))
            .collect()
    }

    fn sorted_infos(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.values().map(|s| s.info.clone()).collect();
        infos.sort_by(|a, b| a.model_id.cmp(&b.model_id).then(a.pid.cmp(&b.pid)));
        infos
    }
}

/// Releases a `Starting` slot unless the load committed it
struct StartingGuard {
    starting: StartingSlots,
    model_id: Option<String>,
}

impl StartingGuard {
    fn commit(mut self, registry: &mut Registry, session: LlamaSession) {
        if let Some(model_id) = self.model_id.take() {
            self.starting.remove(&model_id);
        }
        registry.sessions.insert(session.info.pid, session);
    }
}

impl Drop for StartingGuard {
    fn drop(&mut self) {
        if let Some(model_id) = self.model_id.take() {
            debug!("Releasing start reservation for '{}'", model_id);
            self.starting.remove(&model_id);
        }
    }
}

/// Owns every running `llama-server` child.
///
/// Cloning shares the registry. Children are spawned with `kill_on_drop`, so
/// dropping the last clone kills whatever is still running.
#[derive(Clone)]
pub struct SessionManager {
    registry: Arc<Mutex<Registry>>,
    api_secret: Arc<str>,
}

impl SessionManager {
    pub fn new(api_secret: impl Into<String>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            api_secret: Arc::from(api_secret.into()),
        }
    }

    /// Reserve the model id and port for a load in flight
    async fn begin_start(&self, model_id: &str, port: u16) -> ServerResult<StartingGuard> {
        let mut registry = self.registry.lock().await;
        registry.reap_exited();

        if registry.model_busy(model_id) {
            return Err(ServerError::AlreadyRunning(model_id.to_string()));
        }
        if registry.used_ports().contains(&port) {
            return Err(ServerError::PortInUse(port));
        }
        // A port from get_random_port is reserved for exactly this use
        registry.reservations.release(port);
        if !is_port_free(port) {
            return Err(ServerError::PortInUse(port));
        }

        registry.starting.insert(model_id, port);
        Ok(StartingGuard {
            starting: registry.starting.clone(),
            model_id: Some(model_id.to_string()),
        })
    }

    /// Start a server for `request.model_id` and wait until it is ready.
    ///
    /// Dropping the returned future kills the child and frees the slot.
    pub async fn load_llama_model(&self, request: LoadRequest) -> ServerResult<SessionInfo> {
        let LoadRequest {
            backend_path,
            model_id,
            model_path,
            port,
            config,
            envs,
            mmproj_path,
            is_embedding,
            timeout,
        } = request;

        info!("Attempting to launch server at path: {:?}", backend_path);
        let guard = self.begin_start(&model_id, port).await?;

        let bin_path = validate_binary_path(&backend_path)?;
        let model_path = validate_model_path(&model_path)?;
        let mmproj_path = validate_mmproj_path(mmproj_path.as_deref())?;

        let env_overrides = config.env_overrides()?;
        let model_path_str = model_path.display().to_string();
        let mmproj_str = mmproj_path.as_ref().map(|p| p.display().to_string());
        let args = ArgumentBuilder::new(config, is_embedding)?.build(
            &model_id,
            &model_path_str,
            port,
            mmproj_str.as_deref(),
        );
        info!("Generated arguments: {:?}", args);

        let api_key = match envs.get(API_KEY_ENV) {
            Some(key) => key.clone(),
            None => generate_api_key(&model_id, &self.api_secret)?,
        };

        let lib_dirs = library_dirs_for(&bin_path);
        let lib_refs: Vec<&Path> = lib_dirs.iter().map(PathBuf::as_path).collect();
        let (lib_var, lib_value) = common::platform::library_search_path(&lib_refs);

        let mut command = Command::new(&bin_path);
        command
            .args(&args)
            .envs(&envs)
            .envs(env_overrides)
            .env(API_KEY_ENV, &api_key)
            .env(lib_var, lib_value)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ServerError::SpawnFailed(format!("{}: {}", bin_path.display(), e)))?;

        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ServerError::SpawnFailed("stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ServerError::SpawnFailed("stderr was not captured".to_string()))?;
        let _stdout_task = spawn_output_reader(stdout, ready_tx.clone());
        let stderr_task = spawn_output_reader(stderr, ready_tx);

        wait_for_ready(&mut child, &mut ready_rx, stderr_task, timeout).await?;

        let pid = child
            .id()
            .ok_or_else(|| ServerError::ProcessExited("process exited right after startup".to_string()))?;
        info!("Server process started with PID: {} and is ready", pid);

        let info = SessionInfo {
            pid,
            port,
            model_id,
            model_path: model_path_str,
            is_embedding,
            api_key,
            mmproj_path: mmproj_str,
        };

        let mut registry = self.registry.lock().await;
        guard.commit(
            &mut registry,
            LlamaSession {
                child,
                info: info.clone(),
            },
        );
        Ok(info)
    }

    /// Stop the session with this pid. The entry is removed even when
    /// stopping fails.
    pub async fn unload_llama_model(&self, pid: u32) -> UnloadResult {
        let session = self.registry.lock().await.sessions.remove(&pid);

        let Some(mut session) = session else {
            warn!("No session with PID {} to unload", pid);
            return UnloadResult {
                success: false,
                error: Some(format!("NotFound: no session with PID {}", pid)),
            };
        };

        info!("Unloading model '{}' (PID {})", session.info.model_id, pid);
        match terminate_child(&mut session.child).await {
            Ok(()) => UnloadResult {
                success: true,
                error: None,
            },
            Err(e) => UnloadResult {
                success: false,
                error: Some(e.to_string()),
            },
        }
    }

    /// Registered sessions are checked through their child handle, which
    /// also drops any that exited. Other pids are looked up in the process
    /// table.
    pub async fn is_process_running(&self, pid: u32) -> bool {
        {
            let mut registry = self.registry.lock().await;
            registry.reap_exited();
            if registry.sessions.contains_key(&pid) {
                return true;
            }
        }
        is_pid_alive(pid)
    }

    /// Registry with exited sessions already removed
    async fn live_registry(&self) -> MutexGuard<'_, Registry> {
        let mut registry = self.registry.lock().await;
        registry.reap_exited();
        registry
    }

    /// Random free port, reserved so concurrent callers get distinct ports
    pub async fn get_random_port(&self) -> ServerResult<u16> {
        let mut registry = self.live_registry().await;
        registry.reservations.purge_expired();
        let used = registry.used_ports();

        let reservations = &registry.reservations;
        let port = pick_random_port(|port| used.contains(&port) || reservations.contains(port))
            .ok_or(ServerError::NoPortAvailable)?;

        registry.reservations.reserve(port);
        debug!("Reserved port {}", port);
        Ok(port)
    }

    pub async fn find_session_by_model(&self, model_id: &str) -> Option<SessionInfo> {
        self.live_registry()
            .await
            .sessions
            .values()
            .find(|s| s.info.model_id == model_id)
            .map(|s| s.info.clone())
    }

    pub async fn get_session_by_model(&self, model_id: &str) -> Option<SessionInfo> {
        self.find_session_by_model(model_id).await
    }

    /// Model ids of running sessions, sorted
    pub async fn get_loaded_models(&self) -> Vec<String> {
        self.live_registry()
            .await
            .sorted_infos()
            .into_iter()
            .map(|info| info.model_id)
            .collect()
    }

    /// All running sessions, sorted by model id
    pub async fn get_all_sessions(&self) -> Vec<SessionInfo> {
        self.live_registry().await.sorted_infos()
    }

    /// Stop every tracked process and clear the registry.
    ///
    /// Returns how many sessions were stopped.
    pub async fn cleanup_llama_processes(&self) -> usize {
        let sessions: Vec<LlamaSession> = {
            let mut registry = self.registry.lock().await;
            registry.reservations.clear();
            registry.sessions.drain().map(|(_, session)| session).collect()
        };

        if sessions.is_empty() {
            debug!("No llama.cpp processes to clean up");
            return 0;
        }

        let count = sessions.len();
        info!("Cleaning up {} llama.cpp process(es)", count);
        let mut stops = JoinSet::new();
        for mut session in sessions {
            stops.spawn(async move {
                if let Err(e) = terminate_child(&mut session.child).await {
                    warn!("Failed to stop PID {}: {}", session.info.pid, e);
                }
            });
        }
        while stops.join_next().await.is_some() {}
        count
    }
}
