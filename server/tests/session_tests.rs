//! Session lifecycle against fake `llama-server` scripts
//!
//! The scripts ignore their arguments and only mimic the output and exit
//! behaviour of the real server.

#![cfg(unix)]

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use common::LlamacppConfig;
use llamactl_server::{generate_api_key, LoadRequest, ServerError, SessionManager};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};

/// Spawning right after writing a script can hit ETXTBSY if another test
/// forks meanwhile, so tests that write scripts run one at a time.
static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

const READY_SCRIPT: &str = r#"#!/bin/sh
echo "main: loading model"
echo "main: server is listening on http://127.0.0.1:8080 - starting the main loop" >&2
exec sleep 30
"#;

const SILENT_SCRIPT: &str = r#"#!/bin/sh
echo $$ > "$0.pid"
echo "llama_model_loader: still loading..."
exec sleep 30
"#;

const OOM_SCRIPT: &str = r#"#!/bin/sh
echo "ggml_backend_cuda_buffer_type_alloc_buffer: allocating 9000 MiB on device 0: cudaMalloc failed: out of memory" >&2
exit 1
"#;

const STUBBORN_SCRIPT: &str = r#"#!/bin/sh
trap '' TERM
echo "srv  update_slots: all slots are idle"
while true; do sleep 1; done
"#;

/// Gone or a zombie nobody has reaped yet
fn process_gone(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .map_or(true, |process| process.status() == ProcessStatus::Zombie)
}

async fn wait_until_gone(pid: u32) -> bool {
    for _ in 0..60 {
        if process_gone(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

struct Fixture {
    dir: tempfile::TempDir,
    model: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("model.gguf");
        std::fs::write(&model, b"GGUF").unwrap();
        Self { dir, model }
    }

    fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn request(&self, backend: &Path, model_id: &str, port: u16) -> LoadRequest {
        let config = LlamacppConfig {
            version_backend: "b7523/linux-common_cpus-x64".to_string(),
            ..Default::default()
        };
        LoadRequest {
            backend_path: backend.to_path_buf(),
            model_id: model_id.to_string(),
            model_path: self.model.clone(),
            port,
            config,
            envs: HashMap::new(),
            mmproj_path: None,
            is_embedding: false,
            timeout: Duration::from_secs(10),
        }
    }
}

#[tokio::test]
async fn test_load_query_unload() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let backend = fx.script("llama-server", READY_SCRIPT);
    let manager = SessionManager::new("secret");

    let port = manager.get_random_port().await.unwrap();
    let info = manager
        .load_llama_model(fx.request(&backend, "llama3", port))
        .await
        .unwrap();
    println!("✅ Loaded: {:?}", info);

    assert_eq!(info.model_id, "llama3");
    assert_eq!(info.port, port);
    assert_eq!(info.api_key, generate_api_key("llama3", "secret").unwrap());
    assert_eq!(info.mmproj_path, None);

    assert!(manager.is_process_running(info.pid).await);
    assert_eq!(manager.get_loaded_models().await, vec!["llama3".to_string()]);
    assert_eq!(manager.find_session_by_model("llama3").await, Some(info.clone()));
    assert_eq!(manager.get_session_by_model("llama3").await, Some(info.clone()));

    let result = manager.unload_llama_model(info.pid).await;
    assert!(result.success, "unload failed: {:?}", result.error);
    assert!(manager.get_all_sessions().await.is_empty());
    assert!(!manager.is_process_running(info.pid).await);
}

#[tokio::test]
async fn test_second_load_of_same_model_is_rejected() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let backend = fx.script("llama-server", READY_SCRIPT);
    let manager = SessionManager::new("secret");

    let port = manager.get_random_port().await.unwrap();
    let first = manager
        .load_llama_model(fx.request(&backend, "qwen", port))
        .await
        .unwrap();

    let other_port = manager.get_random_port().await.unwrap();
    let err = manager
        .load_llama_model(fx.request(&backend, "qwen", other_port))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::AlreadyRunning(ref id) if id == "qwen"));

    // The running session is untouched
    assert_eq!(manager.get_all_sessions().await, vec![first]);
    assert_eq!(manager.cleanup_llama_processes().await, 1);
}

#[tokio::test]
async fn test_port_of_running_session_is_rejected() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let backend = fx.script("llama-server", READY_SCRIPT);
    let manager = SessionManager::new("secret");

    let port = manager.get_random_port().await.unwrap();
    manager
        .load_llama_model(fx.request(&backend, "a", port))
        .await
        .unwrap();

    let err = manager
        .load_llama_model(fx.request(&backend, "b", port))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::PortInUse(p) if p == port));
    manager.cleanup_llama_processes().await;
}

#[tokio::test]
async fn test_bound_port_is_rejected() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let backend = fx.script("llama-server", READY_SCRIPT);
    let manager = SessionManager::new("secret");

    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let err = manager
        .load_llama_model(fx.request(&backend, "a", port))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::PortInUse(_)));
}

#[tokio::test]
async fn test_startup_timeout_kills_child_and_frees_slot() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let silent = fx.script("silent-server", SILENT_SCRIPT);
    let ready = fx.script("llama-server", READY_SCRIPT);
    let manager = SessionManager::new("secret");

    let port = manager.get_random_port().await.unwrap();
    let mut request = fx.request(&silent, "slow", port);
    request.timeout = Duration::from_secs(1);

    let started = Instant::now();
    let err = manager.load_llama_model(request).await.unwrap_err();
    match err {
        ServerError::StartupTimeout { secs, ref stderr } => {
            assert_eq!(secs, 1);
            println!("⏱️ Timed out after {:?}, output: {}", started.elapsed(), stderr);
        }
        other => panic!("expected StartupTimeout, got {:?}", other),
    }
    assert!(manager.get_all_sessions().await.is_empty());

    // The model id can be loaded again
    let info = manager
        .load_llama_model(fx.request(&ready, "slow", port))
        .await
        .unwrap();
    assert_eq!(info.model_id, "slow");
    manager.cleanup_llama_processes().await;
}

#[tokio::test]
async fn test_early_exit_is_classified() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let backend = fx.script("oom-server", OOM_SCRIPT);
    let manager = SessionManager::new("secret");

    let port = manager.get_random_port().await.unwrap();
    let err = manager
        .load_llama_model(fx.request(&backend, "big", port))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::OutOfMemory(ref out) if out.contains("cudaMalloc")));
    assert!(manager.get_loaded_models().await.is_empty());
}

#[tokio::test]
async fn test_missing_paths() {
    let fx = Fixture::new();
    let manager = SessionManager::new("secret");
    let port = manager.get_random_port().await.unwrap();

    let err = manager
        .load_llama_model(fx.request(&fx.dir.path().join("nope"), "m", port))
        .await
        .unwrap_err();
    assert!(matches!(err, ServerError::BackendNotFound(_)));

    let _serial = SERIAL.lock().await;
    let backend = fx.script("llama-server", READY_SCRIPT);
    let mut request = fx.request(&backend, "m", port);
    request.model_path = fx.dir.path().join("missing.gguf");
    let err = manager.load_llama_model(request).await.unwrap_err();
    assert!(matches!(err, ServerError::FileNotFound(_)));

    let mut request = fx.request(&backend, "m", port);
    request.mmproj_path = Some(fx.dir.path().join("missing-mmproj.gguf"));
    let err = manager.load_llama_model(request).await.unwrap_err();
    assert!(matches!(err, ServerError::FileNotFound(_)));
}

#[tokio::test]
async fn test_api_key_from_envs_wins() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let backend = fx.script("llama-server", READY_SCRIPT);
    let manager = SessionManager::new("secret");

    let port = manager.get_random_port().await.unwrap();
    let mut request = fx.request(&backend, "keyed", port);
    request
        .envs
        .insert("LLAMA_API_KEY".to_string(), "caller-key".to_string());
    let info = manager.load_llama_model(request).await.unwrap();
    assert_eq!(info.api_key, "caller-key");
    manager.cleanup_llama_processes().await;
}

#[tokio::test]
async fn test_cleanup_stops_everything() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let backend = fx.script("llama-server", READY_SCRIPT);
    let manager = SessionManager::new("secret");

    let mut pids = Vec::new();
    for model_id in ["zeta", "alpha"] {
        let port = manager.get_random_port().await.unwrap();
        let info = manager
            .load_llama_model(fx.request(&backend, model_id, port))
            .await
            .unwrap();
        pids.push(info.pid);
    }
    assert_eq!(
        manager.get_loaded_models().await,
        vec!["alpha".to_string(), "zeta".to_string()]
    );

    assert_eq!(manager.cleanup_llama_processes().await, 2);
    assert!(manager.get_all_sessions().await.is_empty());
    for pid in pids {
        assert!(!manager.is_process_running(pid).await);
    }
    assert_eq!(manager.cleanup_llama_processes().await, 0);
}

#[tokio::test]
async fn test_unload_force_kills_after_grace_period() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let backend = fx.script("stubborn-server", STUBBORN_SCRIPT);
    let manager = SessionManager::new("secret");

    let port = manager.get_random_port().await.unwrap();
    let info = manager
        .load_llama_model(fx.request(&backend, "stubborn", port))
        .await
        .unwrap();

    let started = Instant::now();
    let result = manager.unload_llama_model(info.pid).await;
    assert!(result.success);
    assert!(started.elapsed() >= Duration::from_secs(4));
    assert!(manager.get_all_sessions().await.is_empty());
}

#[tokio::test]
async fn test_concurrent_port_requests_are_distinct() {
    let manager = SessionManager::new("secret");
    let handles: Vec<_> = (0..16)
        .map(|_| {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_random_port().await.unwrap() })
        })
        .collect();

    let mut ports = Vec::new();
    for handle in handles {
        ports.push(handle.await.unwrap());
    }
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 16);
}

#[tokio::test]
async fn test_crashed_session_leaves_registry() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let backend = fx.script("llama-server", READY_SCRIPT);
    let manager = SessionManager::new("secret");

    let port = manager.get_random_port().await.unwrap();
    let info = manager
        .load_llama_model(fx.request(&backend, "m1", port))
        .await
        .unwrap();

    let status = std::process::Command::new("kill")
        .args(["-9", &info.pid.to_string()])
        .status()
        .unwrap();
    assert!(status.success());

    let mut sessions = manager.get_all_sessions().await;
    for _ in 0..40 {
        if sessions.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        sessions = manager.get_all_sessions().await;
    }
    assert!(sessions.is_empty(), "crashed session still listed: {:?}", sessions);
    assert!(manager.get_loaded_models().await.is_empty());
    assert_eq!(manager.find_session_by_model("m1").await, None);

    // The model id is free again
    let port = manager.get_random_port().await.unwrap();
    let reloaded = manager
        .load_llama_model(fx.request(&backend, "m1", port))
        .await
        .unwrap();
    assert_ne!(reloaded.pid, info.pid);
    manager.cleanup_llama_processes().await;
}

#[tokio::test]
async fn test_cancelled_load_kills_child_and_frees_slot() {
    let _serial = SERIAL.lock().await;
    let fx = Fixture::new();
    let silent = fx.script("silent-server", SILENT_SCRIPT);
    let ready = fx.script("llama-server", READY_SCRIPT);
    let manager = SessionManager::new("secret");

    let port = manager.get_random_port().await.unwrap();
    let load = manager.load_llama_model(fx.request(&silent, "cancelled", port));
    let outcome = tokio::time::timeout(Duration::from_millis(800), load).await;
    assert!(outcome.is_err(), "load should still be waiting for readiness");

    let pid: u32 = std::fs::read_to_string(fx.dir.path().join("silent-server.pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(wait_until_gone(pid).await, "PID {} survived the cancelled load", pid);
    assert!(manager.get_all_sessions().await.is_empty());

    let info = manager
        .load_llama_model(fx.request(&ready, "cancelled", port))
        .await
        .unwrap();
    assert_eq!(info.model_id, "cancelled");
    manager.cleanup_llama_processes().await;
}
