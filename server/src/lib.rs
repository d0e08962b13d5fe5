//! llamactl server - lifecycle of local `llama-server` processes
//!
//! Planning decides *how* a model should be loaded; this crate does the
//! loading. It spawns one `llama-server` per model, waits for it to report
//! readiness, tracks it in a registry keyed by PID and makes sure nothing is
//! left running when the application goes away.
//!
//! ```rust,no_run
//! use llamactl_server::Orchestrator;
//!
//! # async fn demo() -> Result<(), llamactl_server::ServerError> {
//! let orchestrator = Orchestrator::with_system_probe("secret");
//! let port = orchestrator.get_random_port().await?;
//! println!("next server goes on port {}", port);
//! orchestrator.cleanup_llama_processes().await;
//! # Ok(())
//! # }
//! ```

pub mod api_key;
pub mod commands;
pub mod config;
pub mod error;
pub mod paths;
pub mod ports;
pub mod process;
pub mod session;

pub use api_key::generate_api_key;
pub use commands::{apply_plan, detect_supported_features, Orchestrator, ResolvedBackend};
pub use error::{ServerError, ServerResult};
pub use session::{LoadRequest, SessionInfo, SessionManager, UnloadResult};
