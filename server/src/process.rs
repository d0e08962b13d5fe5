//! Child process supervision: output capture, readiness detection and
//! graceful shutdown.

use std::collections::VecDeque;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{ServerError, ServerResult};

/// Lines (lowercased) that mean the server accepts requests
pub const READY_MARKERS: &[&str] = &[
    "server is listening on",
    "server listening on",
    "http server listening",
    "starting the main loop",
    "all slots are idle",
];

pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// Lines of process output kept for error reports
const CAPTURED_LINES: usize = 200;
/// How long to wait for the output readers once the process is gone
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

pub fn is_ready_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    READY_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Re-log every line of `stream` and signal `ready` on the first readiness
/// marker. Resolves to the tail of the output once the stream closes.
pub fn spawn_output_reader<R>(stream: R, ready: mpsc::Sender<()>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(CAPTURED_LINES);
        let mut signalled = false;

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    info!("[llamacpp] {}", line);

                    if !signalled && is_ready_line(line) {
                        info!("Model appears to be ready based on logs: '{}'", line);
                        signalled = true;
                        let _ = ready.try_send(());
                    }

                    if tail.len() == CAPTURED_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line.to_string());
                }
                Err(e) => {
                    error!("Error reading llama-server output: {}", e);
                    break;
                }
            }
        }

        tail.into_iter().collect::<Vec<_>>().join("\n")
    })
}

async fn drain_output(reader: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN, reader).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => format!("<output reader failed: {}>", e),
        Err(_) => String::from("<output not available>"),
    }
}

/// Wait until a reader reports readiness, the child exits, or `timeout`
/// elapses. On timeout the child is killed before returning.
pub async fn wait_for_ready(
    child: &mut Child,
    ready: &mut mpsc::Receiver<()>,
    stderr: JoinHandle<String>,
    timeout: Duration,
) -> ServerResult<()> {
    let deadline = Instant::now() + timeout;
    let mut ticker = tokio::time::interval(READY_POLL_INTERVAL);
    info!("Waiting for model session to be ready...");

    loop {
        tokio::select! {
            Some(()) = ready.recv() => {
                info!("Model is ready to accept requests!");
                return Ok(());
            }
            _ = ticker.tick() => {
                if let Some(status) = child.try_wait()? {
                    let output = drain_output(stderr).await;
                    error!("llama-server exited during startup with {}", status);
                    return Err(ServerError::from_stderr(&output));
                }

                if Instant::now() >= deadline {
                    error!("Timeout waiting for server to be ready");
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill timed out llama-server: {}", e);
                    }
                    let output = drain_output(stderr).await;
                    return Err(ServerError::StartupTimeout {
                        secs: timeout.as_secs(),
                        stderr: output,
                    });
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> std::io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: kill(2) has no memory-safety preconditions
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Stop `child`: SIGTERM and up to [`GRACEFUL_SHUTDOWN`] to exit, then a
/// forced kill. Windows has no SIGTERM and kills directly.
pub async fn terminate_child(child: &mut Child) -> ServerResult<()> {
    let Some(pid) = child.id() else {
        // Already reaped
        return Ok(());
    };

    #[cfg(unix)]
    {
        info!("Sending SIGTERM to PID {}", pid);
        if let Err(e) = send_sigterm(pid) {
            warn!("SIGTERM to PID {} failed: {}", pid, e);
        }
        match tokio::time::timeout(GRACEFUL_SHUTDOWN, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Process {} exited gracefully: {}", pid, status);
                return Ok(());
            }
            Ok(Err(e)) => warn!("Failed waiting on PID {}: {}", pid, e),
            Err(_) => warn!("Process {} did not exit within {:?}, force-killing", pid, GRACEFUL_SHUTDOWN),
        }
    }

    #[cfg(not(unix))]
    info!("Force-killing PID {}", pid);

    child.kill().await?;
    info!("Process {} killed", pid);
    Ok(())
}

/// Whether the OS still knows a live process with this pid
pub fn is_pid_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}
