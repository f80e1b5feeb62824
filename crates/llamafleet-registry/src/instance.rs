//! Per-instance process supervision: spawn, log capture, crash-restart, reverse proxy.
//!
//! One [`Instance`] owns at most one child process end-to-end (spec §4.1). Mutating
//! operations serialize under a per-instance exclusive lock; the child itself is never
//! shared outside the monitor task that owns its `wait()` call, so termination is done
//! by signaling its pid/process-group rather than by fighting over `&mut Child`.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::command;
use crate::error::SupervisorError;
use crate::options::InstanceOptions;
use crate::proxy::ProxyTarget;

const STOP_GRACE: Duration = Duration::from_secs(5);
const FORCE_KILL_GRACE: Duration = Duration::from_secs(2);

struct Inner {
    options: Option<InstanceOptions>,
    running: bool,
    restarts: u32,
    last_used_at: SystemTime,
    child_pid: Option<u32>,
    proxy: Option<ProxyTarget>,
    restart_cancel: Option<CancellationToken>,
    exited: Option<Arc<Notify>>,
}

/// A managed child-process inference server with a stable name and configured options.
pub struct Instance {
    name: String,
    log_dir: PathBuf,
    inner: RwLock<Inner>,
}

impl Instance {
    /// Constructs a stopped instance. Always wrapped in `Arc` because its supervision
    /// tasks (drainers, exit monitor, restart timer) each hold a clone of it.
    pub fn new(name: String, log_dir: PathBuf, options: Option<InstanceOptions>) -> Arc<Self> {
        Arc::new(Instance {
            name,
            log_dir,
            inner: RwLock::new(Inner {
                options,
                running: false,
                restarts: 0,
                last_used_at: SystemTime::UNIX_EPOCH,
                child_pid: None,
                proxy: None,
                restart_cancel: None,
                exited: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn is_running(&self) -> bool {
        self.inner.read().await.running
    }

    pub async fn restarts(&self) -> u32 {
        self.inner.read().await.restarts
    }

    pub async fn last_used_at(&self) -> SystemTime {
        self.inner.read().await.last_used_at
    }

    pub async fn options(&self) -> Option<InstanceOptions> {
        self.inner.read().await.options.clone()
    }

    /// Records a route to this instance. Monotone: never moves `last_used_at` backwards.
    pub async fn touch_last_used(&self) {
        let mut inner = self.inner.write().await;
        let now = SystemTime::now();
        if now > inner.last_used_at {
            inner.last_used_at = now;
        }
    }

    /// Deep-copies and validates `new`, clamping restart-policy fields (spec §4.1 `SetOptions`).
    /// Clears the cached proxy so the next `get_proxy` rebinds to the possibly-new host:port.
    /// Does not implicitly Stop/Start.
    pub async fn set_options(&self, mut new_options: InstanceOptions) -> Result<(), SupervisorError> {
        new_options.validate_and_clamp(&self.name)?;
        let mut inner = self.inner.write().await;
        inner.options = Some(new_options);
        inner.proxy = None;
        Ok(())
    }

    /// Operator-initiated start. Resets `restarts` to zero.
    pub async fn start(self: &Arc<Self>) -> Result<(), SupervisorError> {
        self.start_with(true).await
    }

    /// Stop then Start, preserving options; resets `restarts` to zero (spec §4.1 `Restart`).
    pub async fn restart(self: &Arc<Self>) -> Result<(), SupervisorError> {
        match self.stop().await {
            Ok(()) | Err(SupervisorError::NotRunning) => {}
            Err(e) => return Err(e),
        }
        self.start().await
    }

    async fn start_with(self: &Arc<Self>, reset_restarts: bool) -> Result<(), SupervisorError> {
        let mut inner = self.inner.write().await;
        if inner.running {
            return Err(SupervisorError::AlreadyRunning);
        }
        let options = inner.options.clone().ok_or(SupervisorError::NoOptions)?;
        if reset_restarts {
            inner.restarts = 0;
        }

        tokio::fs::create_dir_all(&self.log_dir)
            .await
            .map_err(SupervisorError::LogFile)?;
        append_marker(&self.log_path(), &start_marker(&self.name))
            .await
            .map_err(SupervisorError::LogFile)?;

        let exec = command::build(&options);
        let mut cmd = Command::new(&exec.program);
        cmd.args(&exec.args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        set_new_process_group(&mut cmd);

        let spawn_result = cmd.spawn();
        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => return Err(SupervisorError::Spawn(e)),
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let log_path = self.log_path();

        if let Some(stdout) = stdout {
            let path = log_path.clone();
            tokio::spawn(async move {
                if let Ok(log) = open_log_append(&path).await {
                    drain_to_log(stdout, log).await;
                }
            });
        }
        if let Some(stderr) = stderr {
            let path = log_path.clone();
            tokio::spawn(async move {
                if let Ok(log) = open_log_append(&path).await {
                    drain_to_log(stderr, log).await;
                }
            });
        }

        let pid = child.id();
        let exited = Arc::new(Notify::new());
        inner.child_pid = pid;
        inner.running = true;
        inner.proxy = Some(ProxyTarget::new(options.upstream_base_url()));
        inner.exited = Some(Arc::clone(&exited));
        drop(inner);

        let me = Arc::clone(self);
        tokio::spawn(async move {
            me.monitor(child, exited).await;
        });

        Ok(())
    }

    /// The crash-restart monitor coroutine (spec §4.1): awaits child exit, then decides
    /// whether to restart under a cancelable backoff.
    async fn monitor(self: Arc<Self>, mut child: Child, exited: Arc<Notify>) {
        let status = child.wait().await;
        exited.notify_one();
        self.handle_exit(status).await;
    }

    async fn handle_exit(self: Arc<Self>, status: std::io::Result<ExitStatus>) {
        let mut inner = self.inner.write().await;
        if !inner.running {
            // Operator already called Stop; no restart.
            return;
        }
        inner.running = false;
        inner.child_pid = None;
        let _ = append_marker(&self.log_path(), &stop_marker(&self.name)).await;

        let clean = matches!(&status, Ok(s) if s.success());
        if clean {
            info!(instance = %self.name, "child exited cleanly");
            return;
        }

        let Some(options) = inner.options.clone() else {
            warn!(instance = %self.name, "child exited with error and has no options; not restarting");
            return;
        };
        if !options.restart_policy.auto_restart {
            warn!(instance = %self.name, "child exited with error and auto_restart is disabled");
            return;
        }
        if inner.restarts >= options.restart_policy.max_restarts {
            warn!(
                instance = %self.name,
                restarts = inner.restarts,
                max_restarts = options.restart_policy.max_restarts,
                "exceeded max restart attempts"
            );
            return;
        }

        inner.restarts += 1;
        let attempt = inner.restarts;
        let cancel = CancellationToken::new();
        inner.restart_cancel = Some(cancel.clone());
        drop(inner);

        let delay = Duration::from_secs(options.restart_policy.restart_delay_seconds);
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(instance = %self.name, "restart cancelled");
            }
            _ = tokio::time::sleep(delay) => {
                match self.start_with(false).await {
                    Ok(()) => {
                        info!(instance = %self.name, attempt, "auto-restarted after crash");
                    }
                    Err(e) => {
                        error!(instance = %self.name, error = %e, "auto-restart failed");
                    }
                }
            }
        }
        // Either branch retires this restart episode's cancel handle. A concurrent Stop
        // may already have taken it; clearing again here is a no-op in that case.
        self.inner.write().await.restart_cancel = None;
    }

    /// Cancels any pending restart timer, then stops the running child gracefully
    /// (TERM, then a 5s-timeout escalation to a forced kill). Returns `NotRunning` if
    /// the instance was already stopped, after still cancelling the timer.
    pub async fn stop(self: &Arc<Self>) -> Result<(), SupervisorError> {
        let mut inner = self.inner.write().await;
        if let Some(cancel) = inner.restart_cancel.take() {
            cancel.cancel();
        }
        if !inner.running {
            return Err(SupervisorError::NotRunning);
        }
        inner.running = false;
        let pid = inner.child_pid;
        let exited = inner.exited.clone();
        drop(inner);

        if let Some(pid) = pid {
            signal_terminate(pid);
        }
        if let Some(exited) = exited {
            if tokio::time::timeout(STOP_GRACE, exited.notified())
                .await
                .is_err()
            {
                if let Some(pid) = pid {
                    signal_kill(pid);
                }
                let _ = tokio::time::timeout(FORCE_KILL_GRACE, exited.notified()).await;
            }
        }

        let mut inner = self.inner.write().await;
        inner.running = false;
        inner.child_pid = None;
        inner.proxy = None;
        let _ = append_marker(&self.log_path(), &stop_marker(&self.name)).await;
        Ok(())
    }

    /// Lazily constructs and caches a reverse-proxy handle to `options.host:options.port`.
    pub async fn get_proxy(&self) -> Option<ProxyTarget> {
        let mut inner = self.inner.write().await;
        if inner.proxy.is_none() {
            if let Some(options) = &inner.options {
                inner.proxy = Some(ProxyTarget::new(options.upstream_base_url()));
            }
        }
        inner.proxy.clone()
    }

    /// Returns the last `n` lines of the current log file (or the full file if `n <= 0`).
    /// Does not hold the instance lock across I/O beyond reading the file path.
    pub async fn get_logs(&self, n: i64) -> std::io::Result<Vec<String>> {
        let path = self.log_path();
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let lines: Vec<String> = content.lines().map(ToString::to_string).collect();
        if n <= 0 {
            return Ok(lines);
        }
        let n = n as usize;
        if lines.len() <= n {
            Ok(lines)
        } else {
            Ok(lines[lines.len() - n..].to_vec())
        }
    }

    fn log_path(&self) -> PathBuf {
        self.log_dir.join(format!("{}.log", self.name))
    }
}

fn start_marker(name: &str) -> String {
    format!("=== Instance {name} started at {} ===", now_str())
}

fn stop_marker(name: &str) -> String {
    format!("=== Instance {name} stopped at {} ===", now_str())
}

fn now_str() -> String {
    let now = SystemTime::now();
    let secs = now
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    humantime_utc(secs)
}

/// Renders a unix timestamp as `YYYY-MM-DD HH:MM:SS` UTC without pulling in a date crate.
/// Uses Howard Hinnant's `civil_from_days` algorithm for the calendar conversion.
fn humantime_utc(secs: u64) -> String {
    const DAYS_PER_400Y: i64 = 146097;

    let days = (secs / 86400) as i64;
    let rem = secs % 86400;
    let (hour, minute, second) = (rem / 3600, (rem % 3600) / 60, rem % 60);

    let z = days + 719468;
    let era = if z >= 0 { z } else { z - DAYS_PER_400Y + 1 } / DAYS_PER_400Y;
    let doe = (z - era * DAYS_PER_400Y) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let y = yoe as i64 + era * 400 + if m <= 2 { 1 } else { 0 };

    format!("{y:04}-{m:02}-{d:02} {hour:02}:{minute:02}:{second:02}")
}

async fn append_marker(path: &PathBuf, marker: &str) -> std::io::Result<()> {
    let mut file = open_log_append(path).await?;
    file.write_all(marker.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await?;
    file.sync_data().await
}

async fn open_log_append(path: &PathBuf) -> std::io::Result<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    OpenOptions::new().create(true).append(true).open(path).await
}

/// Copies lines from a child pipe into the log file, flushing after every line.
async fn drain_to_log(pipe: impl tokio::io::AsyncRead + Unpin, mut log: tokio::fs::File) {
    let mut reader = BufReader::new(pipe).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if log.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if log.write_all(b"\n").await.is_err() {
                    break;
                }
                if log.flush().await.is_err() {
                    break;
                }
                let _ = log.sync_data().await;
            }
            Ok(None) => break,
            Err(_) => break,
        }
    }
}

#[cfg(unix)]
fn set_new_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn set_new_process_group(_cmd: &mut Command) {}

#[cfg(unix)]
fn signal_terminate(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(pid, error = %e, "failed to send SIGTERM to process group");
    }
}

#[cfg(unix)]
fn signal_kill(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        warn!(pid, error = %e, "failed to send SIGKILL to process group");
    }
}

#[cfg(not(unix))]
fn signal_terminate(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .status();
}

#[cfg(not(unix))]
fn signal_kill(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .status();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{BackendOptions, RestartPolicy};
    use tempfile::tempdir;

    fn sleep_options(restart_delay_seconds: u64, max_restarts: u32, auto_restart: bool) -> InstanceOptions {
        InstanceOptions {
            restart_policy: RestartPolicy {
                auto_restart,
                max_restarts,
                restart_delay_seconds,
            },
            backend: BackendOptions::Llama {
                model_path: "unused".to_string(),
                context_size: None,
                gpu_layers: None,
                embedding: false,
                extra_args: vec![],
            },
            host: "127.0.0.1".to_string(),
            port: 0,
            idle_timeout_minutes: 0,
        }
    }

    #[tokio::test]
    async fn start_fails_with_no_options() {
        let dir = tempdir().unwrap();
        let instance = Instance::new("noopts".to_string(), dir.path().to_path_buf(), None);
        let err = instance.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NoOptions));
    }

    #[tokio::test]
    async fn start_twice_fails_already_running() {
        let dir = tempdir().unwrap();
        let options = sleep_options(1, 0, false);
        let instance = Instance::new("dup".to_string(), dir.path().to_path_buf(), Some(options));
        // Use `sh -c sleep 5` style command by overriding command builder indirectly is
        // complex here; instead exercise the guard logic directly via internal state.
        {
            let mut inner = instance.inner.write().await;
            inner.running = true;
        }
        let err = instance.start().await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning));
    }

    #[tokio::test]
    async fn stop_when_not_running_returns_not_running_but_cancels_timer() {
        let dir = tempdir().unwrap();
        let instance = Instance::new("stopme".to_string(), dir.path().to_path_buf(), None);
        let cancel = CancellationToken::new();
        {
            let mut inner = instance.inner.write().await;
            inner.restart_cancel = Some(cancel.clone());
        }
        let err = instance.stop().await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn set_options_clears_cached_proxy() {
        let dir = tempdir().unwrap();
        let options = sleep_options(1, 0, false);
        let instance = Instance::new("proxy".to_string(), dir.path().to_path_buf(), Some(options.clone()));
        {
            let mut inner = instance.inner.write().await;
            inner.proxy = Some(ProxyTarget::new(options.upstream_base_url()));
        }
        let mut new_options = options.clone();
        new_options.port = 9999;
        instance.set_options(new_options).await.unwrap();
        assert!(instance.inner.read().await.proxy.is_none());
        let proxy = instance.get_proxy().await.unwrap();
        assert_eq!(proxy.base_url(), "http://127.0.0.1:9999");
    }

    #[tokio::test]
    async fn get_logs_returns_empty_for_missing_file() {
        let dir = tempdir().unwrap();
        let instance = Instance::new("nolog".to_string(), dir.path().to_path_buf(), None);
        let logs = instance.get_logs(10).await.unwrap();
        assert!(logs.is_empty());
    }

    #[test]
    fn humantime_utc_formats_known_epoch() {
        assert_eq!(humantime_utc(0), "1970-01-01 00:00:00");
        assert_eq!(humantime_utc(1_700_000_000), "2023-11-14 22:13:20");
    }
}
