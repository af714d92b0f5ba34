//! opencode service launcher.
//!
//! Spawns `opencode serve`, drains its output and waits for the
//! `server listening on <url>` line that announces the bound address.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use futures_util::future::join_all;
use regex::Regex;
use shared::CliStatus;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;

use crate::config::Config;

const READY_MARKER: &str = "server listening";
/// Tail of child output kept for diagnostics.
const OUTPUT_LIMIT: usize = 64 * 1024;
/// How long a service gets to exit after SIGTERM before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("failed to start {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("service did not report a URL within {}ms\n{output}", .timeout.as_millis())]
    Timeout { timeout: Duration, output: String },

    #[error("service exited (code {code:?}) before reporting a URL\n{output}")]
    Exited { code: Option<i32>, output: String },
}

/// What to launch and how long to wait for it.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub binary: PathBuf,
    pub hostname: String,
    pub port: u16,
    pub timeout: Duration,
    /// Working directory of the service.
    pub directory: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            binary: config.binary.clone(),
            hostname: config.hostname.clone(),
            port: config.port,
            timeout: config.launch_timeout,
            directory: config.directory.as_ref().map(PathBuf::from),
        }
    }
}

/// A running service and the URL it reported.
#[derive(Debug, Clone)]
pub struct LaunchedService {
    pub url: String,
    pub handle: ServiceHandle,
}

#[derive(Debug)]
struct HandleInner {
    pid: Option<u32>,
    terminated: AtomicBool,
    exited: Arc<AtomicBool>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

/// Terminates the launched service. Cheap to clone; `terminate` acts once.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    inner: Arc<HandleInner>,
}

impl ServiceHandle {
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }

    /// Ask the service to stop. Does not wait for it to exit; a service that
    /// is still running after a short grace period is killed.
    pub fn terminate(&self) {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.has_exited() {
            return;
        }
        tracing::info!(pid = ?self.inner.pid, "terminating opencode service");

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = self.inner.pid {
                match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    Ok(()) => {
                        self.kill_after(KILL_GRACE);
                        return;
                    }
                    Err(e) => tracing::warn!(pid, "SIGTERM failed: {}", e),
                }
            }
        }

        self.kill();
    }

    /// Kill the service outright.
    pub fn kill(&self) {
        let tx = self
            .inner
            .kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    #[cfg(unix)]
    fn kill_after(&self, grace: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let handle = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            if !handle.has_exited() {
                tracing::warn!(pid = ?handle.pid(), "opencode ignored SIGTERM, killing it");
                handle.kill();
            }
        });
    }
}

/// Bounded, shared accumulator for child output.
#[derive(Debug, Clone, Default)]
struct OutputBuffer(Arc<Mutex<String>>);

impl OutputBuffer {
    fn push(&self, line: &str) {
        let mut buf = self.0.lock().unwrap_or_else(|p| p.into_inner());
        buf.push_str(line);
        buf.push('\n');
        if buf.len() > OUTPUT_LIMIT {
            let mut cut = buf.len() - OUTPUT_LIMIT;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    fn snapshot(&self) -> String {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"on\s+(\w+://\S+)").expect("valid url pattern"))
}

/// URL announced by a `... server listening on <url>` line.
pub fn discover_url(line: &str) -> Option<String> {
    if !line.contains(READY_MARKER) {
        return None;
    }
    url_pattern()
        .captures(line)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Launch the service and wait until it reports its URL, exits, or the
/// timeout elapses.
pub async fn launch(options: &LaunchOptions) -> Result<LaunchedService, LaunchError> {
    let mut cmd = Command::new(&options.binary);
    cmd.arg("serve")
        .arg(format!("--hostname={}", options.hostname))
        .arg(format!("--port={}", options.port))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &options.directory {
        cmd.current_dir(dir);
    }

    tracing::info!(
        binary = %options.binary.display(),
        hostname = %options.hostname,
        port = options.port,
        "launching opencode service"
    );
    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        binary: options.binary.display().to_string(),
        source,
    })?;

    let output = OutputBuffer::default();
    let (url_tx, mut url_rx) = oneshot::channel::<String>();
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let output = output.clone();
        let mut url_tx = Some(url_tx);
        readers.push(tokio::spawn(drain_lines(stdout, move |line| {
            output.push(line);
            tracing::debug!(target: "opencode::stdout", "{}", line);
            if url_tx.is_some() {
                if let Some(url) = discover_url(line) {
                    if let Some(tx) = url_tx.take() {
                        let _ = tx.send(url);
                    }
                }
            }
        })));
    }
    if let Some(stderr) = child.stderr.take() {
        let output = output.clone();
        readers.push(tokio::spawn(drain_lines(stderr, move |line| {
            output.push(line);
            tracing::debug!(target: "opencode::stderr", "{}", line);
        })));
    }

    let pid = child.id();
    let exited = Arc::new(AtomicBool::new(false));
    let (kill_tx, kill_rx) = oneshot::channel();
    let (exit_tx, mut exit_rx) = oneshot::channel();
    tokio::spawn(supervise(child, kill_rx, exit_tx, exited.clone()));
    let handle = ServiceHandle {
        inner: Arc::new(HandleInner {
            pid,
            terminated: AtomicBool::new(false),
            exited,
            kill_tx: Mutex::new(Some(kill_tx)),
        }),
    };

    let deadline = tokio::time::sleep(options.timeout);
    tokio::pin!(deadline);

    tokio::select! {
        biased;
        Ok(url) = &mut url_rx => {
            tracing::info!(url = %url, pid = ?pid, "opencode service ready");
            Ok(LaunchedService { url, handle })
        }
        status = &mut exit_rx => {
            // let the readers collect whatever the child wrote before exiting
            let _ = tokio::time::timeout(Duration::from_secs(1), join_all(readers)).await;
            let code = status.ok().flatten().and_then(|s: ExitStatus| s.code());
            Err(LaunchError::Exited { code, output: output.snapshot() })
        }
        _ = &mut deadline => {
            handle.terminate();
            Err(LaunchError::Timeout { timeout: options.timeout, output: output.snapshot() })
        }
    }
}

/// Launch the service, or fall back to `config.fallback_url` when it cannot
/// be started or never reports a URL.
pub async fn launch_or_fallback(config: &Config) -> (String, Option<ServiceHandle>) {
    match launch(&LaunchOptions::from_config(config)).await {
        Ok(launched) => {
            tracing::info!(url = %launched.url, pid = ?launched.handle.pid(), "opencode started");
            (launched.url, Some(launched.handle))
        }
        Err(e) => {
            tracing::warn!(
                fallback = %config.fallback_url,
                "failed to launch opencode, using fallback: {}",
                e
            );
            (config.fallback_url.clone(), None)
        }
    }
}

/// Owns the child until it exits, killing it on request.
async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: oneshot::Sender<Option<ExitStatus>>,
    exited: Arc<AtomicBool>,
) {
    let status = tokio::select! {
        status = child.wait() => status.ok(),
        Ok(()) = kill_rx => {
            let _ = child.start_kill();
            child.wait().await.ok()
        }
    };
    exited.store(true, Ordering::SeqCst);
    tracing::info!(code = ?status.and_then(|s| s.code()), "opencode service exited");
    let _ = exit_tx.send(status);
}

/// Read `reader` to EOF line by line. Invalid UTF-8 is replaced rather than
/// ending the drain, so the child never blocks on a full pipe.
async fn drain_lines<R, F>(reader: R, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                on_line(line.trim_end_matches(['\r', '\n']));
            }
            Err(e) => {
                tracing::debug!("output drain stopped: {}", e);
                break;
            }
        }
    }
}

/// Whether the service CLI can be run, and which version it reports.
pub async fn cli_status(binary: &Path) -> CliStatus {
    let output = Command::new(binary)
        .arg("--version")
        .stdin(Stdio::null())
        .output()
        .await;
    match output {
        Ok(out) => CliStatus {
            installed: true,
            version: if out.status.success() {
                first_non_empty_line(
                    &String::from_utf8_lossy(&out.stdout),
                    &String::from_utf8_lossy(&out.stderr),
                )
            } else {
                None
            },
            path: Some(binary.display().to_string()),
        },
        Err(e) => {
            tracing::debug!(binary = %binary.display(), "opencode CLI not runnable: {}", e);
            CliStatus {
                installed: false,
                version: None,
                path: None,
            }
        }
    }
}

fn first_non_empty_line(stdout: &str, stderr: &str) -> Option<String> {
    stdout
        .lines()
        .chain(stderr.lines())
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}
