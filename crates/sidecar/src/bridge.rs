//! Host side of the stdin/stdout protocol: spawn a sidecar and talk to it one
//! request at a time.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to start sidecar at {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("args must be an object")]
    InvalidArgs,

    /// The sidecar answered with an error response.
    #[error("{message}")]
    Remote {
        message: String,
        code: Option<String>,
    },

    #[error("sidecar exited unexpectedly")]
    Exited,

    #[error("unexpected sidecar response: {0}")]
    UnexpectedResponse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid sidecar response: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Remote { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

/// Serialize `{cmd, ...args}` as one request line (without the newline).
/// `args` must be an object or null; its keys overwrite `cmd`.
pub fn build_request(cmd: &str, args: Value) -> Result<String, BridgeError> {
    let mut map = Map::new();
    map.insert("cmd".to_string(), Value::String(cmd.to_string()));
    match args {
        Value::Null => {}
        Value::Object(obj) => map.extend(obj),
        _ => return Err(BridgeError::InvalidArgs),
    }
    Ok(serde_json::to_string(&Value::Object(map))?)
}

/// Map one response line to the command's data.
pub fn parse_response(line: &str) -> Result<Value, BridgeError> {
    let response: Value = serde_json::from_str(line.trim())?;
    match response.get("type").and_then(Value::as_str) {
        Some("success") => Ok(response.get("data").cloned().unwrap_or(Value::Null)),
        Some("error") => Err(BridgeError::Remote {
            message: response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown sidecar error")
                .to_string(),
            code: response
                .get("code")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        _ => Err(BridgeError::UnexpectedResponse(line.trim().to_string())),
    }
}

/// A request/response channel over any pair of streams. Requests are sent
/// one at a time so each response line belongs to the request before it.
pub struct BridgeConnection<R, W> {
    io: Mutex<(R, W)>,
}

impl<R, W> BridgeConnection<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            io: Mutex::new((reader, writer)),
        }
    }

    pub async fn send(&self, cmd: &str, args: Value) -> Result<Value, BridgeError> {
        let mut request = build_request(cmd, args)?;
        request.push('\n');

        let mut io = self.io.lock().await;
        let (reader, writer) = &mut *io;
        writer.write_all(request.as_bytes()).await?;
        writer.flush().await?;

        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(BridgeError::Exited);
        }
        parse_response(&line)
    }

    pub fn into_inner(self) -> (R, W) {
        self.io.into_inner()
    }
}

/// A sidecar child process with its stdin and stdout attached.
pub struct SidecarBridge {
    child: Child,
    conn: BridgeConnection<BufReader<ChildStdout>, ChildStdin>,
}

impl SidecarBridge {
    /// Start the sidecar at `path`. `cli_path` is passed on as
    /// `OPENCODE_CLI_PATH`. The child's stderr is inherited.
    pub fn spawn(path: &Path, cli_path: Option<&Path>) -> Result<Self, BridgeError> {
        let mut cmd = Command::new(path);
        if let Some(cli_path) = cli_path {
            cmd.env("OPENCODE_CLI_PATH", cli_path);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            BridgeError::Io(std::io::Error::other("sidecar stdin unavailable"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            BridgeError::Io(std::io::Error::other("sidecar stdout unavailable"))
        })?;
        tracing::debug!(path = %path.display(), pid = child.id(), "sidecar started");

        Ok(Self {
            child,
            conn: BridgeConnection::new(BufReader::new(stdout), stdin),
        })
    }

    pub async fn send(&self, cmd: &str, args: Value) -> Result<Value, BridgeError> {
        self.conn.send(cmd, args).await
    }

    /// Close stdin and wait for the sidecar to drain and exit; kill it if it
    /// takes longer than `grace`.
    pub async fn shutdown(mut self, grace: Duration) -> Result<(), BridgeError> {
        let (_, stdin) = self.conn.into_inner();
        drop(stdin);
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::debug!(%status, "sidecar exited");
            }
            Err(_) => {
                tracing::warn!("sidecar did not exit within {:?}, killing it", grace);
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}
