//! Line-delimited JSON command loop.
//!
//! Each request line is dispatched on its own task; a single writer task owns
//! the output stream so response lines never interleave. Responses are written
//! in completion order.

mod handlers;

pub use handlers::CommandError;

use std::sync::Arc;

use serde_json::{Map, Value};
use shared::{error_codes, CommandKind, RawRequest, Response};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::context::Context;

pub struct Dispatcher {
    ctx: Arc<Context>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Parse and dispatch one request line.
    ///
    /// Only lines that are not a JSON object are `PARSE_ERROR`. A `cmd` that
    /// is missing or not a known name is `UNKNOWN_CMD`; a non-string
    /// `sessionPath` or `directory` is `INVALID_ARGUMENT`.
    pub async fn dispatch_line(&self, line: &str) -> Response {
        let mut object = match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                tracing::debug!("request line is not an object");
                return Response::error(error_codes::PARSE_ERROR, "request must be a JSON object");
            }
            Err(e) => {
                tracing::debug!("unparseable request line: {}", e);
                return Response::error(error_codes::PARSE_ERROR, e.to_string());
            }
        };

        let cmd = match object.remove("cmd") {
            None | Some(Value::Null) => None,
            Some(Value::String(name)) => Some(name),
            Some(other) => return unknown_command(&other.to_string()),
        };
        let kind = match resolve(cmd.as_deref()) {
            Ok(kind) => kind,
            Err(response) => return response,
        };
        let request = match split_fields(cmd, object) {
            Ok(request) => request,
            Err(message) => {
                tracing::debug!(cmd = %kind, "{}", message);
                return Response::error(error_codes::INVALID_ARGUMENT, message);
            }
        };
        self.handle(kind, request).await
    }

    pub async fn dispatch(&self, request: RawRequest) -> Response {
        match resolve(request.cmd.as_deref()) {
            Ok(kind) => self.handle(kind, request).await,
            Err(response) => response,
        }
    }

    async fn handle(&self, kind: CommandKind, request: RawRequest) -> Response {
        match handlers::handle(&self.ctx, kind, request).await {
            Ok(data) => {
                tracing::debug!(cmd = %kind, "command ok");
                Response::success(kind.as_str(), data)
            }
            Err(e) => {
                tracing::warn!(cmd = %kind, code = e.code(), "command failed: {}", e);
                Response::error(e.code(), e.to_string())
            }
        }
    }
}

fn unknown_command(name: &str) -> Response {
    tracing::debug!(cmd = %name, "unknown command");
    Response::error(error_codes::UNKNOWN_CMD, format!("Unknown command: {}", name))
}

fn resolve(cmd: Option<&str>) -> Result<CommandKind, Response> {
    let name = cmd.unwrap_or_default();
    CommandKind::from_name(name).ok_or_else(|| unknown_command(name))
}

/// Pull the correlation fields out of a request object; the rest are the
/// command's arguments.
fn split_fields(cmd: Option<String>, mut object: Map<String, Value>) -> Result<RawRequest, String> {
    let mut take_string = |key: &str| match object.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value)),
        Some(_) => Err(format!("{} must be a string", key)),
    };
    let session_path = take_string("sessionPath")?;
    let directory = take_string("directory")?;
    Ok(RawRequest {
        cmd,
        session_path,
        directory,
        args: object,
    })
}

/// Serve requests from `input` until EOF, then wait for in-flight commands
/// and flush their responses. A read error stops intake the same way, and is
/// returned once the pending responses are written.
pub async fn run<R, W>(dispatcher: Arc<Dispatcher>, mut input: R, output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Response>();
    let writer = tokio::spawn(write_responses(rx, output));

    let mut buf = Vec::new();
    let mut in_flight = JoinSet::new();
    let mut read_error = None;
    loop {
        tokio::select! {
            // partial reads stay in `buf` if the other branch wins
            read = input.read_until(b'\n', &mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("reading requests failed: {}", e);
                        read_error = Some(e);
                        break;
                    }
                }
                let bytes = std::mem::take(&mut buf);
                let line = match String::from_utf8(bytes) {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::debug!("request line is not UTF-8: {}", e);
                        let response = Response::error(
                            error_codes::PARSE_ERROR,
                            format!("request is not valid UTF-8: {}", e.utf8_error()),
                        );
                        if tx.send(response).is_err() {
                            tracing::error!("response writer is gone");
                        }
                        continue;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let dispatcher = Arc::clone(&dispatcher);
                let tx = tx.clone();
                let span = tracing::debug_span!("request", id = %Uuid::new_v4());
                in_flight.spawn(
                    async move {
                        let response = dispatcher.dispatch_line(line.trim_end_matches(['\r', '\n'])).await;
                        if tx.send(response).is_err() {
                            tracing::error!("response writer is gone");
                        }
                    }
                    .instrument(span),
                );
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("command task failed: {}", e);
                }
            }
        }
    }

    tracing::info!(pending = in_flight.len(), "input closed, draining");
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            tracing::error!("command task failed: {}", e);
        }
    }
    drop(tx);

    writer.await.map_err(std::io::Error::other)??;
    match read_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn write_responses<W>(mut rx: mpsc::UnboundedReceiver<Response>, mut output: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = match serde_json::to_string(&response) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("failed to serialize response: {}", e);
                continue;
            }
        };
        line.push('\n');
        output.write_all(line.as_bytes()).await?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_service, test_context, HitCounter};
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::routing::{get, post, put};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use tokio::io::BufReader;

    fn to_json(resp: &Response) -> Value {
        serde_json::to_value(resp).unwrap()
    }

    /// Fails every request; used where no downstream call may happen.
    fn untouchable() -> Router {
        async fn any(State(hits): State<HitCounter>) -> StatusCode {
            hits.hit();
            StatusCode::INTERNAL_SERVER_ERROR
        }
        Router::new().fallback(any).with_state(HitCounter::default())
    }

    #[tokio::test]
    async fn health_is_forwarded() {
        let router = Router::new().route(
            "/global/health",
            get(|| async { Json(json!({"healthy": true, "version": "1.0.0"})) }),
        );
        let dispatcher = Dispatcher::new(test_context(&fake_service(router).await));

        let resp = to_json(&dispatcher.dispatch_line(r#"{"cmd":"health"}"#).await);
        assert_eq!(
            resp,
            json!({"type": "success", "cmd": "health", "data": {"healthy": true, "version": "1.0.0"}})
        );
    }

    #[tokio::test]
    async fn malformed_line_is_a_parse_error() {
        let dispatcher = Dispatcher::new(test_context("http://127.0.0.1:9"));
        let resp = to_json(&dispatcher.dispatch_line("not json").await);
        assert_eq!(resp["type"], "error");
        assert_eq!(resp["code"], "PARSE_ERROR");
        assert!(resp.get("cmd").is_none());

        let resp = dispatcher.dispatch_line("[1,2]").await;
        assert_eq!(resp.code(), Some(error_codes::PARSE_ERROR));
    }

    #[tokio::test]
    async fn unknown_command_is_named() {
        let dispatcher = Dispatcher::new(test_context("http://127.0.0.1:9"));
        let resp = to_json(&dispatcher.dispatch_line(r#"{"cmd":"bogus"}"#).await);
        assert_eq!(
            resp,
            json!({"type": "error", "code": "UNKNOWN_CMD", "message": "Unknown command: bogus"})
        );
        let resp = dispatcher.dispatch_line(r#"{"sessionPath":"ses_1"}"#).await;
        assert_eq!(resp.code(), Some(error_codes::UNKNOWN_CMD));
    }

    #[tokio::test]
    async fn missing_arguments_never_reach_the_service() {
        let hits = HitCounter::default();
        let router = Router::new()
            .fallback(|State(hits): State<HitCounter>| async move {
                hits.hit();
                StatusCode::OK
            })
            .with_state(hits.clone());
        let dispatcher = Dispatcher::new(test_context(&fake_service(router).await));

        for line in [
            r#"{"cmd":"prompt","message":"hi"}"#,
            r#"{"cmd":"getSession"}"#,
            r#"{"cmd":"listMessages","sessionPath":" "}"#,
            r#"{"cmd":"setAuth","key":"sk-1"}"#,
            r#"{"cmd":"removeAuth"}"#,
            r#"{"cmd":"providerOauthCallback","code":"abc"}"#,
            r#"{"cmd":"findFiles"}"#,
            r#"{"cmd":"prompt","sessionPath":"ses_1"}"#,
            r#"{"cmd":"updateConfig","config":"yes"}"#,
        ] {
            let resp = dispatcher.dispatch_line(line).await;
            assert_eq!(resp.code(), Some(error_codes::INVALID_ARGUMENT), "{}", line);
        }
        assert_eq!(hits.count(), 0);
    }

    #[tokio::test]
    async fn server_info_is_local() {
        let dispatcher = Dispatcher::new(test_context(&fake_service(untouchable()).await));
        let resp = to_json(
            &dispatcher
                .dispatch_line(r#"{"cmd":"serverInfo","directory":"/work"}"#)
                .await,
        );
        assert_eq!(resp["data"]["url"], dispatcher.context().base_url.as_str());
        assert_eq!(resp["data"]["directory"], "/work");
        assert_eq!(resp["data"]["launched"], true);
    }

    #[tokio::test]
    async fn prompt_sends_synthesized_parts() {
        async fn reply(Path(id): Path<String>, Json(body): Json<Value>) -> Json<Value> {
            Json(json!({
                "info": {"id": "msg_2", "sessionID": id, "role": "assistant"},
                "parts": [
                    {"type": "text", "text": "thinking..."},
                    {"type": "text", "text": format!("echo: {}", body["parts"][0]["text"].as_str().unwrap_or(""))}
                ],
                "sent": body
            }))
        }
        let router = Router::new().route("/session/{id}/message", post(reply));
        let dispatcher = Dispatcher::new(test_context(&fake_service(router).await));

        let resp = to_json(
            &dispatcher
                .dispatch_line(r#"{"cmd":"prompt","sessionPath":"ses_1","message":"hello","parts":[{"text":"untyped"}]}"#)
                .await,
        );
        assert_eq!(resp["type"], "success");
        assert_eq!(resp["data"]["text"], "echo: hello");
        assert_eq!(resp["data"]["message"]["info"]["sessionID"], "ses_1");
        assert_eq!(
            resp["data"]["message"]["sent"]["parts"],
            json!([{"type": "text", "text": "hello"}])
        );
    }

    #[tokio::test]
    async fn providers_are_flattened() {
        let router = Router::new().route(
            "/config/providers",
            get(|| async {
                Json(json!({
                    "providers": [{"id": "openai", "name": "OpenAI", "models": {"gpt-4": {}}}],
                    "default": {"openai": "gpt-4"}
                }))
            }),
        );
        let dispatcher = Dispatcher::new(test_context(&fake_service(router).await));

        let resp = to_json(&dispatcher.dispatch_line(r#"{"cmd":"getProviders"}"#).await);
        assert_eq!(
            resp["data"],
            json!({
                "providers": [{"name": "OpenAI", "models": ["openai/gpt-4"]}],
                "defaults": {"openai": "openai/gpt-4"}
            })
        );
    }

    #[tokio::test]
    async fn messages_are_normalized() {
        let router = Router::new().route(
            "/session/{id}/message",
            get(|| async {
                Json(json!([{
                    "info": {"id": "msg_1", "role": "user"},
                    "parts": [{"type": "text", "text": "a"}, {"type": "text", "text": "abc"}]
                }]))
            }),
        );
        let dispatcher = Dispatcher::new(test_context(&fake_service(router).await));

        let resp = to_json(
            &dispatcher
                .dispatch_line(r#"{"cmd":"listMessages","sessionPath":"ses_1"}"#)
                .await,
        );
        assert_eq!(resp["data"][0]["id"], "msg_1");
        assert_eq!(resp["data"][0]["text"], "abc");
    }

    #[tokio::test]
    async fn downstream_error_message_is_surfaced() {
        let router = Router::new().route(
            "/auth/{id}",
            put(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"name": "AuthError", "data": {"message": "bad key"}})),
                )
            }),
        );
        let dispatcher = Dispatcher::new(test_context(&fake_service(router).await));

        let resp = to_json(
            &dispatcher
                .dispatch_line(r#"{"cmd":"setAuth","providerID":"openai","key":"sk-bad"}"#)
                .await,
        );
        assert_eq!(
            resp,
            json!({"type": "error", "code": "UNKNOWN_ERROR", "message": "bad key"})
        );
    }

    #[tokio::test]
    async fn directory_is_forwarded_as_query() {
        let router = Router::new().route(
            "/session",
            get(|axum::extract::RawQuery(query): axum::extract::RawQuery| async move {
                Json(json!({ "query": query }))
            }),
        );
        let dispatcher = Dispatcher::new(test_context(&fake_service(router).await));

        let resp = to_json(
            &dispatcher
                .dispatch_line(r#"{"cmd":"listSessions","directory":"/work/app"}"#)
                .await,
        );
        assert_eq!(resp["data"]["query"], "directory=%2Fwork%2Fapp");
    }

    #[tokio::test]
    async fn run_answers_every_line_then_exits() {
        let dispatcher = Arc::new(Dispatcher::new(test_context("http://127.0.0.1:9")));
        let input = b"{\"cmd\":\"serverInfo\"}\nnot json\n\n   \n{\"cmd\":\"bogus\"}\n".to_vec();
        let (out_write, out_read) = tokio::io::duplex(64 * 1024);

        run(dispatcher, BufReader::new(&input[..]), out_write)
            .await
            .unwrap();

        let mut lines = BufReader::new(out_read).lines();
        let mut responses = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(serde_json::from_str::<Value>(&line).unwrap());
        }
        assert_eq!(responses.len(), 3);
        assert!(responses
            .iter()
            .any(|r| r["type"] == "success" && r["cmd"] == "serverInfo"));
        assert!(responses.iter().any(|r| r["code"] == "PARSE_ERROR"));
        assert!(responses.iter().any(|r| r["code"] == "UNKNOWN_CMD"));
    }

    #[tokio::test]
    async fn invalid_utf8_line_does_not_end_the_stream() {
        let dispatcher = Arc::new(Dispatcher::new(test_context("http://127.0.0.1:9")));
        let input = b"{\"cmd\":\"serverInfo\"}\n{\"cmd\":\"\xff\xfe\"}\n{\"cmd\":\"bogus\"}\n".to_vec();
        let (out_write, out_read) = tokio::io::duplex(64 * 1024);

        run(dispatcher, BufReader::new(&input[..]), out_write)
            .await
            .unwrap();

        let mut lines = BufReader::new(out_read).lines();
        let mut responses = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            responses.push(serde_json::from_str::<Value>(&line).unwrap());
        }
        assert_eq!(responses.len(), 3);
        assert!(responses
            .iter()
            .any(|r| r["type"] == "success" && r["cmd"] == "serverInfo"));
        assert!(responses.iter().any(|r| r["code"] == "PARSE_ERROR"));
        assert!(responses.iter().any(|r| r["code"] == "UNKNOWN_CMD"));
    }

    #[tokio::test]
    async fn wrong_typed_fields_are_not_parse_errors() {
        let dispatcher = Dispatcher::new(test_context(&fake_service(untouchable()).await));

        let resp = to_json(&dispatcher.dispatch_line(r#"{"cmd":5}"#).await);
        assert_eq!(
            resp,
            json!({"type": "error", "code": "UNKNOWN_CMD", "message": "Unknown command: 5"})
        );

        let resp = to_json(
            &dispatcher
                .dispatch_line(r#"{"cmd":"getSession","sessionPath":42}"#)
                .await,
        );
        assert_eq!(resp["code"], "INVALID_ARGUMENT");
        assert_eq!(resp["message"], "sessionPath must be a string");

        let resp = dispatcher
            .dispatch_line(r#"{"cmd":"serverInfo","directory":["/a"]}"#)
            .await;
        assert_eq!(resp.code(), Some(error_codes::INVALID_ARGUMENT));

        let resp = dispatcher
            .dispatch_line(r#"{"cmd":"serverInfo","sessionPath":null}"#)
            .await;
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn null_parts_fall_back_to_message() {
        async fn reply(Json(body): Json<Value>) -> Json<Value> {
            Json(json!({
                "info": {"role": "assistant"},
                "parts": [{"type": "text", "text": "ok"}],
                "sent": body
            }))
        }
        let router = Router::new().route("/session/{id}/message", post(reply));
        let dispatcher = Dispatcher::new(test_context(&fake_service(router).await));

        let resp = to_json(
            &dispatcher
                .dispatch_line(r#"{"cmd":"prompt","sessionPath":"ses_1","message":"hi","parts":null}"#)
                .await,
        );
        assert_eq!(resp["type"], "success", "{}", resp);
        assert_eq!(
            resp["data"]["message"]["sent"]["parts"],
            json!([{"type": "text", "text": "hi"}])
        );
    }

    #[tokio::test]
    async fn slow_commands_do_not_block_fast_ones() {
        let router = Router::new().route(
            "/config",
            get(|| async {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                Json(json!({"slow": true}))
            }),
        );
        let dispatcher = Arc::new(Dispatcher::new(test_context(&fake_service(router).await)));
        let input = b"{\"cmd\":\"config\"}\n{\"cmd\":\"serverInfo\"}\n".to_vec();
        let (out_write, out_read) = tokio::io::duplex(64 * 1024);

        run(dispatcher, BufReader::new(&input[..]), out_write)
            .await
            .unwrap();

        let mut lines = BufReader::new(out_read).lines();
        let first: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        let second: Value = serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first["cmd"], "serverInfo");
        assert_eq!(second["cmd"], "config");
        assert_eq!(second["data"]["slow"], true);
    }
}
