//! One async handler per command. Handlers validate their arguments, issue
//! at most one downstream call and shape the result.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use shared::{error_codes, CommandKind, RawRequest};

use crate::client::{ApiRequest, ClientError};
use crate::context::Context;
use crate::health::health_request;
use crate::normalize;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Client(#[from] ClientError),
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => error_codes::INVALID_ARGUMENT,
            Self::Client(e) => e.code().unwrap_or(error_codes::UNKNOWN_ERROR),
        }
    }
}

type HandlerResult = Result<Value, CommandError>;

/// A parsed request with its correlation fields pulled out.
struct Call<'a> {
    ctx: &'a Context,
    session_path: Option<String>,
    directory: Option<String>,
    args: Map<String, Value>,
}

impl Call<'_> {
    fn directory(&self) -> Option<&str> {
        self.ctx.directory_for(self.directory.as_deref())
    }

    fn session(&self) -> Result<&str, CommandError> {
        required(self.session_path.as_deref(), "sessionPath")
    }

    fn args<T: DeserializeOwned>(&self) -> Result<T, CommandError> {
        serde_json::from_value(Value::Object(self.args.clone()))
            .map_err(|e| CommandError::InvalidArgument(format!("invalid arguments: {}", e)))
    }

    async fn send(&self, request: ApiRequest) -> HandlerResult {
        let request = request.with_directory(self.directory());
        Ok(self.ctx.client.call(request).await?)
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, CommandError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| CommandError::InvalidArgument(format!("{} is required", name)))
}

pub async fn handle(ctx: &Context, kind: CommandKind, request: RawRequest) -> HandlerResult {
    let call = Call {
        ctx,
        session_path: request.session_path,
        directory: request.directory,
        args: request.args,
    };
    match kind {
        CommandKind::Health => call.send(health_request()).await,
        CommandKind::ServerInfo => Ok(server_info(&call)),
        CommandKind::Config => call.send(ApiRequest::get(["config"])).await,
        CommandKind::CreateSession => create_session(&call).await,
        CommandKind::GetSession => {
            let id = call.session()?;
            call.send(ApiRequest::get(["session", id])).await
        }
        CommandKind::ListSessions => call.send(ApiRequest::get(["session"])).await,
        CommandKind::Prompt => prompt(&call).await,
        CommandKind::PromptAsync => prompt_async(&call).await,
        CommandKind::FindFiles => find_files(&call).await,
        CommandKind::ListMessages => list_messages(&call).await,
        CommandKind::DeleteSession => {
            let id = call.session()?;
            call.send(ApiRequest::delete(["session", id])).await
        }
        CommandKind::SetAuth => set_auth(&call).await,
        CommandKind::GetProviders => {
            let catalog = call.send(ApiRequest::get(["config", "providers"])).await?;
            let ui = normalize::ui_providers_from_catalog(&catalog);
            Ok(serde_json::to_value(ui).unwrap_or(Value::Null))
        }
        CommandKind::ProviderList => call.send(ApiRequest::get(["provider"])).await,
        CommandKind::ProviderAuth => call.send(ApiRequest::get(["provider", "auth"])).await,
        CommandKind::ProviderOauthAuthorize => oauth(&call, "authorize").await,
        CommandKind::ProviderOauthCallback => oauth(&call, "callback").await,
        CommandKind::RemoveAuth => {
            let args: ProviderArgs = call.args()?;
            let provider = required(args.provider_id.as_deref(), "providerID")?;
            call.send(ApiRequest::delete(["auth", provider])).await
        }
        CommandKind::UpdateConfig => update_config(&call).await,
        CommandKind::Dispose => {
            call.send(ApiRequest::post(["global", "dispose"], json!({})))
                .await
        }
    }
}

fn server_info(call: &Call<'_>) -> Value {
    json!({
        "url": call.ctx.base_url,
        "directory": call.directory(),
        "launched": call.ctx.launched,
    })
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CreateSessionArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    parent_id: Option<String>,
}

async fn create_session(call: &Call<'_>) -> HandlerResult {
    let args: CreateSessionArgs = call.args()?;
    let body = serde_json::to_value(&args).unwrap_or_else(|_| json!({}));
    call.send(ApiRequest::post(["session"], body)).await
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptArgs {
    message: Option<String>,
    /// `null` is treated like an empty list.
    parts: Option<Vec<Value>>,
    /// `"provider/model"` or `{ providerID, modelID }`.
    model: Option<Value>,
    agent: Option<String>,
    system: Option<String>,
    no_reply: Option<bool>,
}

fn model_ref(model: &Value) -> Result<Value, CommandError> {
    let invalid = || {
        CommandError::InvalidArgument(
            "model must be \"providerID/modelID\" or {providerID, modelID}".to_string(),
        )
    };
    match model {
        Value::String(s) => {
            let (provider, model) = s
                .split_once('/')
                .filter(|(p, m)| !p.is_empty() && !m.is_empty())
                .ok_or_else(invalid)?;
            Ok(json!({ "providerID": provider, "modelID": model }))
        }
        Value::Object(map) => {
            let field = |k: &str| map.get(k).and_then(Value::as_str).filter(|s| !s.is_empty());
            match (field("providerID"), field("modelID")) {
                (Some(provider), Some(model)) => {
                    Ok(json!({ "providerID": provider, "modelID": model }))
                }
                _ => Err(invalid()),
            }
        }
        _ => Err(invalid()),
    }
}

/// Request body shared by `prompt` and `promptAsync`.
fn prompt_body(args: &PromptArgs) -> HandlerResult {
    let given = args.parts.as_deref().unwrap_or_default();
    let parts = normalize::build_prompt_parts(args.message.as_deref(), given)
        .ok_or_else(|| {
            CommandError::InvalidArgument("message or a text part is required".to_string())
        })?;
    let mut body = Map::new();
    body.insert("parts".to_string(), Value::Array(parts));
    if let Some(model) = &args.model {
        body.insert("model".to_string(), model_ref(model)?);
    }
    if let Some(agent) = &args.agent {
        body.insert("agent".to_string(), json!(agent));
    }
    if let Some(system) = &args.system {
        body.insert("system".to_string(), json!(system));
    }
    if let Some(no_reply) = args.no_reply {
        body.insert("noReply".to_string(), json!(no_reply));
    }
    Ok(Value::Object(body))
}

async fn prompt(call: &Call<'_>) -> HandlerResult {
    let id = call.session()?;
    let body = prompt_body(&call.args()?)?;
    let message = call
        .send(ApiRequest::post(["session", id, "message"], body))
        .await?;
    let parts = normalize::parse_parts(message.get("parts").unwrap_or(&Value::Null));
    let role = message
        .pointer("/info/role")
        .and_then(Value::as_str)
        .unwrap_or("assistant");
    let text = normalize::extract_message_text(&parts, Some(role));
    Ok(json!({ "text": text, "message": message }))
}

async fn prompt_async(call: &Call<'_>) -> HandlerResult {
    let id = call.session()?;
    let body = prompt_body(&call.args()?)?;
    call.send(ApiRequest::post(["session", id, "prompt_async"], body))
        .await
}

#[derive(Debug, Default, Deserialize)]
struct FindFilesArgs {
    query: Option<String>,
    dirs: Option<bool>,
}

async fn find_files(call: &Call<'_>) -> HandlerResult {
    let args: FindFilesArgs = call.args()?;
    let query = required(args.query.as_deref(), "query")?;
    let mut request = ApiRequest::get(["find", "file"]).with_query("query", query);
    if let Some(dirs) = args.dirs {
        request = request.with_query("dirs", dirs.to_string());
    }
    call.send(request).await
}

#[derive(Debug, Default, Deserialize)]
struct ListMessagesArgs {
    limit: Option<u32>,
}

async fn list_messages(call: &Call<'_>) -> HandlerResult {
    let id = call.session()?;
    let args: ListMessagesArgs = call.args()?;
    let mut request = ApiRequest::get(["session", id, "message"]);
    if let Some(limit) = args.limit {
        request = request.with_query("limit", limit.to_string());
    }
    let raw = call.send(request).await?;
    Ok(normalize::normalize_messages(&raw))
}

#[derive(Debug, Default, Deserialize)]
struct ProviderArgs {
    #[serde(rename = "providerID")]
    provider_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct SetAuthArgs {
    #[serde(rename = "providerID")]
    provider_id: Option<String>,
    key: Option<String>,
    /// Full auth record; takes precedence over `key`.
    auth: Option<Value>,
}

async fn set_auth(call: &Call<'_>) -> HandlerResult {
    let args: SetAuthArgs = call.args()?;
    let provider = required(args.provider_id.as_deref(), "providerID")?;
    let body = match (args.auth, args.key.as_deref()) {
        (Some(auth @ Value::Object(_)), _) => auth,
        (Some(_), _) => {
            return Err(CommandError::InvalidArgument(
                "auth must be an object".to_string(),
            ))
        }
        (None, key) => {
            let key = required(key, "key")?;
            json!({ "type": "api", "key": key })
        }
    };
    call.send(ApiRequest::new(Method::PUT, ["auth", provider]).with_body(body))
        .await
}

#[derive(Debug, Default, Deserialize)]
struct OauthArgs {
    #[serde(rename = "providerID")]
    provider_id: Option<String>,
    method: Option<u32>,
    code: Option<String>,
}

async fn oauth(call: &Call<'_>, step: &str) -> HandlerResult {
    let args: OauthArgs = call.args()?;
    let provider = required(args.provider_id.as_deref(), "providerID")?;
    let mut body = Map::new();
    if let Some(method) = args.method {
        body.insert("method".to_string(), json!(method));
    }
    if let Some(code) = args.code {
        body.insert("code".to_string(), json!(code));
    }
    call.send(ApiRequest::post(
        ["provider", provider, "oauth", step],
        Value::Object(body),
    ))
    .await
}

async fn update_config(call: &Call<'_>) -> HandlerResult {
    let config = match call.args.get("config") {
        Some(config @ Value::Object(_)) => config.clone(),
        Some(_) => {
            return Err(CommandError::InvalidArgument(
                "config must be an object".to_string(),
            ))
        }
        None => {
            return Err(CommandError::InvalidArgument(
                "config is required".to_string(),
            ))
        }
    };
    call.send(ApiRequest::new(Method::PATCH, ["global", "config"]).with_body(config))
        .await
}
