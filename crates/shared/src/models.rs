//! Protocol requests, responses and payload models.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Command names accepted on the sidecar's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    Health,
    ServerInfo,
    Config,
    CreateSession,
    GetSession,
    ListSessions,
    Prompt,
    PromptAsync,
    FindFiles,
    ListMessages,
    DeleteSession,
    SetAuth,
    GetProviders,
    ProviderList,
    ProviderAuth,
    ProviderOauthAuthorize,
    ProviderOauthCallback,
    RemoveAuth,
    UpdateConfig,
    Dispose,
}

impl CommandKind {
    pub const ALL: [CommandKind; 20] = [
        Self::Health,
        Self::ServerInfo,
        Self::Config,
        Self::CreateSession,
        Self::GetSession,
        Self::ListSessions,
        Self::Prompt,
        Self::PromptAsync,
        Self::FindFiles,
        Self::ListMessages,
        Self::DeleteSession,
        Self::SetAuth,
        Self::GetProviders,
        Self::ProviderList,
        Self::ProviderAuth,
        Self::ProviderOauthAuthorize,
        Self::ProviderOauthCallback,
        Self::RemoveAuth,
        Self::UpdateConfig,
        Self::Dispose,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Health => "health",
            Self::ServerInfo => "serverInfo",
            Self::Config => "config",
            Self::CreateSession => "createSession",
            Self::GetSession => "getSession",
            Self::ListSessions => "listSessions",
            Self::Prompt => "prompt",
            Self::PromptAsync => "promptAsync",
            Self::FindFiles => "findFiles",
            Self::ListMessages => "listMessages",
            Self::DeleteSession => "deleteSession",
            Self::SetAuth => "setAuth",
            Self::GetProviders => "getProviders",
            Self::ProviderList => "providerList",
            Self::ProviderAuth => "providerAuth",
            Self::ProviderOauthAuthorize => "providerOauthAuthorize",
            Self::ProviderOauthCallback => "providerOauthCallback",
            Self::RemoveAuth => "removeAuth",
            Self::UpdateConfig => "updateConfig",
            Self::Dispose => "dispose",
        }
    }

    /// Look up a command by its wire name. Names are case-sensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by error responses.
pub mod error_codes {
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const UNKNOWN_CMD: &str = "UNKNOWN_CMD";
    pub const INVALID_ARGUMENT: &str = "INVALID_ARGUMENT";
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
    pub const CONNECTION_ERROR: &str = "CONNECTION_ERROR";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const HTTP_ERROR: &str = "HTTP_ERROR";
}

/// One request line, split into the common correlation fields and the
/// command-specific remainder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(
        rename = "sessionPath",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

/// One response line. Exactly one is written per parsed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    Success {
        cmd: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl Response {
    pub fn success(cmd: impl Into<String>, data: Value) -> Self {
        Self::Success {
            cmd: cmd.into(),
            data: Some(data),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Success { .. } => None,
            Self::Error { code, .. } => code.as_deref(),
        }
    }
}

// --- Payloads ---

/// One part of a conversational turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthetic: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignored: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: Some("text".to_string()),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// A visible text part: typed `text`, neither synthetic nor ignored.
    pub fn is_visible_text(&self) -> bool {
        self.kind.as_deref() == Some("text")
            && !self.synthetic.unwrap_or(false)
            && !self.ignored.unwrap_or(false)
    }
}

/// Provider record as returned by the service's catalog endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCatalogEntry {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub models: Map<String, Value>,
}

/// Provider flattened for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiProvider {
    pub name: String,
    pub models: Vec<String>,
}

/// Providers plus per-provider default model, all as `providerID/modelID`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UiProviders {
    pub providers: Vec<UiProvider>,
    pub defaults: BTreeMap<String, String>,
}

/// Whether the service CLI is installed, and which version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliStatus {
    pub installed: bool,
    pub version: Option<String>,
    pub path: Option<String>,
}
