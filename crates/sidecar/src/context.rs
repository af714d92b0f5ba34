//! Per-process state shared by every command handler.

use crate::client::RetryingClient;

/// Built once at startup, read-only afterwards.
#[derive(Debug, Clone)]
pub struct Context {
    pub base_url: String,
    pub client: RetryingClient,
    /// Default project directory for downstream calls.
    pub directory: Option<String>,
    /// Whether the service was launched by this process, as opposed to the
    /// fallback address.
    pub launched: bool,
}

impl Context {
    pub fn new(client: RetryingClient, directory: Option<String>, launched: bool) -> Self {
        Self {
            base_url: client.base_url().to_string(),
            client,
            directory,
            launched,
        }
    }

    /// The request's own directory wins over the process default.
    pub fn directory_for<'a>(&'a self, requested: Option<&'a str>) -> Option<&'a str> {
        requested
            .filter(|d| !d.trim().is_empty())
            .or(self.directory.as_deref())
    }
}
