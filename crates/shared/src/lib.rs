//! Shared wire types for the opencode sidecar protocol.

mod models;

// Explicit re-exports (avoids rust-analyzer issues with `pub use models::*`)
pub use models::error_codes;
pub use models::{
    CliStatus, CommandKind, MessagePart, ProviderCatalogEntry, RawRequest, Response, UiProvider,
    UiProviders,
};
