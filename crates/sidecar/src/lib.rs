//! opencode sidecar library: service launcher, retrying HTTP client, payload
//! normalization and the stdin/stdout command protocol.

pub mod bridge;
pub mod cli;
pub mod client;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod health;
pub mod normalize;
pub mod service;

#[cfg(test)]
mod test_support;
