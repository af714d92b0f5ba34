//! Service health: the startup check and the periodic liveness check.

use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::client::{ApiRequest, ClientError, RetryPolicy, RetryingClient};

pub fn health_request() -> ApiRequest {
    ApiRequest::get(["global", "health"])
}

/// Poll health under `policy` until it answers. Used right after launch.
pub async fn wait_until_healthy(
    client: &RetryingClient,
    policy: &RetryPolicy,
) -> Result<Value, ClientError> {
    client.call_with(policy, health_request()).await
}

/// Background liveness check. Failures are logged, never fatal.
pub struct HealthMonitor {
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub fn spawn(client: RetryingClient, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut failures: u32 = 0;
            let check = RetryPolicy::single_attempt();
            loop {
                ticker.tick().await;
                match client.call_with(&check, health_request()).await {
                    Ok(_) => {
                        if failures > 0 {
                            tracing::info!("opencode health recovered after {} failures", failures);
                        }
                        failures = 0;
                        tracing::debug!("opencode health ok");
                    }
                    Err(e) => {
                        failures += 1;
                        tracing::warn!(failures, "opencode health check failed: {}", e);
                    }
                }
            }
        });
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}
