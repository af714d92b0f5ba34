//! Fakes shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use crate::client::{OpencodeApi, RetryPolicy, RetryingClient};
use crate::context::Context;

/// Serve `router` on an ephemeral local port and return its base URL.
pub async fn fake_service(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Counts requests reaching a fake endpoint.
#[derive(Clone, Default)]
pub struct HitCounter(Arc<AtomicUsize>);

impl HitCounter {
    /// Record a hit and return the running total.
    pub fn hit(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Client with short retry delays, for tests that exercise retries.
pub fn test_client(base_url: &str) -> RetryingClient {
    let api = OpencodeApi::new(base_url, Duration::from_secs(5)).unwrap();
    RetryingClient::new(
        api,
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(5),
            multiplier: 1.0,
        },
    )
}

pub fn test_context(base_url: &str) -> Arc<Context> {
    Arc::new(Context::new(test_client(base_url), None, true))
}
