//! Shared fixtures for the client integration tests

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use fleety_client::{
    ApiClient, BackoffPolicy, ConnectionMultiplexer, MemoryConnector, SessionManager, Timer,
};
use fleety_shared::ProjectId;

pub const PROJECT: &str = "proj_1";

// ============================================================================
// Timers
// ============================================================================

/// Records every requested delay and never completes
#[derive(Default)]
pub struct ParkedTimer {
    pub delays: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Timer for ParkedTimer {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        std::future::pending::<()>().await;
    }
}

/// Completes the first sleep immediately and parks every later one
#[derive(Default)]
pub struct OneShotTimer {
    fired: AtomicBool,
    pub delays: Mutex<Vec<Duration>>,
}

#[async_trait]
impl Timer for OneShotTimer {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        if self.fired.swap(true, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn api(server: &mockito::ServerGuard) -> ApiClient {
    ApiClient::new(server.url(), Duration::from_secs(5)).unwrap()
}

pub fn session(api: &ApiClient, timer: Arc<dyn Timer>) -> SessionManager {
    SessionManager::new(
        api.clone(),
        ProjectId::from(PROJECT),
        Duration::from_secs(240),
        timer,
    )
}

pub fn multiplexer(connector: Arc<MemoryConnector>) -> ConnectionMultiplexer {
    ConnectionMultiplexer::new(
        connector,
        Arc::new(ParkedTimer::default()),
        BackoffPolicy::new(Duration::from_millis(1000), 5),
    )
}

pub fn expires_in(minutes: i64) -> String {
    (OffsetDateTime::now_utc() + time::Duration::minutes(minutes))
        .format(&Rfc3339)
        .unwrap()
}

pub fn session_body(token: &str) -> String {
    json!({
        "token": token,
        "expires_at": expires_in(5),
        "project_id": PROJECT,
    })
    .to_string()
}

pub fn message_json(id: &str, author: &str, content: &str, read_by: &[&str]) -> Value {
    json!({
        "id": id,
        "author": author,
        "content": content,
        "timestamp": "2025-01-01T00:00:00Z",
        "read_by": read_by,
        "type": "message",
    })
}

pub fn ticket_json(slug: &str, status: &str, messages: Vec<Value>) -> Value {
    json!({
        "id": format!("id-{}", slug),
        "slug": slug,
        "title": format!("Ticket {}", slug),
        "description": "Something is broken",
        "status": status,
        "created_at": "2025-01-01T00:00:00Z",
        "updated_at": "2025-01-01T00:00:00Z",
        "created_by_ai": false,
        "messages": messages,
    })
}

pub fn ticket_path(slug: &str) -> String {
    format!("/tickets/{}/{}", PROJECT, slug)
}

// ============================================================================
// Waiting
// ============================================================================

/// Let spawned tasks on the current-thread runtime make progress
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Poll `check` until it holds or two seconds pass
pub async fn wait_until<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Like [`wait_until`] for async conditions
pub async fn wait_until_async<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
