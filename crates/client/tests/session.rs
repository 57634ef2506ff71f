//! Session acquisition and renewal against a mocked backend

#![allow(clippy::unwrap_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use mockito::Matcher;
use serde_json::json;

use common::{OneShotTimer, ParkedTimer};
use fleety_shared::WidgetError;

#[tokio::test]
async fn test_acquire_stores_token_and_schedules_renewal() {
    let mut server = mockito::Server::new_async().await;
    let init = server
        .mock("POST", "/init-session")
        .match_body(Matcher::Json(json!({"project_id": common::PROJECT})))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(common::session_body("tok-1"))
        .expect(2)
        .create_async()
        .await;

    let timer = Arc::new(ParkedTimer::default());
    let session = common::session(&common::api(&server), timer.clone());

    let token = session.acquire().await.unwrap();
    assert_eq!(token.bearer(), "tok-1");
    assert_eq!(session.token().map(|t| t.token), Some("tok-1".to_string()));
    assert!(session.has_pending_renewal());

    common::settle().await;
    let delays = timer.delays.lock().unwrap().clone();
    assert_eq!(delays.len(), 1);
    // Renewal at the configured delay, capped at 80% of a 5 minute lifetime
    assert!(delays[0] <= Duration::from_secs(240));
    assert!(delays[0] > Duration::from_secs(230));

    // Acquiring again replaces the pending renewal
    session.acquire().await.unwrap();
    assert!(session.has_pending_renewal());

    init.assert_async().await;
}

#[tokio::test]
async fn test_failed_acquire_leaves_session_empty() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/init-session")
        .with_status(500)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"database unavailable"}"#)
        .create_async()
        .await;

    let session = common::session(&common::api(&server), Arc::new(ParkedTimer::default()));

    let err = session.acquire().await.unwrap_err();
    assert_eq!(
        err,
        WidgetError::Server {
            status: 500,
            message: "database unavailable".to_string()
        }
    );
    assert!(session.token().is_none());
    assert!(!session.has_pending_renewal());
}

#[tokio::test]
async fn test_renewal_reacquires_before_expiry() {
    let mut server = mockito::Server::new_async().await;
    let init = server
        .mock("POST", "/init-session")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(common::session_body("tok-renewed"))
        .expect(2)
        .create_async()
        .await;

    let timer = Arc::new(OneShotTimer::default());
    let session = common::session(&common::api(&server), timer.clone());
    session.acquire().await.unwrap();

    // The first renewal fires immediately; the one it schedules stays parked
    assert!(common::wait_until(|| timer.delays.lock().unwrap().len() == 2).await);
    init.assert_async().await;
    assert!(session.token().is_some());
    assert!(session.has_pending_renewal());
}

#[tokio::test]
async fn test_concurrent_callers_share_one_acquisition() {
    let mut server = mockito::Server::new_async().await;
    let init = server
        .mock("POST", "/init-session")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(common::session_body("tok-1"))
        .expect(1)
        .create_async()
        .await;

    let session = common::session(&common::api(&server), Arc::new(ParkedTimer::default()));

    let (a, b) = tokio::join!(session.ensure_token(), session.ensure_token());
    assert_eq!(a.unwrap().token, "tok-1");
    assert_eq!(b.unwrap().token, "tok-1");

    init.assert_async().await;
}

#[tokio::test]
async fn test_invalidate_forces_new_acquisition() {
    let mut server = mockito::Server::new_async().await;
    let init = server
        .mock("POST", "/init-session")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(common::session_body("tok-1"))
        .expect(2)
        .create_async()
        .await;

    let session = common::session(&common::api(&server), Arc::new(ParkedTimer::default()));
    session.ensure_token().await.unwrap();
    session.ensure_token().await.unwrap();

    session.invalidate();
    assert!(session.token().is_none());
    session.ensure_token().await.unwrap();

    init.assert_async().await;
}
