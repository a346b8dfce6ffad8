//! Integration tests for the directory-backed admission path.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::secret::SecretString;
use common::types::{ConsultationId, UserId};
use consult_controller::admission::{AdmissionGate, Authorizer, DirectoryAuthorizer};
use consult_controller::errors::CoreError;
use serde_json::json;
use signal_protocol::{DenyReason, Role};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn authorizer_for(server: &MockServer) -> DirectoryAuthorizer {
    DirectoryAuthorizer::new(
        server.uri(),
        SecretString::from("svc-token"),
        Duration::from_secs(2),
    )
    .expect("client should build")
}

#[tokio::test]
async fn test_authorize_success_returns_role_and_servers() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/internal/consultations/consult-1/authorize"))
        .and(header("authorization", "Bearer svc-token"))
        .and(body_json(json!({"user_id": "dr-a"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "role": "provider",
            "ice_servers": [
                {"urls": ["stun:stun.internal:3478"]},
                {
                    "urls": ["turn:turn.internal:3478"],
                    "username": "u",
                    "credential": "c"
                }
            ]
        })))
        .mount(&server)
        .await;

    let authorizer = authorizer_for(&server);
    let grant = authorizer
        .authorize(&ConsultationId::from("consult-1"), &UserId::from("dr-a"))
        .await
        .expect("authorization should succeed");

    assert_eq!(grant.role, Role::Provider);
    assert_eq!(grant.config.ice_servers.len(), 2);
    assert_eq!(
        grant.config.ice_servers[0].urls,
        vec!["stun:stun.internal:3478".to_string()]
    );
}

#[tokio::test]
async fn test_authorize_forbidden_maps_to_not_authorized() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let authorizer = authorizer_for(&server);
    let result = authorizer
        .authorize(&ConsultationId::from("consult-1"), &UserId::from("mallory"))
        .await;

    assert!(matches!(result, Err(CoreError::NotAuthorized)));
}

#[tokio::test]
async fn test_authorize_unknown_consultation_maps_to_not_authorized() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let authorizer = authorizer_for(&server);
    let result = authorizer
        .authorize(&ConsultationId::from("gone"), &UserId::from("dr-a"))
        .await;

    assert!(matches!(result, Err(CoreError::NotAuthorized)));
}

#[tokio::test]
async fn test_directory_failure_maps_to_server_busy_denial() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let authorizer = authorizer_for(&server);
    let err = authorizer
        .authorize(&ConsultationId::from("consult-1"), &UserId::from("dr-a"))
        .await
        .expect_err("5xx should fail");

    assert!(matches!(err, CoreError::Directory(_)));
    assert_eq!(err.deny_reason(), Some(DenyReason::ServerBusy));
}

#[tokio::test]
async fn test_malformed_directory_response_is_a_directory_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let authorizer = authorizer_for(&server);
    let result = authorizer
        .authorize(&ConsultationId::from("consult-1"), &UserId::from("dr-a"))
        .await;

    assert!(matches!(result, Err(CoreError::Directory(_))));
}

#[tokio::test]
async fn test_gate_times_out_slow_directory() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"role": "provider"}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let authorizer = authorizer_for(&server);
    let gate = AdmissionGate::new(Arc::new(authorizer), Duration::from_millis(100), &[]);

    let result = gate
        .authorize(&ConsultationId::from("consult-1"), &UserId::from("dr-a"))
        .await;

    assert!(matches!(result, Err(CoreError::AuthorizationTimeout)));
}
