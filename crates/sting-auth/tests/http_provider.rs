//! HTTP identity provider adapter against a mock identity service.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sting_auth::config::{AssuranceConfig, ProviderConfig, TimeoutConfig};
use sting_auth::provider::{
    HttpIdentityProvider, IdentityProvider, PrimaryCredential, ProviderError, StepUpResponse,
    build_provider,
};
use sting_auth::types::{AssuranceLevel, StepUpMethod};
use sting_auth::{
    GateDecision, InMemoryAssuranceStore, InMemoryMarkerStorage, ResourceClass, RouteGate,
    SessionCoordinator, StepUpStart,
};

fn provider_config(server: &MockServer) -> ProviderConfig {
    ProviderConfig {
        base_url: server.uri(),
        allow_http: true,
        ..ProviderConfig::default()
    }
}

fn adapter(server: &MockServer) -> HttpIdentityProvider {
    HttpIdentityProvider::new(&provider_config(server), Duration::from_secs(2)).unwrap()
}

async fn mount_verify_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/primary/verify"))
        .and(body_json(json!({
            "identifier": "ada@example.com",
            "secret": "correct horse"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "principal_id": "user-ada",
            "principal_hint": "ada@example.com",
            "enrolled_methods": ["totp"]
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn verify_primary_success() {
    let server = MockServer::start().await;
    mount_verify_ok(&server).await;

    let principal = adapter(&server)
        .verify_primary(&PrimaryCredential::new("ada@example.com", "correct horse"))
        .await
        .unwrap();
    assert_eq!(principal.principal_id, "user-ada");
    assert_eq!(principal.principal_hint.as_deref(), Some("ada@example.com"));
    assert!(principal.enrolled_methods.contains(&StepUpMethod::Totp));
}

#[tokio::test]
async fn verify_primary_unauthorized_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/primary/verify"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .verify_primary(&PrimaryCredential::new("ada@example.com", "wrong"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Rejected { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn server_errors_are_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/primary/verify"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .verify_primary(&PrimaryCredential::new("ada@example.com", "correct horse"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable { .. }));
}

#[tokio::test]
async fn malformed_body_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/primary/verify"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .verify_primary(&PrimaryCredential::new("ada@example.com", "correct horse"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Protocol { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn slow_provider_times_out_as_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/primary/verify"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "principal_id": "user-ada" }))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let adapter =
        HttpIdentityProvider::new(&provider_config(&server), Duration::from_millis(50)).unwrap();
    let err = adapter
        .verify_primary(&PrimaryCredential::new("ada@example.com", "correct horse"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Unavailable { .. }));
}

#[tokio::test]
async fn enrolled_methods_are_listed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/principals/user-ada/methods"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "methods": ["totp", "passkey"] })),
        )
        .mount(&server)
        .await;

    let methods = adapter(&server).enrolled_methods("user-ada").await.unwrap();
    assert_eq!(methods.len(), 2);
    assert!(methods.contains(&StepUpMethod::Passkey));
}

#[tokio::test]
async fn base_path_is_preserved() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/idp/v1/principals/user-ada/methods"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "methods": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let config = ProviderConfig {
        base_url: format!("{}/idp/v1", server.uri()),
        allow_http: true,
        ..ProviderConfig::default()
    };
    let adapter = HttpIdentityProvider::new(&config, Duration::from_secs(2)).unwrap();
    assert!(adapter.enrolled_methods("user-ada").await.unwrap().is_empty());
}

#[tokio::test]
async fn begin_step_up_issues_challenge() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/step-up/challenges"))
        .and(body_partial_json(json!({
            "principal_id": "user-ada",
            "method": "totp"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "challenge_id": "ch-1",
            "method": "totp",
            "expires_in": 120
        })))
        .mount(&server)
        .await;

    let challenge = adapter(&server)
        .begin_step_up("user-ada", StepUpMethod::Totp)
        .await
        .unwrap();
    assert_eq!(challenge.challenge_id, "ch-1");
    assert_eq!(challenge.method, StepUpMethod::Totp);
    assert!(challenge.expires_at > time::OffsetDateTime::now_utc());
}

#[tokio::test]
async fn begin_step_up_unprocessable_is_unsupported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/step-up/challenges"))
        .respond_with(ResponseTemplate::new(422))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .begin_step_up("user-ada", StepUpMethod::Passkey)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ProviderError::UnsupportedMethod {
            method: StepUpMethod::Passkey
        }
    );
}

#[tokio::test]
async fn begin_step_up_for_another_method_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/step-up/challenges"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "challenge_id": "ch-1",
            "method": "recovery_code",
            "expires_in": 120
        })))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .begin_step_up("user-ada", StepUpMethod::Totp)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Protocol { .. }));
}

#[tokio::test]
async fn begin_step_up_with_unrepresentable_expiry_is_a_protocol_error() {
    // Past the largest signed duration, then past the largest date.
    for expires_in in [u64::MAX, 400_000_000_000] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/step-up/challenges"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "challenge_id": "ch-1",
                "method": "totp",
                "expires_in": expires_in
            })))
            .mount(&server)
            .await;

        let err = adapter(&server)
            .begin_step_up("user-ada", StepUpMethod::Totp)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Protocol { .. }), "{expires_in}: {err}");
    }
}

#[tokio::test]
async fn complete_step_up_on_gone_challenge_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/step-up/challenges/ch-1/complete"))
        .respond_with(ResponseTemplate::new(410))
        .mount(&server)
        .await;

    let err = adapter(&server)
        .complete_step_up("ch-1", &StepUpResponse::new("123456"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Rejected { .. }));
}

#[tokio::test]
async fn duplicate_completion_reaches_the_provider_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/step-up/challenges/ch-1/complete"))
        .and(body_json(json!({ "response": "123456" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "verified": true, "method": "totp" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let provider = build_provider(&provider_config(&server), &TimeoutConfig::default()).unwrap();
    let response = StepUpResponse::new("123456");

    let first = provider.complete_step_up("ch-1", &response).await.unwrap();
    let second = provider.complete_step_up("ch-1", &response).await.unwrap();
    assert!(first.verified);
    assert_eq!(first, second);
}

#[tokio::test]
async fn coordinator_elevates_through_http_adapter() {
    let server = MockServer::start().await;
    mount_verify_ok(&server).await;
    Mock::given(method("POST"))
        .and(path("/step-up/challenges"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "challenge_id": "ch-9",
            "method": "totp",
            "expires_in": 300
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/step-up/challenges/ch-9/complete"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "verified": true, "method": "totp" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = AssuranceConfig::default();
    config.provider = provider_config(&server);
    config.timeouts.store = Duration::from_millis(200);
    let provider = build_provider(&config.provider, &config.timeouts).unwrap();
    let coordinator = Arc::new(
        SessionCoordinator::new(
            config,
            Arc::new(InMemoryAssuranceStore::new()),
            provider,
            Arc::new(InMemoryMarkerStorage::new()),
        )
        .unwrap(),
    );
    let gate = RouteGate::new(coordinator.clone());

    let id = coordinator
        .verify_primary(&PrimaryCredential::new("ada@example.com", "correct horse"), None)
        .await
        .unwrap()
        .session
        .id;
    let decision = gate.authorize(Some(&id), ResourceClass::Elevated).await.unwrap();
    assert_eq!(decision.decision, GateDecision::RequireStepUp);

    let StepUpStart::Challenge(pending) = coordinator
        .begin_step_up(&id, StepUpMethod::Totp)
        .await
        .unwrap()
    else {
        panic!("expected a challenge");
    };
    let outcome = coordinator
        .complete_step_up(&id, &pending.challenge_id, &StepUpResponse::new("123456"))
        .await
        .unwrap();
    assert_eq!(outcome.session.assurance_level, AssuranceLevel::Aal2);

    let decision = gate.authorize(Some(&id), ResourceClass::Elevated).await.unwrap();
    assert_eq!(decision.decision, GateDecision::Allow);
}
