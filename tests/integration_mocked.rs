/// Integration tests with mocked providers
/// Exercises the complete search workflow without hitting real backends
mod common;

use common::*;
use identity_search::credentials::Credential;
use identity_search::errors::{ErrorKind, SearchError};
use identity_search::models::{ProviderId, ProviderOutcome, SearchParams, SkipReason};
use identity_search::orchestrator::{cancellation, SearchOptions, SearchOrchestrator};
use serde_json::json;
use std::time::Duration;
use identity_search::token_manager::TokenStore;
use wiremock::matchers::{any, body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mount_toolkit(server: &MockServer, people: serde_json::Value) {
    mount_form_login(server, "/auth/login", "/toolkit", Some("tok123")).await;
    Mock::given(method("GET"))
        .and(path("/toolkit/api/identity/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "error": "",
            "person": people,
            "success": true
        })))
        .mount(server)
        .await;
}

async fn mount_portal(server: &MockServer, people: serde_json::Value) {
    mount_form_login(server, "/login.php", "/index.php", None).await;
    Mock::given(method("GET"))
        .and(path("/cari_nama.php"))
        .respond_with(ResponseTemplate::new(200).set_body_json(people))
        .mount(server)
        .await;
}

async fn untouched() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(any())
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_primary_success_returns_only_primary_records() {
    let clearance = MockServer::start().await;
    mount_clearance_login(&clearance, &jwt_expiring_in(3600)).await;
    Mock::given(method("GET"))
        .and(path("/clearance/ktp/search"))
        .and(query_param("name", "BUDI"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "person": [
                {"ktp_number": "1571010101900001", "full_name": "BUDI A"},
                {"ktp_number": "1571010101900002", "full_name": "BUDI B"},
                {"ktp_number": "1571010101900003", "full_name": "BUDI C"}
            ]
        })))
        .expect(1)
        .mount(&clearance)
        .await;

    let toolkit = untouched().await;
    let portal = untouched().await;
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &clearance.uri(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );

    let orchestrator = SearchOrchestrator::from_config(&config);
    let result = orchestrator.search(&SearchParams::by_name("BUDI")).await.unwrap();

    assert_eq!(result.records.len(), 3);
    assert!(result.records.iter().all(|r| r.source_provider == ProviderId::Clearance));
    assert!(!result.flags.used_fallback);
    assert!(!result.flags.provider_a_unavailable);
    assert_eq!(result.provider_counts.get(&ProviderId::Clearance), Some(&3));
    assert_eq!(
        result.outcome_of(ProviderId::Toolkit),
        Some(&ProviderOutcome::Skipped {
            reason: SkipReason::NotNeeded
        })
    );
    assert!(result.reason.is_none());
}

#[tokio::test]
async fn test_unreachable_login_falls_back_to_both_secondaries() {
    let clearance = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&clearance)
        .await;
    // Login answers after the login timeout: Unreachable.
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&clearance)
        .await;

    let toolkit = MockServer::start().await;
    mount_toolkit(&toolkit, json!([{"ktp_number": "1", "full_name": "BUDI"}])).await;
    let portal = MockServer::start().await;
    mount_portal(&portal, json!([])).await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &clearance.uri(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    let orchestrator = SearchOrchestrator::from_config(&config);

    let result = orchestrator.search(&SearchParams::by_name("BUDI")).await.unwrap();

    assert!(result.flags.provider_a_unavailable);
    assert!(result.flags.used_fallback);
    assert!(!result.flags.all_providers_unavailable);
    assert_eq!(count_requests(&toolkit, "GET", "/toolkit/api/identity/search").await, 1);
    assert_eq!(count_requests(&portal, "GET", "/cari_nama.php").await, 1);
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.outcome_of(ProviderId::Portal), Some(&ProviderOutcome::Empty));
    match result.outcome_of(ProviderId::Clearance) {
        Some(ProviderOutcome::Failed { kind, .. }) => assert_eq!(*kind, ErrorKind::Unreachable),
        other => panic!("unexpected clearance outcome: {:?}", other),
    }

    // The failed login tripped the breaker.
    assert!(!orchestrator.availability().is_available);
}

#[tokio::test]
async fn test_marked_unavailable_skips_primary_without_requests() {
    let clearance_url = dead_url();
    let toolkit = MockServer::start().await;
    mount_toolkit(&toolkit, json!([])).await;
    let portal = MockServer::start().await;
    mount_portal(&portal, json!([])).await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &clearance_url,
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    let orchestrator = SearchOrchestrator::from_config(&config);

    // First search: probe fails and trips the breaker.
    let first = orchestrator.search(&SearchParams::by_name("SITI")).await.unwrap();
    assert!(first.flags.provider_a_unavailable);

    // Second search: answered from breaker state.
    let second = orchestrator.search(&SearchParams::by_name("SITI")).await.unwrap();
    assert_eq!(
        second.outcome_of(ProviderId::Clearance),
        Some(&ProviderOutcome::Skipped {
            reason: SkipReason::MarkedUnavailable
        })
    );
    // Both secondaries answered empty: nothing came back from anywhere.
    assert!(second.flags.all_providers_unavailable);
    let reason = second.reason.unwrap_or_default();
    assert!(reason.starts_with("All identity backends are unavailable"));
    assert!(reason.contains("never tried"));
    assert!(reason.contains("responded with no records"));
}

#[tokio::test]
async fn test_rejected_cached_token_is_replaced_and_search_retried() {
    let first_token = jwt_expiring_in(3600);
    let second_token = jwt_expiring_in(7200);

    let clearance = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(405))
        .mount(&clearance)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": first_token })),
        )
        .up_to_n_times(1)
        .mount(&clearance)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "access_token": second_token })),
        )
        .mount(&clearance)
        .await;
    Mock::given(method("GET"))
        .and(path("/clearance/ktp/search"))
        .and(header("authorization", format!("Bearer {}", first_token).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&clearance)
        .await;
    Mock::given(method("GET"))
        .and(path("/clearance/ktp/search"))
        .and(header("authorization", format!("Bearer {}", second_token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "person": [{"ktp_number": "1571010101900001", "full_name": "BUDI A"}]
        })))
        .expect(1)
        .mount(&clearance)
        .await;

    let toolkit = untouched().await;
    let portal = untouched().await;
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("token.json");
    let config = test_config(&clearance.uri(), &toolkit.uri(), &portal.uri(), &cache);

    let result = SearchOrchestrator::from_config(&config)
        .search(&SearchParams::by_name("BUDI"))
        .await
        .unwrap();

    assert_eq!(result.records.len(), 1);
    assert!(!result.flags.used_fallback);
    assert!(!result.flags.provider_a_auth_failed);
    assert_eq!(count_requests(&clearance, "POST", "/auth/login").await, 2);
    assert_eq!(count_requests(&clearance, "GET", "/clearance/ktp/search").await, 2);

    let cached = TokenStore::new(cache.clone()).load().await.unwrap();
    assert_eq!(cached.raw_value, second_token);
}

#[tokio::test]
async fn test_merge_prefers_toolkit_and_keeps_records_without_nik() {
    let toolkit = MockServer::start().await;
    mount_toolkit(
        &toolkit,
        json!([
            {"ktp_number": "1", "full_name": "ONE"},
            {"ktp_number": "2", "full_name": "TWO FROM TOOLKIT"}
        ]),
    )
    .await;
    let portal = MockServer::start().await;
    mount_portal(
        &portal,
        json!([
            {"nik": "2", "nama_lengkap": "TWO FROM PORTAL"},
            {"nik": "3", "nama_lengkap": "THREE"},
            {"nik": "", "nama_lengkap": "NO NIK"}
        ]),
    )
    .await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &dead_url(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    let orchestrator = SearchOrchestrator::from_config(&config);

    let result = orchestrator.search(&SearchParams::by_name("BUDI")).await.unwrap();

    let niks: Vec<_> = result.records.iter().map(|r| r.nik.as_str()).collect();
    assert_eq!(niks, vec!["1", "2", "3", ""]);
    assert_eq!(result.records[1].full_name, "TWO FROM TOOLKIT");
    assert_eq!(result.records[1].source_provider, ProviderId::Toolkit);
    assert_eq!(result.records[2].source_provider, ProviderId::Portal);
    assert_eq!(result.provider_counts.get(&ProviderId::Toolkit), Some(&2));
    assert_eq!(result.provider_counts.get(&ProviderId::Portal), Some(&3));
}

#[tokio::test]
async fn test_all_providers_down_is_a_typed_empty_result() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dead_url(), &dead_url(), &dead_url(), &dir.path().join("token.json"));
    let orchestrator = SearchOrchestrator::from_config(&config);

    let result = orchestrator.search(&SearchParams::by_name("BUDI")).await.unwrap();

    assert!(result.records.is_empty());
    assert!(result.flags.all_providers_unavailable);
    assert!(result.flags.provider_a_unavailable);
    let reason = result.reason.unwrap_or_default();
    assert!(reason.starts_with("All identity backends are unavailable"));
    assert!(reason.contains("toolkit: tried, failed"));
}

#[tokio::test]
async fn test_secondary_without_applicable_query_is_skipped() {
    let toolkit = MockServer::start().await;
    mount_toolkit(&toolkit, json!([{"ktp_number": "1571010101900001"}])).await;
    let portal = untouched().await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &dead_url(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    let orchestrator = SearchOrchestrator::from_config(&config);

    let result = orchestrator
        .search(&SearchParams::by_nik("1571-0101-0190-0001"))
        .await
        .unwrap();

    assert_eq!(result.records.len(), 1);
    assert_eq!(
        result.outcome_of(ProviderId::Portal),
        Some(&ProviderOutcome::Skipped {
            reason: SkipReason::NoApplicableQuery
        })
    );
    // Normalized NIK reached the toolkit.
    let requests = toolkit.received_requests().await.unwrap_or_default();
    assert!(requests
        .iter()
        .any(|r| r.url.query().unwrap_or_default().contains("ktp_number=1571010101900001")));
}

#[tokio::test]
async fn test_parse_error_does_not_abort_merge() {
    let toolkit = MockServer::start().await;
    mount_form_login(&toolkit, "/auth/login", "/toolkit", Some("tok123")).await;
    Mock::given(method("GET"))
        .and(path("/toolkit/api/identity/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": false})))
        .mount(&toolkit)
        .await;
    let portal = MockServer::start().await;
    mount_portal(&portal, json!([{"nik": "9", "nama": "NINE"}])).await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &dead_url(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    let result = SearchOrchestrator::from_config(&config)
        .search(&SearchParams::by_name("NINE"))
        .await
        .unwrap();

    assert_eq!(result.records.len(), 1);
    match result.outcome_of(ProviderId::Toolkit) {
        Some(ProviderOutcome::Failed { kind, .. }) => assert_eq!(*kind, ErrorKind::Parse),
        other => panic!("unexpected toolkit outcome: {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_caller_credentials_surface_as_auth_error() {
    let clearance = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&clearance)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "error",
            "message": "invalid credentials"
        })))
        .mount(&clearance)
        .await;
    let toolkit = untouched().await;
    let portal = untouched().await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &clearance.uri(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    let orchestrator = SearchOrchestrator::from_config(&config);

    let err = orchestrator
        .search_as(&SearchParams::by_name("BUDI"), Credential::new("caller", "wrong"))
        .await
        .unwrap_err();

    match err {
        SearchError::Auth(inner) => assert!(inner.to_string().contains("invalid credentials")),
        other => panic!("expected auth error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_rejected_configured_credentials_only_set_flag() {
    let clearance = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&clearance)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&clearance)
        .await;
    let toolkit = MockServer::start().await;
    mount_toolkit(&toolkit, json!([])).await;
    let portal = MockServer::start().await;
    mount_portal(&portal, json!([])).await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &clearance.uri(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    let result = SearchOrchestrator::from_config(&config)
        .search(&SearchParams::by_name("BUDI"))
        .await
        .unwrap();

    assert!(result.flags.provider_a_auth_failed);
    assert!(result.flags.used_fallback);
}

#[tokio::test]
async fn test_caller_credentials_never_reach_secondaries() {
    let toolkit = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("caller"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&toolkit)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .and(body_string_contains(format!("username={}", TOOLKIT_USER)))
        .and(body_string_contains("_csrf=tok123"))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", "/toolkit")
                .insert_header("Set-Cookie", "session=abc123; Path=/"),
        )
        .expect(1)
        .mount(&toolkit)
        .await;
    Mock::given(method("GET"))
        .and(path("/auth/login"))
        .respond_with(html(&login_form_html(Some("tok123"))))
        .mount(&toolkit)
        .await;
    Mock::given(method("GET"))
        .and(path("/toolkit"))
        .respond_with(html("<h1>Dashboard</h1>"))
        .mount(&toolkit)
        .await;
    Mock::given(method("GET"))
        .and(path("/toolkit/api/identity/search"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"person": [{"ktp_number": "5"}]})),
        )
        .mount(&toolkit)
        .await;

    let portal = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_string_contains("caller"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&portal)
        .await;
    mount_portal(&portal, json!([])).await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &dead_url(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    let orchestrator = SearchOrchestrator::from_config(&config);

    let result = orchestrator
        .search_as(&SearchParams::by_name("BUDI"), Credential::new("caller", "caller-pass"))
        .await
        .unwrap();

    assert_eq!(result.records.len(), 1);
    assert!(result.flags.provider_a_unavailable);
}

#[tokio::test]
async fn test_cancellation_returns_merged_partial_results() {
    let toolkit = MockServer::start().await;
    mount_toolkit(&toolkit, json!([{"ktp_number": "1"}])).await;

    let portal = MockServer::start().await;
    mount_form_login(&portal, "/login.php", "/index.php", None).await;
    Mock::given(method("GET"))
        .and(path("/cari_nama.php"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&portal)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(
        &dead_url(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    config.resilience.degraded_search_timeout = Duration::from_secs(20);
    config.resilience.fallback_deadline = Duration::from_secs(30);
    let orchestrator = SearchOrchestrator::from_config(&config);

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1500)).await;
        handle.cancel();
    });

    let started = std::time::Instant::now();
    let result = orchestrator
        .run(&SearchParams::by_name("BUDI"), &SearchOptions::default(), &signal)
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(result.flags.incomplete);
    assert_eq!(result.records.len(), 1);
    assert_eq!(result.outcome_of(ProviderId::Portal), Some(&ProviderOutcome::Cancelled));
    assert_eq!(
        result.outcome_of(ProviderId::Toolkit),
        Some(&ProviderOutcome::Succeeded { records: 1 })
    );
}

#[tokio::test]
async fn test_invalid_params_rejected_before_any_request() {
    let clearance = untouched().await;
    let toolkit = untouched().await;
    let portal = untouched().await;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(
        &clearance.uri(),
        &toolkit.uri(),
        &portal.uri(),
        &dir.path().join("token.json"),
    );
    let orchestrator = SearchOrchestrator::from_config(&config);

    let err = orchestrator.search(&SearchParams::default()).await.unwrap_err();
    assert!(matches!(err, SearchError::InvalidParams(_)));

    let err = orchestrator.search(&SearchParams::by_nik("123")).await.unwrap_err();
    assert!(matches!(err, SearchError::InvalidParams(_)));
}
