//! Shared fixtures for the provider mock servers
#![allow(dead_code)]

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use identity_search::config::{Config, ResilienceSettings};
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const TOOLKIT_USER: &str = "jambi";
pub const PORTAL_USER: &str = "ferdi";
pub const CLEARANCE_USER: &str = "analyst";

/// URL of a local port nothing listens on (connection refused).
pub fn dead_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    format!("http://127.0.0.1:{}", port)
}

pub fn fast_settings() -> ResilienceSettings {
    ResilienceSettings {
        probe_timeout: Duration::from_millis(300),
        login_timeout: Duration::from_millis(800),
        search_timeout: Duration::from_millis(800),
        degraded_search_timeout: Duration::from_millis(800),
        fallback_deadline: Duration::from_secs(3),
        ..ResilienceSettings::default()
    }
}

pub fn test_config(clearance: &str, toolkit: &str, portal: &str, token_cache: &Path) -> Config {
    Config {
        port: 0,
        clearance_base_url: clearance.to_string(),
        clearance_username: CLEARANCE_USER.to_string(),
        clearance_password: "a-pass".to_string(),
        token_cache_path: token_cache.to_path_buf(),
        toolkit_base_url: toolkit.to_string(),
        toolkit_username: TOOLKIT_USER.to_string(),
        toolkit_password: "b-pass".to_string(),
        portal_base_url: portal.to_string(),
        portal_username: PORTAL_USER.to_string(),
        portal_password: "c-pass".to_string(),
        resilience: fast_settings(),
    }
}

/// Unsigned JWT whose `exp` is `secs` from now.
pub fn jwt_expiring_in(secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + secs;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload =
        URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{}","exp":{}}}"#, CLEARANCE_USER, exp));
    format!("{}.{}.sig", header, payload)
}

pub fn login_form_html(csrf: Option<&str>) -> String {
    let hidden = csrf
        .map(|token| format!(r#"<input type="hidden" name="_csrf" value="{}">"#, token))
        .unwrap_or_default();
    format!(
        concat!(
            r#"<html><body><form method="post">{}<input name="username">"#,
            r#"<input type="password" name="password"></form></body></html>"#
        ),
        hidden
    )
}

pub fn html(body: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/html; charset=UTF-8")
}

/// Login page, login redirect with a session cookie, and the landing page.
pub async fn mount_form_login(
    server: &MockServer,
    login_path: &str,
    landing_path: &str,
    csrf: Option<&str>,
) {
    Mock::given(method("GET"))
        .and(path(login_path))
        .respond_with(html(&login_form_html(csrf)))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path(login_path))
        .respond_with(
            ResponseTemplate::new(302)
                .insert_header("Location", landing_path)
                .insert_header("Set-Cookie", "session=abc123; Path=/"),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path(landing_path))
        .respond_with(html("<html><h1>Dashboard</h1></html>"))
        .mount(server)
        .await;
}

pub async fn mount_clearance_login(server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path("/auth/login"))
        .respond_with(ResponseTemplate::new(405))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/auth/login"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({ "access_token": token })),
        )
        .mount(server)
        .await;
}

/// Number of requests `server` received for `verb` on `request_path`.
pub async fn count_requests(server: &MockServer, verb: &str, request_path: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.method.to_string() == verb && request.url.path() == request_path)
        .count()
}
