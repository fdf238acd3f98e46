//! Cookie-session handling for the form-login providers (Toolkit, Portal).
//!
//! # Reuse policy
//!
//! - younger than `trust_window` (10 min): reused as is, no request
//! - younger than `ttl` (30 min): one probe request; a login page or 401/403
//!   means the server dropped it, so log in again
//! - older than `ttl`: log in again
//!
//! A real request that comes back as a login page (or as HTML where JSON was
//! expected) discards the session and is retried once with a fresh login.

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{CONTENT_TYPE, ORIGIN, REFERER};
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use uuid::Uuid;

use crate::clock::{elapsed_between, SharedClock};
use crate::credentials::{Credential, ProviderKind};
use crate::errors::ProviderError;
use crate::models::ProviderId;
use crate::warning_throttle::WarningThrottle;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// A provider response read to the end, as handed to parsers and detectors.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    /// URL after redirects.
    pub final_url: String,
    pub content_type: String,
    pub body: String,
}

impl RawResponse {
    pub async fn capture(
        provider: ProviderId,
        response: reqwest::Response,
    ) -> Result<Self, ProviderError> {
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(provider, e))?;

        Ok(Self {
            status,
            final_url,
            content_type,
            body,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_html(&self) -> bool {
        self.content_type.to_ascii_lowercase().contains("text/html")
            || self.body.trim_start().starts_with('<')
    }

    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.status, 401 | 403)
    }
}

/// Decides whether a response is the provider's login page.
pub trait LoginPageDetector: Send + Sync {
    fn is_login_page(&self, response: &RawResponse) -> bool;
}

impl<F> LoginPageDetector for F
where
    F: Fn(&RawResponse) -> bool + Send + Sync,
{
    fn is_login_page(&self, response: &RawResponse) -> bool {
        self(response)
    }
}

/// Login page = an answer that ended up on a login path, or an HTML answer
/// carrying a login-form marker.
#[derive(Debug, Clone)]
pub struct FormMarkerDetector {
    url_markers: Vec<String>,
    body_markers: Vec<String>,
}

impl FormMarkerDetector {
    pub fn new<U, B>(url_markers: U, body_markers: B) -> Self
    where
        U: IntoIterator,
        U::Item: Into<String>,
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            url_markers: url_markers
                .into_iter()
                .map(|m| m.into().to_ascii_lowercase())
                .collect(),
            body_markers: body_markers
                .into_iter()
                .map(|m| m.into().to_ascii_lowercase())
                .collect(),
        }
    }

    /// Password inputs are the marker every login form shares.
    pub fn for_login_path(path: &str) -> Self {
        Self::new([path], [r#"type="password""#, r#"name="password""#, "type='password'"])
    }
}

impl LoginPageDetector for FormMarkerDetector {
    fn is_login_page(&self, response: &RawResponse) -> bool {
        let url = response.final_url.to_ascii_lowercase();
        if self.url_markers.iter().any(|marker| url.contains(marker)) {
            return true;
        }
        if !response.is_html() {
            return false;
        }
        let body = response.body.to_ascii_lowercase();
        self.body_markers.iter().any(|marker| body.contains(marker))
    }
}

/// Value of the hidden `<input name="{field}" value="...">` on a login page.
pub fn extract_hidden_input(html: &str, field: &str) -> Option<String> {
    let tag = Regex::new(&format!(
        r#"(?is)<input[^>]*name\s*=\s*["']{}["'][^>]*>"#,
        regex::escape(field)
    ))
    .ok()?;
    let value = Regex::new(r#"(?is)value\s*=\s*["']([^"']*)["']"#).ok()?;

    let input = tag.find(html)?;
    value
        .captures(input.as_str())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub login_url: String,
    /// Cheap authenticated page used to validate an older session.
    pub probe_url: String,
    pub origin: String,
    pub username_field: String,
    pub password_field: String,
    /// Hidden anti-forgery input to copy from the login page, if any.
    pub csrf_field: Option<String>,
    /// Search endpoints answer JSON; an HTML answer means the session is gone.
    pub expects_json: bool,
    pub ttl: Duration,
    pub trust_window: Duration,
    pub login_timeout: Duration,
    pub probe_timeout: Duration,
}

/// An authenticated cookie session.
#[derive(Clone)]
pub struct WebSession {
    pub id: Uuid,
    pub provider_id: ProviderId,
    client: reqwest::Client,
    jar: Arc<Jar>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl WebSession {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn has_cookie_for(&self, url: &url::Url) -> bool {
        self.jar.cookies(url).is_some()
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.created_at, now)
    }
}

impl fmt::Debug for WebSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSession")
            .field("id", &self.id)
            .field("provider_id", &self.provider_id)
            .field("created_at", &self.created_at)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

pub struct SessionManager<P: ProviderKind> {
    credential: Credential<P>,
    settings: SessionSettings,
    detector: Arc<dyn LoginPageDetector>,
    clock: SharedClock,
    throttle: WarningThrottle,
    current: RwLock<Option<WebSession>>,
}

impl<P: ProviderKind> SessionManager<P> {
    pub fn new(
        credential: Credential<P>,
        settings: SessionSettings,
        detector: Arc<dyn LoginPageDetector>,
        clock: SharedClock,
        throttle: WarningThrottle,
    ) -> Self {
        Self {
            credential,
            settings,
            detector,
            clock,
            throttle,
            current: RwLock::new(None),
        }
    }

    pub fn provider(&self) -> ProviderId {
        P::ID
    }

    pub fn current(&self) -> Option<WebSession> {
        self.read().clone()
    }

    /// Returns a usable session, logging in when there is none or the cached
    /// one can no longer be trusted.
    pub async fn get_session(&self) -> Result<WebSession, ProviderError> {
        let cached = self.read().clone();

        if let Some(session) = cached {
            let age = session.age(self.clock.now());

            if age < self.settings.trust_window {
                return Ok(session);
            }

            if age < session.ttl {
                match self.probe(&session).await {
                    Ok(true) => return Ok(session),
                    Ok(false) => {
                        tracing::info!("{}: session no longer accepted, logging in again", P::ID);
                        self.discard(&session);
                    }
                    Err(err) => {
                        self.discard(&session);
                        return Err(err);
                    }
                }
            } else {
                tracing::debug!(
                    "{}: session older than {:?}, logging in again",
                    P::ID,
                    session.ttl
                );
                self.discard(&session);
            }
        }

        self.login().await
    }

    /// Sends the request built by `build` with the current session.
    ///
    /// If the answer shows the session expired, the session is dropped and
    /// the request is sent once more with a fresh login. A second expired
    /// answer is reported as `Unreachable`.
    pub async fn fetch<F>(&self, timeout: Duration, build: F) -> Result<RawResponse, ProviderError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        match self.send(timeout, &build).await {
            Err(ProviderError::SessionExpired { .. }) => {
                if self.throttle.should_log(&format!("{}_session_expired", P::ID)) {
                    tracing::warn!(
                        "{}: session expired mid-request, retrying with a fresh login",
                        P::ID
                    );
                }
            }
            other => return other,
        }

        match self.send(timeout, &build).await {
            Err(ProviderError::SessionExpired { .. }) => Err(ProviderError::Unreachable {
                provider: P::ID,
                detail: "session expired again right after a fresh login".to_string(),
            }),
            other => other,
        }
    }

    /// One request with the current session. An expired answer drops the
    /// session and comes back as `SessionExpired`.
    async fn send<F>(&self, timeout: Duration, build: &F) -> Result<RawResponse, ProviderError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let session = self.get_session().await?;

        let response = match build(session.client()).timeout(timeout).send().await {
            Ok(response) => RawResponse::capture(P::ID, response).await?,
            Err(err) => {
                let error = ProviderError::from_reqwest(P::ID, err);
                if error.is_unreachable() {
                    self.discard(&session);
                }
                return Err(error);
            }
        };

        if self.looks_expired(&response) {
            self.discard(&session);
            return Err(ProviderError::SessionExpired { provider: P::ID });
        }

        Ok(response)
    }

    /// Forgets `session` if it is still the current one.
    pub fn discard(&self, session: &WebSession) {
        let mut current = self.write();
        if current.as_ref().map(|s| s.id == session.id).unwrap_or(false) {
            *current = None;
        }
    }

    fn looks_expired(&self, response: &RawResponse) -> bool {
        response.is_auth_rejection()
            || self.detector.is_login_page(response)
            || (self.settings.expects_json && response.is_success() && response.is_html())
    }

    async fn probe(&self, session: &WebSession) -> Result<bool, ProviderError> {
        let result = session
            .client()
            .get(&self.settings.probe_url)
            .timeout(self.settings.probe_timeout)
            .send()
            .await;

        match result {
            Ok(response) => {
                let response = RawResponse::capture(P::ID, response).await?;
                Ok(!response.is_auth_rejection() && !self.detector.is_login_page(&response))
            }
            Err(err) => {
                let error = ProviderError::from_reqwest(P::ID, err);
                if error.is_unreachable() {
                    Err(error)
                } else {
                    tracing::debug!("{}: session probe inconclusive: {}", P::ID, error);
                    Ok(false)
                }
            }
        }
    }

    async fn login(&self) -> Result<WebSession, ProviderError> {
        tracing::info!("{}: logging in as {}", P::ID, self.credential.username());

        let jar = Arc::new(Jar::default());
        let client = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::Transport {
                provider: P::ID,
                detail: format!("failed to build HTTP client: {}", e),
            })?;

        let page = client
            .get(&self.settings.login_url)
            .timeout(self.settings.login_timeout)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(P::ID, e))?;
        let page = RawResponse::capture(P::ID, page).await?;
        if !page.is_success() {
            return Err(ProviderError::from_status(P::ID, page.status));
        }

        let csrf = self
            .settings
            .csrf_field
            .as_deref()
            .and_then(|field| extract_hidden_input(&page.body, field).map(|value| (field, value)));

        let mut form: Vec<(&str, &str)> = vec![
            (self.settings.username_field.as_str(), self.credential.username()),
            (self.settings.password_field.as_str(), self.credential.password()),
        ];
        if let Some((field, value)) = &csrf {
            form.push((*field, value.as_str()));
        }

        let response = client
            .post(&self.settings.login_url)
            .timeout(self.settings.login_timeout)
            .header(REFERER, &self.settings.login_url)
            .header(ORIGIN, &self.settings.origin)
            .form(&form)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(P::ID, e))?;
        let response = RawResponse::capture(P::ID, response).await?;

        // The POST answer itself sits on the login URL when there is no
        // redirect; only a redisplayed form counts as a rejection.
        let redisplayed = response.is_html() && self.detector.is_login_page(&response);
        if response.is_auth_rejection() || redisplayed {
            if self.throttle.should_log(&format!("{}_login_rejected", P::ID)) {
                tracing::warn!("{}: login form redisplayed, credentials rejected", P::ID);
            }
            return Err(ProviderError::Auth {
                provider: P::ID,
                detail: "login form redisplayed".to_string(),
            });
        }
        if !response.is_success() {
            return Err(ProviderError::from_status(P::ID, response.status));
        }

        let session = WebSession {
            id: Uuid::new_v4(),
            provider_id: P::ID,
            client,
            jar,
            created_at: self.clock.now(),
            ttl: self.settings.ttl,
        };

        let has_cookie = [&self.settings.login_url, &self.settings.probe_url]
            .into_iter()
            .filter_map(|raw| url::Url::parse(raw).ok())
            .any(|url| session.has_cookie_for(&url));
        if !has_cookie {
            return Err(ProviderError::Auth {
                provider: P::ID,
                detail: "login did not set a session cookie".to_string(),
            });
        }

        *self.write() = Some(session.clone());
        tracing::info!("✓ {}: logged in", P::ID);
        Ok(session)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<WebSession>> {
        self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<WebSession>> {
        self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn html(url: &str, body: &str) -> RawResponse {
        RawResponse {
            status: 200,
            final_url: url.to_string(),
            content_type: "text/html; charset=UTF-8".to_string(),
            body: body.to_string(),
        }
    }

    #[test]
    fn test_extract_csrf_either_attribute_order() {
        let page = r#"<form><input type="hidden" name="_csrf" value="abc123="></form>"#;
        assert_eq!(extract_hidden_input(page, "_csrf"), Some("abc123=".to_string()));

        let reversed = r#"<input value='xyz' type='hidden' name='_csrf'/>"#;
        assert_eq!(extract_hidden_input(reversed, "_csrf"), Some("xyz".to_string()));

        assert_eq!(extract_hidden_input("<form></form>", "_csrf"), None);
    }

    #[test]
    fn test_detector_matches_url_or_form_markers() {
        let detector = FormMarkerDetector::for_login_path("login.php");

        assert!(detector.is_login_page(&html("http://portal/login.php?next=1", "")));
        assert!(detector.is_login_page(&html(
            "http://portal/cari_nama.php",
            r#"<form><input type="password" name="pass"></form>"#
        )));
        assert!(!detector.is_login_page(&html(
            "http://portal/cari_nama.php",
            "<table><tr><td>BUDI</td></tr></table>"
        )));
    }

    #[test]
    fn test_redirect_to_login_path_without_html_is_login_page() {
        let detector = FormMarkerDetector::for_login_path("/login.php");
        let response = RawResponse {
            status: 200,
            final_url: "http://portal/login.php?expired=1".to_string(),
            content_type: String::new(),
            body: String::new(),
        };
        assert!(detector.is_login_page(&response));
    }

    #[test]
    fn test_json_body_is_never_a_login_page_by_markers() {
        let detector = FormMarkerDetector::for_login_path("/auth/login");
        let response = RawResponse {
            status: 200,
            final_url: "http://toolkit/toolkit/api/identity/search".to_string(),
            content_type: "application/json".to_string(),
            body: r#"{"note":"type=\"password\""}"#.to_string(),
        };
        assert!(!detector.is_login_page(&response));
    }

    #[test]
    fn test_closure_detector() {
        let detector = |response: &RawResponse| response.body.contains("Sign in");
        assert!(detector.is_login_page(&html("http://x/", "Please Sign in")));
    }
}
