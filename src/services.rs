use reqwest::header::{ACCEPT, AUTHORIZATION, ORIGIN, REFERER};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::AvailabilityTracker;
use crate::credentials::{Portal, Toolkit};
use crate::errors::ProviderError;
use crate::models::{PersonRecord, ProviderId, SearchParams};
use crate::parsers::{ClearanceParser, PortalParser, ProviderParser, ToolkitParser};
use crate::session_manager::{RawResponse, SessionManager};
use crate::token_manager::Token;

pub const CLEARANCE_LOGIN_PATH: &str = "/auth/login";
pub const CLEARANCE_SEARCH_PATH: &str = "/clearance/ktp/search";
pub const TOOLKIT_LOGIN_PATH: &str = "/auth/login";
pub const TOOLKIT_PROBE_PATH: &str = "/toolkit";
pub const TOOLKIT_SEARCH_PATH: &str = "/toolkit/api/identity/search";
pub const PORTAL_LOGIN_PATH: &str = "/login.php";
pub const PORTAL_PROBE_PATH: &str = "/index.php";
pub const PORTAL_SEARCH_PATH: &str = "/cari_nama.php";

const DEFAULT_TOOLKIT_LIMIT: u32 = 25;

type Query = Vec<(&'static str, String)>;

fn push_text(query: &mut Query, key: &'static str, field: &Option<String>) {
    if let Some(value) = SearchParams::text(field) {
        query.push((key, value.to_string()));
    }
}

/// Provider A takes every criterion.
pub fn clearance_query(params: &SearchParams) -> Query {
    let mut query = Vec::new();
    push_text(&mut query, "name", &params.name);
    push_text(&mut query, "nik", &params.nik);
    push_text(&mut query, "family_cert_number", &params.family_cert_number);
    push_text(&mut query, "tempat_lahir", &params.birth_place);
    push_text(&mut query, "tanggal_lahir", &params.birth_date);
    push_text(&mut query, "no_prop", &params.province_code);
    push_text(&mut query, "no_kab", &params.regency_code);
    push_text(&mut query, "no_kec", &params.district_code);
    push_text(&mut query, "no_desa", &params.village_code);
    if let Some(page) = params.page {
        query.push(("page", page.to_string()));
    }
    query
}

/// Provider B searches by one field, in priority order name, family
/// certificate, NIK. `None` when none of them is set.
pub fn toolkit_query(params: &SearchParams) -> Option<Query> {
    if let Some(name) = SearchParams::text(&params.name) {
        let limit = params.limit.unwrap_or(DEFAULT_TOOLKIT_LIMIT);
        return Some(vec![("full_name", name.to_string()), ("limit", limit.to_string())]);
    }
    if let Some(kk) = SearchParams::text(&params.family_cert_number) {
        return Some(vec![("family_cert_number", kk.to_string())]);
    }
    SearchParams::text(&params.nik).map(|nik| vec![("ktp_number", nik.to_string())])
}

/// Provider C only searches by name.
pub fn portal_query(params: &SearchParams) -> Option<Query> {
    SearchParams::text(&params.name).map(|name| vec![("nama_lengkap", name.to_string())])
}

// ============ Provider A ============

pub struct ClearanceService {
    client: Client,
    base_url: String,
    availability: Arc<AvailabilityTracker>,
    parser: ClearanceParser,
}

impl ClearanceService {
    pub fn new(base_url: impl Into<String>, availability: Arc<AvailabilityTracker>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            availability,
            parser: ClearanceParser,
        }
    }

    /// Bearer-token search.
    ///
    /// Connection and timeout failures are recorded on the availability
    /// tracker before returning; a parsed answer marks the provider alive.
    pub async fn search(
        &self,
        token: &Token,
        params: &SearchParams,
        timeout: Duration,
    ) -> Result<Vec<PersonRecord>, ProviderError> {
        let provider = ProviderId::Clearance;
        let url = format!("{}{}", self.base_url, CLEARANCE_SEARCH_PATH);
        let query = clearance_query(params);

        tracing::info!("{}: searching with {} criteria", provider, query.len());

        let response = self
            .client
            .get(&url)
            .query(&query)
            .timeout(timeout)
            .header(AUTHORIZATION, format!("Bearer {}", token.raw_value))
            .header(ACCEPT, "application/json")
            .header(ORIGIN, &self.base_url)
            .header(REFERER, format!("{}/", self.base_url))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                let error = ProviderError::from_reqwest(provider, err);
                if error.is_unreachable() {
                    self.availability.record_failure();
                }
                return Err(error);
            }
        };

        let raw = match RawResponse::capture(provider, response).await {
            Ok(raw) => raw,
            Err(error) => {
                if error.is_unreachable() {
                    self.availability.record_failure();
                }
                return Err(error);
            }
        };

        if !raw.is_success() {
            tracing::warn!("{}: search returned HTTP {}", provider, raw.status);
            return Err(ProviderError::from_status(provider, raw.status));
        }

        // Some deployments answer an expired token with 200 + status "error".
        if let Ok(body) = serde_json::from_str::<Value>(&raw.body) {
            if body.get("status").and_then(Value::as_str) == Some("error") {
                let detail = body
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("token rejected")
                    .to_string();
                return Err(ProviderError::Auth { provider, detail });
            }
        }

        let records = self.parser.parse(&raw)?;
        self.availability.record_success();

        tracing::info!("✓ {}: {} record(s)", provider, records.len());
        Ok(records)
    }
}

// ============ Provider B ============

pub struct ToolkitService {
    sessions: Arc<SessionManager<Toolkit>>,
    search_url: String,
    parser: ToolkitParser,
}

impl ToolkitService {
    pub fn new(base_url: &str, sessions: Arc<SessionManager<Toolkit>>) -> Self {
        Self {
            sessions,
            search_url: format!("{}{}", base_url, TOOLKIT_SEARCH_PATH),
            parser: ToolkitParser,
        }
    }

    pub fn sessions(&self) -> &SessionManager<Toolkit> {
        &self.sessions
    }

    /// `Ok(None)` when the parameters carry nothing this provider can search by.
    pub async fn search(
        &self,
        params: &SearchParams,
        timeout: Duration,
    ) -> Result<Option<Vec<PersonRecord>>, ProviderError> {
        let Some(query) = toolkit_query(params) else {
            return Ok(None);
        };

        tracing::info!("{}: searching by {}", ProviderId::Toolkit, query[0].0);

        let response = self
            .sessions
            .fetch(timeout, |client| {
                client
                    .get(&self.search_url)
                    .query(&query)
                    .header(ACCEPT, "application/json")
            })
            .await?;

        if !response.is_success() {
            return Err(ProviderError::from_status(ProviderId::Toolkit, response.status));
        }

        let records = self.parser.parse(&response)?;
        tracing::info!("✓ {}: {} record(s)", ProviderId::Toolkit, records.len());
        Ok(Some(records))
    }
}

// ============ Provider C ============

pub struct PortalService {
    sessions: Arc<SessionManager<Portal>>,
    search_url: String,
    parser: PortalParser,
}

impl PortalService {
    pub fn new(base_url: &str, sessions: Arc<SessionManager<Portal>>) -> Self {
        Self {
            sessions,
            search_url: format!("{}{}", base_url, PORTAL_SEARCH_PATH),
            parser: PortalParser,
        }
    }

    pub fn sessions(&self) -> &SessionManager<Portal> {
        &self.sessions
    }

    /// `Ok(None)` when no name was given.
    pub async fn search(
        &self,
        params: &SearchParams,
        timeout: Duration,
    ) -> Result<Option<Vec<PersonRecord>>, ProviderError> {
        let Some(query) = portal_query(params) else {
            return Ok(None);
        };

        tracing::info!("{}: searching by name", ProviderId::Portal);

        let response = self
            .sessions
            .fetch(timeout, |client| {
                client
                    .get(&self.search_url)
                    .query(&query)
                    .header(ACCEPT, "application/json, text/html, */*")
            })
            .await?;

        if !response.is_success() {
            return Err(ProviderError::from_status(ProviderId::Portal, response.status));
        }

        let records = self.parser.parse(&response)?;
        tracing::info!("✓ {}: {} record(s)", ProviderId::Portal, records.len());
        Ok(Some(records))
    }
}
