//! Multi-provider search.
//!
//! Provider A (Clearance) is tried first when its circuit breaker allows it.
//! If A answers, its records are returned as they are. Otherwise Toolkit and
//! Portal are both queried concurrently and their records merged by NIK,
//! Toolkit first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::circuit_breaker::{AvailabilityTracker, ProviderAvailability};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{Config, ResilienceSettings};
use crate::credentials::{Clearance, Credential, CredentialStore, Portal, ProviderKind, Toolkit};
use crate::errors::{ProviderError, SearchError};
use crate::models::{
    merge_records, PersonRecord, ProviderId, ProviderOutcome, ProviderReport, SearchFlags,
    SearchParams, SearchResult, SkipReason,
};
use crate::services::{
    ClearanceService, PortalService, ToolkitService, CLEARANCE_LOGIN_PATH, PORTAL_LOGIN_PATH,
    PORTAL_PROBE_PATH, TOOLKIT_LOGIN_PATH, TOOLKIT_PROBE_PATH,
};
use crate::session_manager::{FormMarkerDetector, SessionManager, SessionSettings};
use crate::token_manager::{TokenManager, TokenSettings, TokenStore};
use crate::validation::validate_params;
use crate::warning_throttle::WarningThrottle;

// ============ Cancellation ============

/// Cancels the searches holding the matching [`CancelSignal`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: Option<watch::Receiver<bool>>,
}

pub fn cancellation() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx: Some(rx) })
}

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().map(|rx| *rx.borrow()).unwrap_or(false)
    }

    /// Resolves once cancelled; pends forever otherwise (including when the
    /// handle is dropped without cancelling).
    pub async fn cancelled(&self) {
        if let Some(rx) = &self.rx {
            let mut rx = rx.clone();
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }
}

// ============ Options and status ============

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Caller's own Provider A account. Never forwarded to Toolkit or Portal.
    pub credential: Option<Credential<Clearance>>,
    /// Skip the cached token and log in to Provider A again.
    pub force_login: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub provider_id: ProviderId,
    pub active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub age_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProvidersStatus {
    pub clearance: ProviderAvailability,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub toolkit: SessionStatus,
    pub portal: SessionStatus,
}

/// What one fallback provider contributed.
enum Contribution {
    Records(Vec<PersonRecord>),
    NoQuery,
    Failed(ProviderError),
    Cancelled,
}

enum Primary {
    Records(Vec<PersonRecord>),
    MarkedUnavailable,
    Failed(ProviderError),
    Cancelled,
}

// ============ Orchestrator ============

pub struct SearchOrchestrator {
    credentials: CredentialStore,
    availability: Arc<AvailabilityTracker>,
    tokens: Arc<TokenManager>,
    clearance: ClearanceService,
    toolkit: ToolkitService,
    portal: PortalService,
    settings: ResilienceSettings,
    clock: SharedClock,
    throttle: WarningThrottle,
}

fn session_settings(
    base_url: &str,
    login_path: &str,
    probe_path: &str,
    settings: &ResilienceSettings,
) -> SessionSettings {
    SessionSettings {
        login_url: format!("{}{}", base_url, login_path),
        probe_url: format!("{}{}", base_url, probe_path),
        origin: base_url.to_string(),
        username_field: "username".to_string(),
        password_field: "password".to_string(),
        csrf_field: None,
        expects_json: false,
        ttl: settings.session_ttl,
        trust_window: settings.session_trust_window,
        login_timeout: settings.login_timeout,
        probe_timeout: settings.probe_timeout,
    }
}

impl SearchOrchestrator {
    pub fn from_config(config: &Config) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Wires every component from `config`, reading time from `clock`.
    pub fn with_clock(config: &Config, clock: SharedClock) -> Self {
        let settings = config.resilience.clone();
        let throttle = WarningThrottle::new(settings.warning_cooldown);
        let credentials = CredentialStore::from_config(config);

        let clearance_login = format!("{}{}", config.clearance_base_url, CLEARANCE_LOGIN_PATH);
        let availability = Arc::new(AvailabilityTracker::new(
            ProviderId::Clearance,
            clearance_login.clone(),
            settings.check_interval,
            settings.max_failures,
            settings.probe_timeout,
            clock.clone(),
            throttle.clone(),
        ));

        let tokens = Arc::new(TokenManager::new(
            TokenSettings {
                login_url: clearance_login,
                login_timeout: settings.login_timeout,
                leeway: settings.token_leeway,
                default_lifetime: settings.default_token_lifetime,
            },
            TokenStore::new(config.token_cache_path.clone()),
            availability.clone(),
            clock.clone(),
            throttle.clone(),
        ));

        let toolkit_sessions = Arc::new(SessionManager::<Toolkit>::new(
            credentials.toolkit().clone(),
            SessionSettings {
                csrf_field: Some("_csrf".to_string()),
                expects_json: true,
                ..session_settings(
                    &config.toolkit_base_url,
                    TOOLKIT_LOGIN_PATH,
                    TOOLKIT_PROBE_PATH,
                    &settings,
                )
            },
            Arc::new(FormMarkerDetector::for_login_path(TOOLKIT_LOGIN_PATH)),
            clock.clone(),
            throttle.clone(),
        ));

        let portal_sessions = Arc::new(SessionManager::<Portal>::new(
            credentials.portal().clone(),
            session_settings(
                &config.portal_base_url,
                PORTAL_LOGIN_PATH,
                PORTAL_PROBE_PATH,
                &settings,
            ),
            Arc::new(FormMarkerDetector::for_login_path(PORTAL_LOGIN_PATH)),
            clock.clone(),
            throttle.clone(),
        ));

        Self {
            clearance: ClearanceService::new(
                config.clearance_base_url.clone(),
                availability.clone(),
            ),
            toolkit: ToolkitService::new(&config.toolkit_base_url, toolkit_sessions),
            portal: PortalService::new(&config.portal_base_url, portal_sessions),
            credentials,
            availability,
            tokens,
            settings,
            clock,
            throttle,
        }
    }

    /// Searches with the configured Provider A account.
    pub async fn search(&self, params: &SearchParams) -> Result<SearchResult, SearchError> {
        self.run(params, &SearchOptions::default(), &CancelSignal::never())
            .await
    }

    /// Searches with the caller's own Provider A account. A rejection of that
    /// account is returned as [`SearchError::Auth`].
    pub async fn search_as(
        &self,
        params: &SearchParams,
        credential: Credential<Clearance>,
    ) -> Result<SearchResult, SearchError> {
        let options = SearchOptions {
            credential: Some(credential),
            force_login: false,
        };
        self.run(params, &options, &CancelSignal::never()).await
    }

    /// Full search entry point.
    ///
    /// Provider failures end up in the result's flags and provider reports.
    /// Errors are returned only for invalid parameters and for a rejection of
    /// caller-supplied Provider A credentials.
    pub async fn run(
        &self,
        params: &SearchParams,
        options: &SearchOptions,
        cancel: &CancelSignal,
    ) -> Result<SearchResult, SearchError> {
        let params = validate_params(params)?;
        let explicit = options.credential.is_some();
        let credential = options
            .credential
            .as_ref()
            .unwrap_or_else(|| self.credentials.clearance());

        let mut flags = SearchFlags::default();
        let mut reports = Vec::with_capacity(ProviderId::ALL.len());

        let primary = if cancel.is_cancelled() {
            Primary::Cancelled
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Primary::Cancelled,
                primary = self.try_primary(&params, credential, options.force_login) => primary,
            }
        };

        match primary {
            Primary::Records(records) => {
                reports.push(report(ProviderId::Clearance, answered(records.len())));
                reports.push(report(ProviderId::Toolkit, skipped(SkipReason::NotNeeded)));
                reports.push(report(ProviderId::Portal, skipped(SkipReason::NotNeeded)));
                return Ok(SearchResult::assemble(records, reports, flags));
            }
            Primary::MarkedUnavailable => {
                flags.provider_a_unavailable = true;
                if self.throttle.should_log("clearance_skipped_unavailable") {
                    tracing::info!(
                        "{} marked unavailable, using fallback providers",
                        ProviderId::Clearance
                    );
                }
                reports.push(report(ProviderId::Clearance, skipped(SkipReason::MarkedUnavailable)));
            }
            Primary::Failed(err) => {
                flags.provider_a_unavailable = true;
                if err.is_auth() {
                    flags.provider_a_auth_failed = true;
                    if explicit {
                        return Err(SearchError::Auth(err));
                    }
                }
                self.log_provider_failure(&err);
                reports.push(report(ProviderId::Clearance, failed(&err)));
            }
            Primary::Cancelled => {
                flags.incomplete = true;
                for provider in ProviderId::ALL {
                    reports.push(report(provider, ProviderOutcome::Cancelled));
                }
                return Ok(SearchResult::assemble(Vec::new(), reports, flags));
            }
        }

        flags.used_fallback = true;
        let timeout = self.settings.degraded_search_timeout;

        let (toolkit, portal) = tokio::join!(
            self.fallback(ProviderId::Toolkit, cancel, self.toolkit.search(&params, timeout)),
            self.fallback(ProviderId::Portal, cancel, self.portal.search(&params, timeout)),
        );

        let (toolkit_records, toolkit_outcome) = self.settle(toolkit, &mut flags);
        let (portal_records, portal_outcome) = self.settle(portal, &mut flags);
        reports.push(report(ProviderId::Toolkit, toolkit_outcome));
        reports.push(report(ProviderId::Portal, portal_outcome));

        let merged = merge_records(toolkit_records, portal_records);
        tracing::info!("Fallback search merged {} record(s)", merged.len());

        Ok(SearchResult::assemble(merged, reports, flags))
    }

    async fn try_primary(
        &self,
        params: &SearchParams,
        credential: &Credential<Clearance>,
        force_login: bool,
    ) -> Primary {
        if !self.availability.is_available().await {
            return Primary::MarkedUnavailable;
        }

        let token = match self.tokens.get_token(credential, force_login).await {
            Ok(token) => token,
            Err(err) => return Primary::Failed(err),
        };

        let timeout = self.settings.search_timeout;
        match self.clearance.search(&token, params, timeout).await {
            Ok(records) => Primary::Records(records),
            Err(err) if err.is_auth() && !force_login => {
                // Cached token rejected: one fresh login, one more search.
                tracing::info!("{}: token rejected, logging in again", ProviderId::Clearance);
                self.tokens.invalidate(&token).await;
                let token = match self.tokens.get_token(credential, true).await {
                    Ok(token) => token,
                    Err(err) => return Primary::Failed(err),
                };
                match self.clearance.search(&token, params, timeout).await {
                    Ok(records) => Primary::Records(records),
                    Err(err) => Primary::Failed(err),
                }
            }
            Err(err) => Primary::Failed(err),
        }
    }

    /// Runs one fallback provider under the cancel signal and the per-provider
    /// deadline.
    async fn fallback<F>(
        &self,
        provider: ProviderId,
        cancel: &CancelSignal,
        search: F,
    ) -> Contribution
    where
        F: Future<Output = Result<Option<Vec<PersonRecord>>, ProviderError>>,
    {
        if cancel.is_cancelled() {
            return Contribution::Cancelled;
        }

        let deadline = self.settings.fallback_deadline;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Contribution::Cancelled,
            result = tokio::time::timeout(deadline, search) => match result {
                Ok(Ok(Some(records))) => Contribution::Records(records),
                Ok(Ok(None)) => Contribution::NoQuery,
                Ok(Err(err)) => Contribution::Failed(err),
                Err(_) => Contribution::Failed(ProviderError::Unreachable {
                    provider,
                    detail: format!("no answer within {:?}", deadline),
                }),
            },
        }
    }

    fn settle(
        &self,
        contribution: Contribution,
        flags: &mut SearchFlags,
    ) -> (Vec<PersonRecord>, ProviderOutcome) {
        match contribution {
            Contribution::Records(records) => {
                let outcome = answered(records.len());
                (records, outcome)
            }
            Contribution::NoQuery => (Vec::new(), skipped(SkipReason::NoApplicableQuery)),
            Contribution::Failed(err) => {
                self.log_provider_failure(&err);
                (Vec::new(), failed(&err))
            }
            Contribution::Cancelled => {
                flags.incomplete = true;
                (Vec::new(), ProviderOutcome::Cancelled)
            }
        }
    }

    fn log_provider_failure(&self, err: &ProviderError) {
        if self
            .throttle
            .should_log(&format!("{}_{}", err.provider(), err.kind()))
        {
            tracing::warn!("{}", err);
        }
    }

    pub fn availability(&self) -> ProviderAvailability {
        self.availability.snapshot()
    }

    pub fn status(&self) -> ProvidersStatus {
        let now = self.clock.now();
        ProvidersStatus {
            clearance: self.availability.snapshot(),
            token_expires_at: self.tokens.current().map(|token| token.expires_at),
            toolkit: session_status(self.toolkit.sessions(), now),
            portal: session_status(self.portal.sessions(), now),
        }
    }
}

fn session_status<P: ProviderKind>(
    sessions: &SessionManager<P>,
    now: DateTime<Utc>,
) -> SessionStatus {
    let current = sessions.current();
    SessionStatus {
        provider_id: sessions.provider(),
        active: current.is_some(),
        created_at: current.as_ref().map(|session| session.created_at),
        age_secs: current.as_ref().map(|session| session.age(now).as_secs()),
    }
}

fn report(provider: ProviderId, outcome: ProviderOutcome) -> ProviderReport {
    ProviderReport { provider, outcome }
}

fn answered(records: usize) -> ProviderOutcome {
    if records == 0 {
        ProviderOutcome::Empty
    } else {
        ProviderOutcome::Succeeded { records }
    }
}

fn skipped(reason: SkipReason) -> ProviderOutcome {
    ProviderOutcome::Skipped { reason }
}

fn failed(err: &ProviderError) -> ProviderOutcome {
    ProviderOutcome::Failed {
        kind: err.kind(),
        detail: err.to_string(),
    }
}
