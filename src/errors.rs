use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use crate::models::ProviderId;

/// Coarse classification of a provider failure, reported in search results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Unreachable,
    Auth,
    SessionExpired,
    Parse,
    UnexpectedStatus,
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Auth => "auth",
            ErrorKind::SessionExpired => "session_expired",
            ErrorKind::Parse => "parse",
            ErrorKind::UnexpectedStatus => "unexpected_status",
            ErrorKind::Transport => "transport",
        };
        f.write_str(label)
    }
}

/// Failure of a single provider call (login, probe or search).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Connection refused, DNS failure or timeout. Trips the circuit breaker
    /// for Provider A and kills the web session for B/C.
    Unreachable { provider: ProviderId, detail: String },
    /// Credentials or token rejected. Not transient.
    Auth { provider: ProviderId, detail: String },
    /// The provider answered with its login page instead of results. Retried
    /// once with a fresh login before it reaches a caller.
    SessionExpired { provider: ProviderId },
    /// The response could not be decoded into person records.
    Parse { provider: ProviderId, detail: String },
    /// Non-2xx answer that is not an auth rejection.
    UnexpectedStatus { provider: ProviderId, status: u16 },
    /// Any other client-side transport failure (bad URL, redirect loop, body read).
    Transport { provider: ProviderId, detail: String },
}

impl ProviderError {
    /// Classifies a `reqwest` failure. Connect and timeout errors are the
    /// only ones that count as "provider is down".
    pub fn from_reqwest(provider: ProviderId, err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            ProviderError::Unreachable {
                provider,
                detail: err.to_string(),
            }
        } else if let Some(status) = err.status() {
            ProviderError::from_status(provider, status.as_u16())
        } else {
            ProviderError::Transport {
                provider,
                detail: err.to_string(),
            }
        }
    }

    /// Maps a non-2xx status: 401/403 are auth rejections, the rest are
    /// unexpected answers.
    pub fn from_status(provider: ProviderId, status: u16) -> Self {
        match status {
            401 | 403 => ProviderError::Auth {
                provider,
                detail: format!("rejected with HTTP {}", status),
            },
            _ => ProviderError::UnexpectedStatus { provider, status },
        }
    }

    pub fn parse(provider: ProviderId, detail: impl Into<String>) -> Self {
        ProviderError::Parse {
            provider,
            detail: detail.into(),
        }
    }

    pub fn provider(&self) -> ProviderId {
        match self {
            ProviderError::Unreachable { provider, .. }
            | ProviderError::Auth { provider, .. }
            | ProviderError::SessionExpired { provider }
            | ProviderError::Parse { provider, .. }
            | ProviderError::UnexpectedStatus { provider, .. }
            | ProviderError::Transport { provider, .. } => *provider,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Unreachable { .. } => ErrorKind::Unreachable,
            ProviderError::Auth { .. } => ErrorKind::Auth,
            ProviderError::SessionExpired { .. } => ErrorKind::SessionExpired,
            ProviderError::Parse { .. } => ErrorKind::Parse,
            ProviderError::UnexpectedStatus { .. } => ErrorKind::UnexpectedStatus,
            ProviderError::Transport { .. } => ErrorKind::Transport,
        }
    }

    pub fn is_unreachable(&self) -> bool {
        matches!(self, ProviderError::Unreachable { .. })
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth { .. })
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unreachable { provider, detail } => {
                write!(f, "{} unreachable: {}", provider, detail)
            }
            ProviderError::Auth { provider, detail } => {
                write!(f, "{} authentication failed: {}", provider, detail)
            }
            ProviderError::SessionExpired { provider } => {
                write!(f, "{} session expired", provider)
            }
            ProviderError::Parse { provider, detail } => {
                write!(f, "{} response could not be parsed: {}", provider, detail)
            }
            ProviderError::UnexpectedStatus { provider, status } => {
                write!(f, "{} returned HTTP {}", provider, status)
            }
            ProviderError::Transport { provider, detail } => {
                write!(f, "{} request failed: {}", provider, detail)
            }
        }
    }
}

impl std::error::Error for ProviderError {}

/// Errors a search caller can see. Everything else is absorbed into the
/// result flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// Provider A rejected credentials the caller supplied explicitly.
    Auth(ProviderError),
    /// The search parameters cannot be sent to any provider.
    InvalidParams(String),
}

impl fmt::Display for SearchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchError::Auth(err) => write!(f, "Authentication failed: {}", err),
            SearchError::InvalidParams(msg) => write!(f, "Invalid search parameters: {}", msg),
        }
    }
}

impl std::error::Error for SearchError {}

/// Application-specific error types for the HTTP layer.
#[derive(Debug, Clone)]
pub enum AppError {
    /// Bad request error (invalid input).
    BadRequest(String),
    /// Unauthorized access error.
    Unauthorized(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Unauthorized(msg) => write!(f, "Unauthorized: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl IntoResponse for AppError {
    /// Maps each error variant to an HTTP status code and JSON body.
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized access: {}", msg);
                (StatusCode::UNAUTHORIZED, msg.clone())
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return (**source).clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<SearchError> for AppError {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::Auth(inner) => AppError::Unauthorized(inner.to_string()),
            SearchError::InvalidParams(msg) => AppError::BadRequest(msg),
        }
    }
}

/// Extension trait for adding context to errors.
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;
}

impl<T> ResultExt<T> for Result<T, SearchError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::from(e)),
            context: context.into(),
        })
    }
}
