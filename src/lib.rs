//! Identity Search Library
//!
//! Resilient search across three upstream identity backends: a primary
//! bearer-token API (Clearance) and two cookie-session web services
//! (Toolkit, Portal). The primary is guarded by a circuit breaker; when it
//! cannot answer, both secondaries are queried and their records merged by
//! NIK.
//!
//! # Modules
//!
//! - `api`: HTTP-facing components.
//! - `core`: Search orchestration, models and errors.
//! - `integrations`: Provider clients, sessions, tokens and parsers.
//! - `cache_validator`: Checksummed records for the on-disk token cache.
//! - `circuit_breaker`: Provider A availability tracking.
//! - `clock`: Injectable time source.
//! - `config`: Configuration management.
//! - `credentials`: Per-provider credential types.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers.
//! - `models`: Search parameters, person records and results.
//! - `orchestrator`: The multi-provider search.
//! - `parsers`: Provider response parsers.
//! - `services`: Provider search clients.
//! - `session_manager`: Cookie-session login and reuse.
//! - `token_manager`: Bearer-token login and caching.
//! - `validation`: Search parameter validation.
//! - `warning_throttle`: Log storm suppression.

pub mod api;
pub mod core;
pub mod integrations;

pub mod cache_validator;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod parsers;
pub mod services;
pub mod session_manager;
pub mod token_manager;
pub mod validation;
pub mod warning_throttle;
