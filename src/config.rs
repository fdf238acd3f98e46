use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Timeouts, intervals and thresholds for the resilience layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceSettings {
    /// Provider A re-probe interval while marked unavailable.
    pub check_interval: Duration,
    /// Consecutive failures before Provider A is marked unavailable.
    pub max_failures: u32,
    pub probe_timeout: Duration,
    pub login_timeout: Duration,
    /// Provider A search timeout.
    pub search_timeout: Duration,
    /// Per-request timeout for B/C once we are already falling back.
    pub degraded_search_timeout: Duration,
    /// Upper bound on everything one fallback provider does in a single
    /// search (probe, login, search, one retry).
    pub fallback_deadline: Duration,
    pub token_leeway: Duration,
    /// Lifetime assumed for tokens that carry no `exp` claim.
    pub default_token_lifetime: Duration,
    pub session_ttl: Duration,
    /// Sessions younger than this are reused without a probe.
    pub session_trust_window: Duration,
    pub warning_cooldown: Duration,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            max_failures: 1,
            probe_timeout: Duration::from_millis(1000),
            login_timeout: Duration::from_secs(5),
            search_timeout: Duration::from_secs(15),
            degraded_search_timeout: Duration::from_secs(10),
            fallback_deadline: Duration::from_secs(25),
            token_leeway: Duration::from_secs(10),
            default_token_lifetime: Duration::from_secs(3600),
            session_ttl: Duration::from_secs(1800),
            session_trust_window: Duration::from_secs(600),
            warning_cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub clearance_base_url: String,
    pub clearance_username: String,
    pub clearance_password: String,
    pub token_cache_path: PathBuf,
    pub toolkit_base_url: String,
    pub toolkit_username: String,
    pub toolkit_password: String,
    pub portal_base_url: String,
    pub portal_username: String,
    pub portal_password: String,
    pub resilience: ResilienceSettings,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("clearance_base_url", &self.clearance_base_url)
            .field("clearance_username", &self.clearance_username)
            .field("token_cache_path", &self.token_cache_path)
            .field("toolkit_base_url", &self.toolkit_base_url)
            .field("toolkit_username", &self.toolkit_username)
            .field("portal_base_url", &self.portal_base_url)
            .field("portal_username", &self.portal_username)
            .field("resilience", &self.resilience)
            .finish_non_exhaustive()
    }
}

fn required(name: &str) -> anyhow::Result<String> {
    std::env::var(name)
        .map_err(|_| anyhow::anyhow!("{} environment variable required", name))
        .and_then(|value| {
            if value.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", name);
            }
            Ok(value)
        })
}

fn required_url(name: &str) -> anyhow::Result<String> {
    required(name).and_then(|url| {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("{} must start with http:// or https://", name);
        }
        Ok(url.trim_end_matches('/').to_string())
    })
}

fn seconds_or(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| anyhow::anyhow!("{} must be a whole number of seconds", name)),
        _ => Ok(default),
    }
}

fn default_token_cache_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
        .join(".cache")
        .join("clearance_token.json")
}

impl ResilienceSettings {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let probe_timeout = match std::env::var("PROBE_TIMEOUT_MS") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<u64>()
                .map_err(|_| anyhow::anyhow!("PROBE_TIMEOUT_MS must be a number of milliseconds"))?,
            _ => defaults.probe_timeout.as_millis() as u64,
        };

        let max_failures = match std::env::var("CLEARANCE_MAX_FAILURES") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse::<u32>()
                .map_err(|_| anyhow::anyhow!("CLEARANCE_MAX_FAILURES must be a positive number"))?,
            _ => defaults.max_failures,
        };

        let settings = Self {
            check_interval: seconds_or("CLEARANCE_CHECK_INTERVAL_SECS", defaults.check_interval)?,
            max_failures: max_failures.max(1),
            // Probes must stay cheap: 0.5s..2s.
            probe_timeout: Duration::from_millis(probe_timeout.clamp(500, 2000)),
            login_timeout: seconds_or("LOGIN_TIMEOUT_SECS", defaults.login_timeout)?,
            search_timeout: seconds_or("SEARCH_TIMEOUT_SECS", defaults.search_timeout)?,
            degraded_search_timeout: seconds_or(
                "DEGRADED_SEARCH_TIMEOUT_SECS",
                defaults.degraded_search_timeout,
            )?,
            fallback_deadline: seconds_or("FALLBACK_DEADLINE_SECS", defaults.fallback_deadline)?,
            token_leeway: seconds_or("TOKEN_LEEWAY_SECS", defaults.token_leeway)?,
            default_token_lifetime: seconds_or(
                "DEFAULT_TOKEN_LIFETIME_SECS",
                defaults.default_token_lifetime,
            )?,
            session_ttl: seconds_or("SESSION_TTL_SECS", defaults.session_ttl)?,
            session_trust_window: seconds_or("SESSION_TRUST_SECS", defaults.session_trust_window)?,
            warning_cooldown: seconds_or("WARNING_COOLDOWN_SECS", defaults.warning_cooldown)?,
        };

        if settings.session_trust_window > settings.session_ttl {
            anyhow::bail!("SESSION_TRUST_SECS cannot exceed SESSION_TTL_SECS");
        }

        Ok(settings)
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            clearance_base_url: required_url("CLEARANCE_BASE")?,
            clearance_username: required("CLEARANCE_USERNAME")?,
            clearance_password: required("CLEARANCE_PASSWORD")?,
            token_cache_path: std::env::var("CLEARANCE_TOKEN_CACHE")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(default_token_cache_path),
            toolkit_base_url: required_url("TOOLKIT_BASE")?,
            toolkit_username: required("TOOLKIT_USERNAME")?,
            toolkit_password: required("TOOLKIT_PASSWORD")?,
            portal_base_url: required_url("PORTAL_BASE")?,
            portal_username: required("PORTAL_USERNAME")?,
            portal_password: required("PORTAL_PASSWORD")?,
            resilience: ResilienceSettings::from_env()?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!("Clearance base URL: {}", config.clearance_base_url);
        tracing::debug!("Toolkit base URL: {}", config.toolkit_base_url);
        tracing::debug!("Portal base URL: {}", config.portal_base_url);
        tracing::debug!("Token cache: {}", config.token_cache_path.display());
        tracing::debug!(
            "Clearance breaker: interval {:?}, max failures {}",
            config.resilience.check_interval,
            config.resilience.max_failures
        );
        tracing::debug!("Server Port: {}", config.port);

        Ok(config)
    }
}
