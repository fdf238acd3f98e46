//! Per-provider credentials.
//!
//! Every provider logs in with its own account. A `Credential<P>` is tagged
//! with its provider at the type level, so a Clearance credential cannot be
//! handed to the Toolkit or Portal session managers.

use std::fmt;
use std::marker::PhantomData;

use crate::config::Config;
use crate::models::ProviderId;

/// Type-level tag for a provider.
pub trait ProviderKind: Send + Sync + 'static {
    const ID: ProviderId;
}

/// Provider A, bearer-token API.
#[derive(Debug)]
pub enum Clearance {}

/// Provider B, cookie-session toolkit.
#[derive(Debug)]
pub enum Toolkit {}

/// Provider C, cookie-session portal.
#[derive(Debug)]
pub enum Portal {}

impl ProviderKind for Clearance {
    const ID: ProviderId = ProviderId::Clearance;
}

impl ProviderKind for Toolkit {
    const ID: ProviderId = ProviderId::Toolkit;
}

impl ProviderKind for Portal {
    const ID: ProviderId = ProviderId::Portal;
}

pub struct Credential<P: ProviderKind> {
    username: String,
    password: String,
    _provider: PhantomData<fn() -> P>,
}

impl<P: ProviderKind> Credential<P> {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            _provider: PhantomData,
        }
    }

    pub fn provider(&self) -> ProviderId {
        P::ID
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub(crate) fn password(&self) -> &str {
        &self.password
    }
}

impl<P: ProviderKind> Clone for Credential<P> {
    fn clone(&self) -> Self {
        Self::new(self.username.clone(), self.password.clone())
    }
}

impl<P: ProviderKind> fmt::Debug for Credential<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("provider", &P::ID)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Static credentials for all providers, loaded once at startup.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    clearance: Credential<Clearance>,
    toolkit: Credential<Toolkit>,
    portal: Credential<Portal>,
}

impl CredentialStore {
    pub fn new(
        clearance: Credential<Clearance>,
        toolkit: Credential<Toolkit>,
        portal: Credential<Portal>,
    ) -> Self {
        Self {
            clearance,
            toolkit,
            portal,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Credential::new(&config.clearance_username, &config.clearance_password),
            Credential::new(&config.toolkit_username, &config.toolkit_password),
            Credential::new(&config.portal_username, &config.portal_password),
        )
    }

    /// Default Provider A account, used when the caller brings none.
    pub fn clearance(&self) -> &Credential<Clearance> {
        &self.clearance
    }

    pub fn toolkit(&self) -> &Credential<Toolkit> {
        &self.toolkit
    }

    pub fn portal(&self) -> &Credential<Portal> {
        &self.portal
    }
}
