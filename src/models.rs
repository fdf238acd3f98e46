use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::errors::ErrorKind;

// ============ Providers ============

/// The three upstream identity-search backends.
///
/// - `Clearance`: primary bearer-token JSON API (provider A).
/// - `Toolkit`: cookie-session web service with a JSON search API (provider B).
/// - `Portal`: cookie-session PHP portal, JSON or HTML results (provider C).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderId {
    Clearance,
    Toolkit,
    Portal,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] =
        [ProviderId::Clearance, ProviderId::Toolkit, ProviderId::Portal];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Clearance => "clearance",
            ProviderId::Toolkit => "toolkit",
            ProviderId::Portal => "portal",
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Search input ============

/// Caller-supplied search criteria. Passed unchanged to every provider
/// adapter; each adapter maps the fields onto its own query vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchParams {
    pub name: Option<String>,
    pub nik: Option<String>,
    pub family_cert_number: Option<String>,
    pub birth_place: Option<String>,
    pub birth_date: Option<String>,
    pub province_code: Option<String>,
    pub regency_code: Option<String>,
    pub district_code: Option<String>,
    pub village_code: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

impl SearchParams {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn by_nik(nik: impl Into<String>) -> Self {
        Self {
            nik: Some(nik.into()),
            ..Self::default()
        }
    }

    /// Trimmed value of an optional text field, `None` when blank.
    pub fn text(field: &Option<String>) -> Option<&str> {
        field.as_deref().map(str::trim).filter(|value| !value.is_empty())
    }

    /// True when at least one filtering criterion is present. Paging fields
    /// alone do not narrow a search.
    pub fn has_criteria(&self) -> bool {
        [
            &self.name,
            &self.nik,
            &self.family_cert_number,
            &self.birth_place,
            &self.birth_date,
            &self.province_code,
            &self.regency_code,
            &self.district_code,
            &self.village_code,
        ]
        .into_iter()
        .any(|field| Self::text(field).is_some())
    }
}

// ============ Search output ============

/// One person as reported by a provider, normalized to a shared shape.
/// Missing fields are empty strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    pub nik: String,
    pub full_name: String,
    pub birth_date: String,
    pub birth_place: String,
    pub address: String,
    pub family_cert_number: String,
    pub source_provider: ProviderId,
}

impl PersonRecord {
    pub fn empty(source_provider: ProviderId) -> Self {
        Self {
            nik: String::new(),
            full_name: String::new(),
            birth_date: String::new(),
            birth_place: String::new(),
            address: String::new(),
            family_cert_number: String::new(),
            source_provider,
        }
    }

    /// Deduplication key; `None` for records without a NIK, which are never
    /// considered duplicates of anything.
    pub fn dedup_key(&self) -> Option<&str> {
        let nik = self.nik.trim();
        (!nik.is_empty()).then_some(nik)
    }
}

/// Merges fallback-provider results.
///
/// Starts from `primary` unchanged, then appends each record of `secondary`
/// whose NIK does not already appear in the merged list. Records without a
/// NIK are always appended.
pub fn merge_records(
    primary: Vec<PersonRecord>,
    secondary: Vec<PersonRecord>,
) -> Vec<PersonRecord> {
    let mut seen: HashSet<String> = primary
        .iter()
        .filter_map(|record| record.dedup_key().map(str::to_string))
        .collect();

    let mut merged = primary;
    merged.reserve(secondary.len());

    for record in secondary {
        match record.dedup_key() {
            Some(key) => {
                if seen.insert(key.to_string()) {
                    merged.push(record);
                }
            }
            None => merged.push(record),
        }
    }

    merged
}

/// Why a provider was not queried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Circuit breaker says the provider is down; no request was made.
    MarkedUnavailable,
    /// None of the search criteria map onto this provider's query vocabulary.
    NoApplicableQuery,
    /// The primary provider answered, fallback providers were not needed.
    NotNeeded,
}

/// What happened to one provider during a search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProviderOutcome {
    Succeeded { records: usize },
    Empty,
    Skipped { reason: SkipReason },
    Failed { kind: ErrorKind, detail: String },
    Cancelled,
}

impl ProviderOutcome {
    /// The provider was reached and answered, with or without records.
    pub fn responded(&self) -> bool {
        matches!(self, ProviderOutcome::Succeeded { .. } | ProviderOutcome::Empty)
    }

    fn describe(&self) -> String {
        match self {
            ProviderOutcome::Succeeded { records } => format!("returned {} record(s)", records),
            ProviderOutcome::Empty => "tried, responded with no records".to_string(),
            ProviderOutcome::Skipped {
                reason: SkipReason::MarkedUnavailable,
            } => "never tried, provider marked unavailable".to_string(),
            ProviderOutcome::Skipped {
                reason: SkipReason::NoApplicableQuery,
            } => "not tried, no criterion it can search by".to_string(),
            ProviderOutcome::Skipped {
                reason: SkipReason::NotNeeded,
            } => "not needed".to_string(),
            ProviderOutcome::Failed { kind, detail } => {
                format!("tried, failed ({}): {}", kind, detail)
            }
            ProviderOutcome::Cancelled => "cancelled before it answered".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderReport {
    pub provider: ProviderId,
    #[serde(flatten)]
    pub outcome: ProviderOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFlags {
    /// Provider A did not contribute (marked dead, unreachable, rejected or failed).
    pub provider_a_unavailable: bool,
    /// Provider A rejected the credentials.
    pub provider_a_auth_failed: bool,
    /// Results come from the secondary providers.
    pub used_fallback: bool,
    /// Nothing came back: no provider answered, or the fallback ran and every
    /// provider failed or answered empty.
    pub all_providers_unavailable: bool,
    /// The search was cancelled; records are whatever had been merged so far.
    pub incomplete: bool,
}

impl SearchFlags {
    /// Whether the caller should be warned that the records may be partial.
    pub fn is_partial(&self) -> bool {
        self.incomplete || self.all_providers_unavailable || self.provider_a_unavailable
    }
}

/// Returned to the caller for every search, including total failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub records: Vec<PersonRecord>,
    pub provider_counts: BTreeMap<ProviderId, usize>,
    pub providers: Vec<ProviderReport>,
    pub flags: SearchFlags,
    /// Human-readable explanation when no records came back.
    pub reason: Option<String>,
}

impl SearchResult {
    /// Assembles a result from the merged records and one report per provider.
    pub fn assemble(
        records: Vec<PersonRecord>,
        providers: Vec<ProviderReport>,
        mut flags: SearchFlags,
    ) -> Self {
        let mut provider_counts = BTreeMap::new();
        for report in &providers {
            match report.outcome {
                ProviderOutcome::Succeeded { records } => {
                    provider_counts.insert(report.provider, records);
                }
                ProviderOutcome::Empty => {
                    provider_counts.insert(report.provider, 0);
                }
                _ => {}
            }
        }

        // An empty answer from A alone ends the search without trying B or C,
        // so it does not count as every backend coming up empty.
        let none_responded = !providers.iter().any(|report| report.outcome.responded());
        flags.all_providers_unavailable =
            records.is_empty() && !flags.incomplete && (none_responded || flags.used_fallback);

        let reason = if records.is_empty() {
            let details = providers
                .iter()
                .map(|report| format!("{}: {}", report.provider, report.outcome.describe()))
                .collect::<Vec<_>>()
                .join("; ");
            let headline = if flags.all_providers_unavailable {
                "All identity backends are unavailable"
            } else {
                "No records found"
            };
            Some(format!("{} ({})", headline, details))
        } else {
            None
        };

        Self {
            records,
            provider_counts,
            providers,
            flags,
            reason,
        }
    }

    pub fn outcome_of(&self, provider: ProviderId) -> Option<&ProviderOutcome> {
        self.providers
            .iter()
            .find(|report| report.provider == provider)
            .map(|report| &report.outcome)
    }
}
