//! Response parsers, one per provider.
//!
//! Parsers are pure: they read a captured [`RawResponse`] and return person
//! records. Missing fields become empty strings; only a body that cannot be
//! read at all is a `Parse` error.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::errors::ProviderError;
use crate::models::{PersonRecord, ProviderId};
use crate::session_manager::RawResponse;

pub trait ProviderParser: Send + Sync {
    fn provider(&self) -> ProviderId;
    fn parse(&self, response: &RawResponse) -> Result<Vec<PersonRecord>, ProviderError>;
}

// Field names seen across the three backends, normalized to snake_case.
const NIK_KEYS: &[&str] = &["ktp_number", "nik", "no_ktp", "ktp"];
const NAME_KEYS: &[&str] = &["full_name", "nama_lengkap", "nama", "name"];
const BIRTH_DATE_KEYS: &[&str] = &["date_of_birth", "tanggal_lahir", "tgl_lahir", "birth_date"];
const BIRTH_PLACE_KEYS: &[&str] = &["birth_place", "tempat_lahir", "place_of_birth"];
const ADDRESS_KEYS: &[&str] = &["address", "alamat"];
const FAMILY_CERT_KEYS: &[&str] = &["family_cert_number", "no_kk", "nomor_kk", "kk"];

static TABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<table[^>]*>(.*?)</table>").expect("valid table regex"));
static ROW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").expect("valid row regex"));
static CELL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<t([hd])[^>]*>(.*?)</t[hd]>").expect("valid cell regex"));
static TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid tag regex"));

fn normalize_key(raw: &str) -> String {
    raw.trim()
        .to_ascii_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn pick(object: &serde_json::Map<String, Value>, keys: &[&str]) -> String {
    for (key, value) in object {
        if keys.contains(&normalize_key(key).as_str()) {
            if let Some(text) = scalar_text(value).filter(|t| !t.is_empty()) {
                return text;
            }
        }
    }
    String::new()
}

/// Builds a record from a JSON object using the alias table.
pub fn record_from_json(
    object: &serde_json::Map<String, Value>,
    provider: ProviderId,
) -> PersonRecord {
    PersonRecord {
        nik: pick(object, NIK_KEYS),
        full_name: pick(object, NAME_KEYS),
        birth_date: pick(object, BIRTH_DATE_KEYS),
        birth_place: pick(object, BIRTH_PLACE_KEYS),
        address: pick(object, ADDRESS_KEYS),
        family_cert_number: pick(object, FAMILY_CERT_KEYS),
        source_provider: provider,
    }
}

/// Whether `record` names a person at all. Status envelopes such as
/// `{"success":false,"message":"..."}` map to records with neither field.
fn identifies_person(record: &PersonRecord) -> bool {
    !record.nik.is_empty() || !record.full_name.is_empty()
}

/// Records from a JSON value that is either a list of objects or one object.
/// Objects without a NIK or a name are skipped.
fn records_from_value(value: &Value, provider: ProviderId) -> Vec<PersonRecord> {
    let objects: Vec<&serde_json::Map<String, Value>> = match value {
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        Value::Object(object) => vec![object],
        _ => Vec::new(),
    };

    objects
        .into_iter()
        .map(|object| record_from_json(object, provider))
        .filter(identifies_person)
        .collect()
}

fn parse_json(response: &RawResponse, provider: ProviderId) -> Result<Value, ProviderError> {
    serde_json::from_str(&response.body)
        .map_err(|e| ProviderError::parse(provider, format!("response is not JSON: {}", e)))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn cell_text(html: &str) -> String {
    let stripped = TAG_RE.replace_all(html, " ");
    decode_entities(&stripped)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reads the first HTML table whose header names person fields. Header
/// cells become keys for the alias table; each data row becomes one record.
pub fn records_from_html_table(html: &str, provider: ProviderId) -> Vec<PersonRecord> {
    for table in TABLE_RE.captures_iter(html) {
        let Some(body) = table.get(1) else { continue };
        let mut headers: Option<Vec<String>> = None;
        let mut records = Vec::new();

        for row in ROW_RE.captures_iter(body.as_str()) {
            let Some(row) = row.get(1) else { continue };
            let cells: Vec<(bool, String)> = CELL_RE
                .captures_iter(row.as_str())
                .map(|cell| {
                    let is_header = cell
                        .get(1)
                        .map(|m| m.as_str().eq_ignore_ascii_case("h"))
                        .unwrap_or(false);
                    let text = cell.get(2).map(|m| cell_text(m.as_str())).unwrap_or_default();
                    (is_header, text)
                })
                .collect();

            if cells.is_empty() {
                continue;
            }

            match &headers {
                None => {
                    // First row is the header whether it uses <th> or <td>.
                    headers = Some(
                        cells
                            .into_iter()
                            .map(|(_, text)| normalize_key(&text))
                            .collect(),
                    );
                }
                Some(names) => {
                    if cells.iter().all(|(_, text)| text.is_empty()) {
                        continue;
                    }
                    let object: serde_json::Map<String, Value> = names
                        .iter()
                        .zip(cells)
                        .map(|(name, (_, text))| (name.clone(), Value::String(text)))
                        .collect();
                    records.push(record_from_json(&object, provider));
                }
            }
        }

        let knows_people = headers
            .as_ref()
            .map(|names| {
                names.iter().any(|name| {
                    NIK_KEYS.contains(&name.as_str()) || NAME_KEYS.contains(&name.as_str())
                })
            })
            .unwrap_or(false);

        if knows_people {
            return records;
        }
    }

    Vec::new()
}

/// Provider A: `{"person": [...]}` or `{"data": [...]}`, a list or a single
/// object.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClearanceParser;

impl ProviderParser for ClearanceParser {
    fn provider(&self) -> ProviderId {
        ProviderId::Clearance
    }

    fn parse(&self, response: &RawResponse) -> Result<Vec<PersonRecord>, ProviderError> {
        let body = parse_json(response, self.provider())?;
        let people = body.get("person").or_else(|| body.get("data"));
        Ok(people
            .map(|value| records_from_value(value, self.provider()))
            .unwrap_or_default())
    }
}

/// Provider B: `{"person": [...]}`, optionally with `success`/`error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ToolkitParser;

impl ProviderParser for ToolkitParser {
    fn provider(&self) -> ProviderId {
        ProviderId::Toolkit
    }

    fn parse(&self, response: &RawResponse) -> Result<Vec<PersonRecord>, ProviderError> {
        let body = parse_json(response, self.provider())?;
        match body.get("person") {
            Some(Value::Array(_)) | Some(Value::Object(_)) => {
                Ok(records_from_value(&body["person"], self.provider()))
            }
            Some(Value::Null) => Ok(Vec::new()),
            Some(_) => Err(ProviderError::parse(self.provider(), "'person' is not a list")),
            None => {
                let error = body.get("error").and_then(Value::as_str).unwrap_or_default();
                if error.is_empty() {
                    Err(ProviderError::parse(self.provider(), "response has no 'person' field"))
                } else {
                    Err(ProviderError::parse(self.provider(), format!("search error: {}", error)))
                }
            }
        }
    }
}

/// Provider C: JSON when the portal has it, otherwise the HTML results table.
#[derive(Debug, Default, Clone, Copy)]
pub struct PortalParser;

impl ProviderParser for PortalParser {
    fn provider(&self) -> ProviderId {
        ProviderId::Portal
    }

    fn parse(&self, response: &RawResponse) -> Result<Vec<PersonRecord>, ProviderError> {
        if let Ok(body) = serde_json::from_str::<Value>(&response.body) {
            let people = match &body {
                Value::Array(_) => Some(&body),
                Value::Object(object) => ["person", "data", "results"]
                    .iter()
                    .find_map(|key| object.get(*key))
                    .or(Some(&body)),
                _ => None,
            };
            return Ok(people
                .map(|value| records_from_value(value, self.provider()))
                .unwrap_or_default());
        }

        if response.is_html() {
            return Ok(records_from_html_table(&response.body, self.provider()));
        }

        Err(ProviderError::parse(self.provider(), "response is neither JSON nor HTML"))
    }
}
