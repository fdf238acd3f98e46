use crate::errors::SearchError;
use crate::models::SearchParams;

/// Length of a NIK and of a family certificate (KK) number.
pub const ID_NUMBER_LEN: usize = 16;

/// Keeps only the digits: "3201-0101 9000 0001" becomes "3201010190000001".
pub fn normalize_nik(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

fn normalize_id_field(field: &Option<String>, label: &str) -> Result<Option<String>, SearchError> {
    let Some(raw) = SearchParams::text(field) else {
        return Ok(None);
    };

    let digits = normalize_nik(raw);
    if digits.len() != ID_NUMBER_LEN {
        return Err(SearchError::InvalidParams(format!(
            "{} must have {} digits, got {}",
            label,
            ID_NUMBER_LEN,
            digits.len()
        )));
    }
    Ok(Some(digits))
}

fn trimmed(field: &Option<String>) -> Option<String> {
    SearchParams::text(field).map(str::to_string)
}

/// Validates caller input and returns the cleaned-up parameters.
///
/// Blank strings become `None`, ID numbers are reduced to digits, and at
/// least one criterion must remain.
pub fn validate_params(params: &SearchParams) -> Result<SearchParams, SearchError> {
    let cleaned = SearchParams {
        name: trimmed(&params.name),
        nik: normalize_id_field(&params.nik, "nik")?,
        family_cert_number: normalize_id_field(&params.family_cert_number, "family_cert_number")?,
        birth_place: trimmed(&params.birth_place),
        birth_date: trimmed(&params.birth_date),
        province_code: trimmed(&params.province_code),
        regency_code: trimmed(&params.regency_code),
        district_code: trimmed(&params.district_code),
        village_code: trimmed(&params.village_code),
        page: params.page.filter(|page| *page > 0),
        limit: params.limit.filter(|limit| *limit > 0),
    };

    if !cleaned.has_criteria() {
        return Err(SearchError::InvalidParams(
            "at least one search criterion is required \
             (name, nik, family_cert_number, birth_place, birth_date or an area code)"
                .to_string(),
        ));
    }

    Ok(cleaned)
}
