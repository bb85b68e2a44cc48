use super::parse_document;
use crate::deps::Deps;
use crate::domain::AdvanceInfo;
use crate::domain::PipelineError;
use crate::domain::PipelineMessage;
use crate::domain::StageResult;
use crate::domain::ValidationIssue;

/// Semantic checks over the parsed claim: NPI checksum, payer routing,
/// service content. A clean claim advances with no new artifact; the
/// parsed document flows onward unchanged.
pub async fn handle(
    _deps: &Deps,
    _msg: &PipelineMessage,
    input: &[u8],
) -> Result<StageResult, PipelineError> {
    let parsed = parse_document(input)?;
    let mut issues = Vec::new();

    match parsed.claim.provider_npi.as_deref() {
        None => issues.push(ValidationIssue::error(
            "REQUIRED_FIELD_MISSING",
            "claim.providerNpi",
            "provider NPI is required",
        )),
        Some(npi) if !npi_checksum_valid(npi) => issues.push(ValidationIssue::error(
            "INVALID_NPI",
            "claim.providerNpi",
            "provider NPI fails its check digit",
        )),
        Some(_) => {}
    }

    if parsed
        .claim
        .payer_id
        .as_deref()
        .map_or(true, str::is_empty)
    {
        issues.push(ValidationIssue::error(
            "REQUIRED_FIELD_MISSING",
            "claim.payerId",
            "payer id is required",
        ));
    }

    if parsed.claim.items.is_empty() {
        issues.push(ValidationIssue::error(
            "NO_SERVICE_ITEMS",
            "claim.items",
            "at least one service item is required",
        ));
    }

    if issues.is_empty() {
        Ok(StageResult::Advance(AdvanceInfo::default()))
    } else {
        Ok(StageResult::ValidationFailure { issues })
    }
}

/// NPI check digit: Luhn over the 10-digit identifier with the 80840
/// issuer prefix.
fn npi_checksum_valid(npi: &str) -> bool {
    if npi.len() != 10 || !npi.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let digits: Vec<u32> = format!("80840{npi}")
        .chars()
        .filter_map(|c| c.to_digit(10))
        .collect();
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
