use super::types::InboundEvent;
use crate::utils::clock::now_utc_seconds;
use lastseen_sdk::objects::{ReportDateError, TelemetryEnvelope, parse_reportfile_date};
use thiserror::Error;

/// Reasons a bus payload is not a usable event.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Not JSON, or a field has the wrong JSON type or is missing.
    #[error("malformed payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("payload has no metadata object")]
    MissingMetadata,

    #[error("metadata has no reportfile_date")]
    MissingReportDate,

    #[error(transparent)]
    InvalidReportDate(#[from] ReportDateError),

    #[error("metadata field {0} is empty")]
    EmptyField(&'static str),
}

/// Decode and validate a raw bus payload.
pub fn parse(payload: &[u8]) -> Result<InboundEvent, ParseError> {
    let envelope: TelemetryEnvelope = serde_json::from_slice(payload)?;
    let metadata = envelope.metadata.ok_or(ParseError::MissingMetadata)?;

    for (name, value) in [
        ("client_code", &metadata.client_code),
        ("device_code", &metadata.device_code),
        ("message_code", &metadata.message_code),
    ] {
        if value.is_empty() {
            return Err(ParseError::EmptyField(name));
        }
    }

    let report_date = metadata
        .reportfile_date
        .as_deref()
        .ok_or(ParseError::MissingReportDate)?;
    let report_file_processed = parse_reportfile_date(report_date)?;

    Ok(InboundEvent {
        client_code: metadata.client_code,
        device_code: metadata.device_code,
        message_code: metadata.message_code,
        family_name: metadata.family_name.unwrap_or_default(),
        report_file_processed,
        current_time: now_utc_seconds(),
        is_raw: metadata.is_raw,
    })
}
