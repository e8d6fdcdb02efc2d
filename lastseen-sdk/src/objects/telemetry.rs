//! Telemetry envelope published by device gateways.
//!
//! Only the `metadata` object matters to the relay; every other field of the
//! envelope is ignored on decode.

use serde::{Deserialize, Serialize};
use time::PrimitiveDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;

/// Format of `metadata.reportfile_date`: `YYYYMMDDHHMMSS`, no separators.
pub const REPORTFILE_DATE_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year][month][day][hour][minute][second]");

#[derive(Debug, thiserror::Error)]
pub enum ReportDateError {
    #[error("invalid report file date {value:?}: {source}")]
    Parse {
        value: String,
        source: time::error::Parse,
    },
    #[error("failed to format report file date: {0}")]
    Format(#[from] time::error::Format),
}

/// Parse a `reportfile_date` value.
pub fn parse_reportfile_date(value: &str) -> Result<PrimitiveDateTime, ReportDateError> {
    PrimitiveDateTime::parse(value, REPORTFILE_DATE_FORMAT).map_err(|source| {
        ReportDateError::Parse {
            value: value.to_owned(),
            source,
        }
    })
}

/// Render a timestamp the way gateways put it on the wire.
pub fn format_reportfile_date(value: PrimitiveDateTime) -> Result<String, ReportDateError> {
    Ok(value.format(REPORTFILE_DATE_FORMAT)?)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    /// Absent or `null` metadata decodes to `None`; the relay rejects those.
    #[serde(default)]
    pub metadata: Option<TelemetryMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryMetadata {
    pub client_code: String,
    pub device_code: String,
    pub message_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_name: Option<String>,
    /// Raw messages are diagnostic copies and never count as presence.
    pub is_raw: bool,
    #[serde(default)]
    pub reportfile_date: Option<String>,
}

impl TelemetryEnvelope {
    pub fn new(metadata: TelemetryMetadata) -> Self {
        Self {
            metadata: Some(metadata),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl TelemetryMetadata {
    /// Build metadata for a processed (non-raw) report file.
    pub fn new(
        client_code: impl Into<String>,
        device_code: impl Into<String>,
        message_code: impl Into<String>,
        report_date: PrimitiveDateTime,
    ) -> Result<Self, ReportDateError> {
        Ok(Self {
            client_code: client_code.into(),
            device_code: device_code.into(),
            message_code: message_code.into(),
            family_name: None,
            is_raw: false,
            reportfile_date: Some(format_reportfile_date(report_date)?),
        })
    }

    pub fn with_family_name(mut self, family_name: impl Into<String>) -> Self {
        self.family_name = Some(family_name.into());
        self
    }

    pub fn raw(mut self) -> Self {
        self.is_raw = true;
        self
    }
}
