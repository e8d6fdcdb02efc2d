pub mod channel;
pub mod telemetry;

pub use channel::{ChannelSource, DEFAULT_SUBSCRIPTION};
pub use telemetry::{
    REPORTFILE_DATE_FORMAT, ReportDateError, TelemetryEnvelope, TelemetryMetadata,
    format_reportfile_date, parse_reportfile_date,
};
