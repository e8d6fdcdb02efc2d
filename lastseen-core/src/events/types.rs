use std::fmt;
use time::PrimitiveDateTime;

/// Composite identity of a presence row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub client_code: String,
    pub device_code: String,
    pub message_code: String,
}

impl DeviceKey {
    pub fn new(
        client_code: impl Into<String>,
        device_code: impl Into<String>,
        message_code: impl Into<String>,
    ) -> Self {
        Self {
            client_code: client_code.into(),
            device_code: device_code.into(),
            message_code: message_code.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.client_code, self.device_code, self.message_code
        )
    }
}

/// A validated telemetry event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub client_code: String,
    pub device_code: String,
    pub message_code: String,
    /// Empty when the gateway did not send one.
    pub family_name: String,
    /// When the device's report file was processed upstream. This is what
    /// `last_ping` records, not the time the relay received the message.
    pub report_file_processed: PrimitiveDateTime,
    /// Relay clock at parse time, UTC, whole seconds.
    pub current_time: PrimitiveDateTime,
    pub is_raw: bool,
}

impl InboundEvent {
    pub fn key(&self) -> DeviceKey {
        DeviceKey::new(&self.client_code, &self.device_code, &self.message_code)
    }
}
