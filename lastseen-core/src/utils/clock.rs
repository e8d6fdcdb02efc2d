use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

/// Human-readable timestamp layout used in logs and the health endpoint.
pub const DISPLAY_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Current UTC time without an offset, the representation stored in `TIMESTAMP` columns.
pub fn now_utc() -> PrimitiveDateTime {
    let now = OffsetDateTime::now_utc();
    PrimitiveDateTime::new(now.date(), now.time())
}

/// Current UTC time truncated to microseconds, the precision of a `TIMESTAMP` column.
pub fn now_utc_micros() -> PrimitiveDateTime {
    let now = now_utc();
    now.replace_microsecond(now.microsecond()).unwrap_or(now)
}

/// Current UTC time truncated to whole seconds.
pub fn now_utc_seconds() -> PrimitiveDateTime {
    let now = now_utc();
    now.replace_nanosecond(0).unwrap_or(now)
}

/// Render a timestamp as `YYYY-MM-DD HH:MM:SS`.
pub fn display(value: PrimitiveDateTime) -> String {
    value
        .format(DISPLAY_FORMAT)
        .unwrap_or_else(|_| value.to_string())
}
