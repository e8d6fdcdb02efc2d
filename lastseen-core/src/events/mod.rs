//! Inbound device events.
//!
//! Every bus message is decoded into an [`InboundEvent`] by [`parse`]. Events
//! are ephemeral: a consumer builds one per message, hands it to the presence
//! store and drops it.

pub mod parser;
pub mod types;

pub use parser::{ParseError, parse};
pub use types::{DeviceKey, InboundEvent};
