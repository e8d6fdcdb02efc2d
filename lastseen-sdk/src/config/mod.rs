//! Channel configuration shared by the relay and anything that provisions
//! the same topics.

mod channel;
mod policy;

pub use channel::ChannelConfig;
pub use policy::ChannelPolicy;
