//! Wire objects shared by lastseen producers and the relay.

#![forbid(unsafe_code)]

pub mod config;
pub mod objects;
