pub mod account_service;
pub mod status_emit;

pub use status_emit::{ChannelNotifier, StatusNotifier, StatusUpdate};
