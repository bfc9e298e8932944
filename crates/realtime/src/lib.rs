// scenesync-realtime library entry point (the binary and integration tests
// build on it).

pub mod config;
pub mod coordination;
pub mod cors;
pub mod db;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod room;
