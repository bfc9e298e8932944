pub mod ws;

/// Protocol identifier advertised by the server metadata endpoint.
pub const PROTOCOL_VERSION: &str = "scenesync-sync.v1";
