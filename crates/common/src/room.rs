// Room addressing: a room is one document instance, `siteId:version`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum length of a single room key segment.
pub const MAX_SEGMENT_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomKeyError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },
    #[error("{field} exceeds {MAX_SEGMENT_LEN} characters")]
    TooLong { field: &'static str },
    #[error("{field} contains characters outside [A-Za-z0-9._-]")]
    InvalidCharacters { field: &'static str },
    #[error("room id must have the form `siteId:version`")]
    Malformed,
}

/// Identifies a room: the site being edited and the version of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RoomKey {
    site_id: String,
    version: String,
}

impl RoomKey {
    pub fn new(site_id: impl Into<String>, version: impl Into<String>) -> Result<Self, RoomKeyError> {
        let site_id = site_id.into();
        let version = version.into();
        validate_segment("site_id", &site_id)?;
        validate_segment("version", &version)?;
        Ok(Self { site_id, version })
    }

    /// Parse the path tail after `/ws/`. Exactly two segments are accepted.
    pub fn from_ws_path(tail: &str) -> Result<Self, RoomKeyError> {
        let mut segments = tail.split('/');
        let (Some(site_id), Some(version), None) =
            (segments.next(), segments.next(), segments.next())
        else {
            return Err(RoomKeyError::Malformed);
        };
        Self::new(site_id, version)
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The `siteId:version` string used as registry and rate-limit key.
    pub fn room_id(&self) -> String {
        format!("{}:{}", self.site_id, self.version)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.site_id, self.version)
    }
}

impl FromStr for RoomKey {
    type Err = RoomKeyError;

    fn from_str(room_id: &str) -> Result<Self, Self::Err> {
        let (site_id, version) = room_id.split_once(':').ok_or(RoomKeyError::Malformed)?;
        Self::new(site_id, version)
    }
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), RoomKeyError> {
    if value.is_empty() {
        return Err(RoomKeyError::Empty { field });
    }
    if value.len() > MAX_SEGMENT_LEN {
        return Err(RoomKeyError::TooLong { field });
    }
    if !value.bytes().all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-'))
    {
        return Err(RoomKeyError::InvalidCharacters { field });
    }
    Ok(())
}
