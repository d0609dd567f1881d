//! Protocol versioning.
//!
//! Clients announce the major version they speak in their `connect` frame.
//! Minor versions only add optional fields, so any client with the same major
//! version is accepted.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

/// Accept a client's announced major version.
///
/// # Errors
///
/// Returns [`ProtocolError::UnsupportedVersion`] if the major version differs
/// from ours.
pub fn negotiate(client_major: u8) -> Result<Version, ProtocolError> {
    if PROTOCOL_VERSION.is_compatible_with(&Version::new(client_major, 0)) {
        Ok(PROTOCOL_VERSION)
    } else {
        Err(ProtocolError::UnsupportedVersion(client_major))
    }
}
