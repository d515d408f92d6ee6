use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

/// First version able to carry gzip payloads
pub const MIN_COMPRESSION_VERSION: ProtocolVersion = ProtocolVersion::new(5, 0);

/// First version whose results must not carry refresh tokens
pub const MIN_REFRESH_TOKEN_REMOVAL_VERSION: ProtocolVersion = ProtocolVersion::new(16, 0);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolVersionError {
    #[error("empty protocol version")]
    Empty,

    #[error("invalid protocol version: {0}")]
    Invalid(String),
}

/// Negotiated broker protocol version, `major.minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse an optional negotiated version. Missing or unreadable versions
    /// are `None`, which gates every capability off.
    pub fn parse_negotiated(version: Option<&str>) -> Option<Self> {
        let version = version?.trim();
        if version.is_empty() {
            return None;
        }
        match version.parse() {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!("Ignoring negotiated protocol version: {}", e);
                None
            }
        }
    }

    pub fn is_at_least(self, required: ProtocolVersion) -> bool {
        self >= required
    }
}

impl FromStr for ProtocolVersion {
    type Err = ProtocolVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProtocolVersionError::Empty);
        }

        let invalid = || ProtocolVersionError::Invalid(s.to_string());
        let mut parts = s.split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let minor = match parts.next() {
            Some(p) => p.parse().map_err(|_| invalid())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self { major, minor })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

pub fn can_compress_broker_payloads(negotiated: Option<&str>) -> bool {
    ProtocolVersion::parse_negotiated(negotiated)
        .is_some_and(|v| v.is_at_least(MIN_COMPRESSION_VERSION))
}

pub fn should_remove_refresh_token(negotiated: Option<&str>) -> bool {
    ProtocolVersion::parse_negotiated(negotiated)
        .is_some_and(|v| v.is_at_least(MIN_REFRESH_TOKEN_REMOVAL_VERSION))
}
