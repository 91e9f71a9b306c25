//! Session identity.
//!
//! A [`SessionId`] names one logical client-to-backend conversation for the
//! lifetime of the relay process. IDs are ULID-based: unique, sortable by
//! creation time, and opaque to clients, which only ever echo them back in
//! a resume handshake.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Identity of a logical session, outliving any single transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(Ulid);

impl SessionId {
    /// Display prefix, `ses_01HV...`.
    pub const PREFIX: &'static str = "ses";

    /// Wire size in bytes.
    pub const LEN: usize = 16;

    /// Generates a fresh identity.
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Reconstructs an identity from its wire representation.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(Ulid::from_bytes(bytes))
    }

    /// Wire representation: the raw 16 ULID bytes.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; Self::LEN] {
        self.0.to_bytes()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

/// Error parsing a [`SessionId`] from its string form.
#[derive(Debug, thiserror::Error)]
#[error("invalid session id: {0}")]
pub struct ParseSessionIdError(String);

impl FromStr for SessionId {
    type Err = ParseSessionIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(Self::PREFIX)
            .and_then(|r| r.strip_prefix('_'))
            .ok_or_else(|| ParseSessionIdError(s.to_string()))?;
        let ulid = Ulid::from_string(rest).map_err(|_| ParseSessionIdError(s.to_string()))?;
        Ok(Self(ulid))
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_round_trip() {
        let id = SessionId::new();
        let shown = id.to_string();
        assert!(shown.starts_with("ses_"));
        let parsed: SessionId = shown.parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn bytes_round_trip() {
        let id = SessionId::new();
        assert_eq!(SessionId::from_bytes(id.to_bytes()), id);
    }

    #[test]
    fn rejects_missing_prefix() {
        let id = SessionId::new();
        let bare = id.to_string().trim_start_matches("ses_").to_string();
        assert!(bare.parse::<SessionId>().is_err());
        assert!("app_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse::<SessionId>().is_err());
        assert!("ses_not-a-ulid".parse::<SessionId>().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let id = SessionId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
