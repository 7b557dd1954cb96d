//! Validated identifier newtypes shared across the data model.

use std::fmt;
use std::str::FromStr;

use rand::Rng as _;
use serde::{Deserialize, Serialize};

use crate::time::now_secs;

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// A work-item identifier: local to a run, dense, and `>= 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct ItemId(u32);

impl ItemId {
    /// Create a new `ItemId`, validating that it is `>= 1`.
    ///
    /// # Errors
    /// Returns an error if `value` is `0`.
    pub fn new(value: u32) -> Result<Self, ValidationError> {
        if value == 0 {
            return Err(ValidationError {
                kind: "ItemId",
                reason: "item ids must be >= 1".to_owned(),
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u32 = s.parse().map_err(|_| ValidationError {
            kind: "ItemId",
            reason: format!("not a positive integer: {s}"),
        })?;
        Self::new(value)
    }
}

impl TryFrom<u32> for ItemId {
    type Error = ValidationError;
    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ItemId> for u32 {
    fn from(id: ItemId) -> Self {
        id.0
    }
}

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A monotone-unique run identifier: a base36 timestamp plus 8 hex random
/// characters, so concurrent runs never collide and ids sort roughly in
/// creation order.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RunId(String);

impl RunId {
    /// Generate a fresh run id from the current time and a random suffix.
    #[must_use]
    pub fn generate() -> Self {
        let ts = to_base36(now_secs());
        let suffix: u32 = rand::rng().random();
        Self(format!("{ts}{suffix:08x}"))
    }

    /// Parse an existing run id string, validating its shape.
    ///
    /// # Errors
    /// Returns an error if `s` is empty or contains characters outside
    /// `[0-9a-z]`.
    pub fn new(s: &str) -> Result<Self, ValidationError> {
        Self::validate(s)?;
        Ok(Self(s.to_owned()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(s: &str) -> Result<(), ValidationError> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(ValidationError {
                kind: "RunId",
                reason: format!("must be a non-empty alphanumeric string, got `{s}`"),
            });
        }
        Ok(())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RunId {
    type Err = ValidationError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RunId {
    type Error = ValidationError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::validate(&s)?;
        Ok(Self(s))
    }
}

impl From<RunId> for String {
    fn from(id: RunId) -> Self {
        id.0
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_owned();
    }
    let mut buf = Vec::new();
    while value > 0 {
        buf.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// ValidationError
// ---------------------------------------------------------------------------

/// A validation failure for one of the newtypes in this module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    kind: &'static str,
    reason: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for ValidationError {}
