//! Room identifiers.
//!
//! Rooms are named by opaque strings. Clients usually generate them, but
//! whatever a user types into a join form is accepted as-is (after trimming)
//! and the room is created on first join.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Length of generated ids.
pub const GENERATED_LEN: usize = 12;
/// Longest accepted id, in bytes.
pub const MAX_LEN: usize = 128;

const ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// A room id: non-empty, trimmed, at most [`MAX_LEN`] bytes of UTF-8.
///
/// Only generated ids are guaranteed to be URL-safe. Ids travel inside
/// protocol messages and are used as raw storage keys, never as paths.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    /// Generate a random id: 12 base36 characters (about 62 bits).
    ///
    /// Collisions are unlikely but not ruled out; two clients picking the
    /// same id simply share a room.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..GENERATED_LEN)
            .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Accept a user-supplied id. Surrounding whitespace is ignored; any
    /// other text, including spaces, punctuation and non-ASCII, is kept.
    pub fn parse(raw: &str) -> Result<Self, RoomIdError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(RoomIdError::Empty);
        }
        if trimmed.len() > MAX_LEN {
            return Err(RoomIdError::TooLong(trimmed.len()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoomId {
    type Error = RoomIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RoomId> for String {
    fn from(id: RoomId) -> Self {
        id.0
    }
}

impl AsRef<str> for RoomId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Why a room id was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomIdError {
    Empty,
    TooLong(usize),
}

impl fmt::Display for RoomIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Room id is empty"),
            Self::TooLong(n) => write!(f, "Room id too long: {n} bytes (max {MAX_LEN})"),
        }
    }
}

impl std::error::Error for RoomIdError {}
