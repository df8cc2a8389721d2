//! The session record and its user snapshot

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Unknown role")]
    UnknownRole,
}

/// Marketplace role of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Student,
    Teacher,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Teacher => "teacher",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "student" => Ok(Role::Student),
            "teacher" => Ok(Role::Teacher),
            "admin" => Ok(Role::Admin),
            _ => Err(Error::UnknownRole),
        }
    }
}

/// Snapshot of the profile fields taken from the last authentication
/// response. Owned by the record, not a live view of the account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub email_verified: bool,
}

/// The persisted bundle that represents "is logged in".
///
/// Exactly one record is meaningful at a time; saving always overwrites
/// the previous one wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Profile snapshot at the last login or refresh.
    pub user: UserProfile,
    /// Bearer credential for API calls.
    pub access_token: String,
    /// Credential used solely to mint a new access token.
    pub refresh_token: String,
    /// Absolute expiry; a record past this point counts as absent.
    pub expires_at: DateTime<Utc>,
    /// Advisory timestamp of the last user interaction. Nothing enforces
    /// a timeout off it.
    pub last_activity: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        user: UserProfile,
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user,
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
            last_activity: Utc::now(),
        }
    }

    /// Derived, never stored: the record is live while its expiry is in
    /// the future.
    pub fn is_active(&self) -> bool {
        self.expires_at > Utc::now()
    }

    /// Time left before expiry; negative once expired.
    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }
}

/// Profile stand-in for tests across the crate.
#[cfg(test)]
pub(crate) fn test_profile() -> UserProfile {
    UserProfile {
        id: Uuid::new_v4(),
        name: "Maya Lin".into(),
        email: "maya@example.com".into(),
        role: Role::Student,
        email_verified: true,
    }
}
