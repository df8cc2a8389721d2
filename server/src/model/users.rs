//! Service users storage

use base64::prelude::*;
use chrono::{DateTime, Duration, Utc};
use color_eyre::Result;
use color_eyre::eyre::OptionExt;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use sqlx::prelude::Type;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use session::{Role, UserProfile};

use crate::config;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Invalid user id format")]
    InvalidUserId,
    #[error("Email already registered")]
    EmailTaken,
    #[error("Role malformed in the database")]
    InvalidRoleStored,
}

/// Why a credential check did not produce a user.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CredentialError {
    #[error("No account exists for this email")]
    UnknownEmail,
    #[error("Wrong password")]
    WrongPassword,
    #[error("Account locked until {until}")]
    Locked { until: DateTime<Utc> },
}

/// Secret mixed into password digests. For now it is a silly constant for
/// testing purposes, but it should be a secret fed from environment
/// variable during the build.
const PASSWORD_APP_SECRET: &str = "BookingAppPasswordSecret";

/// Newtype for user id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id = Uuid::parse_str(s).map_err(|_| Error::InvalidUserId)?;
        Ok(Self(id))
    }
}

impl UserId {
    pub fn as_uuid(self) -> Uuid {
        self.0
    }

    /// Fetches the profile snapshot for this user
    pub async fn profile(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<Option<UserProfile>> {
        let row: Option<(String, String, String, bool)> =
            sqlx::query_as("select name, email, role, email_verified from users where id = ?")
                .bind(self)
                .fetch_optional(db)
                .await?;

        row.map(|(name, email, role, email_verified)| {
            Ok(UserProfile {
                id: self.0,
                name,
                email,
                role: role.parse().map_err(|_| Error::InvalidRoleStored)?,
                email_verified,
            })
        })
        .transpose()
    }

    /// Role of this user, for endpoint-level access checks
    pub async fn role(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<Option<Role>> {
        let row: Option<(String,)> = sqlx::query_as("select role from users where id = ?")
            .bind(self)
            .fetch_optional(db)
            .await?;

        row.map(|(role,)| role.parse().map_err(|_| Error::InvalidRoleStored.into()))
            .transpose()
    }
}

/// A registration waiting to be stored
#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub password: String,
}

impl NewUser {
    /// Creates the user, hashing the password with a fresh salt
    pub async fn create(
        self,
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    ) -> Result<UserId> {
        let user_id = UserId(Uuid::new_v4());
        let salt = Uuid::new_v4();
        let digest = password_digest(&salt, &self.password);

        let result = sqlx::query(
            "insert into users (id, name, email, role, password_salt, password_digest, created_at) \
             values (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(&self.name)
        .bind(&self.email)
        .bind(self.role.as_str())
        .bind(salt)
        .bind(digest.as_slice())
        .bind(Utc::now())
        .execute(db)
        .await;

        match result {
            Ok(_) => {
                info!(%user_id, email = %self.email, "user registered");
                Ok(user_id)
            }
            Err(err)
                if err
                    .as_database_error()
                    .is_some_and(|db_err| db_err.is_unique_violation()) =>
            {
                Err(Error::EmailTaken.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Checks email+password against the stored digest, maintaining the
/// account-lock counter.
///
/// A wrong password consumes one of the tolerated failures; reaching the
/// threshold locks the account for the configured duration. Success
/// resets the counter. Attempts against a locked account are rejected
/// without checking the password.
pub async fn verify_credentials(
    db: &sqlx::SqlitePool,
    tuning: &config::Auth,
    email: &str,
    password: &str,
) -> Result<Result<UserId, CredentialError>> {
    let row: Option<(UserId, Uuid, Vec<u8>, u32, Option<DateTime<Utc>>)> = sqlx::query_as(
        "select id, password_salt, password_digest, failed_logins, locked_until \
         from users where email = ?",
    )
    .bind(email)
    .fetch_optional(db)
    .await?;

    let Some((user_id, salt, stored, failed_logins, locked_until)) = row else {
        return Ok(Err(CredentialError::UnknownEmail));
    };

    if let Some(until) = locked_until {
        if until > Utc::now() {
            return Ok(Err(CredentialError::Locked { until }));
        }
    }

    let digest = password_digest(&salt, password);
    if stored != digest.as_slice() {
        let failed_logins = failed_logins + 1;
        if failed_logins >= tuning.lock_threshold {
            let until = Utc::now()
                + Duration::from_std(tuning.lock_duration())
                    .unwrap_or_else(|_| Duration::minutes(15));
            sqlx::query("update users set failed_logins = 0, locked_until = ? where id = ?")
                .bind(until)
                .bind(user_id)
                .execute(db)
                .await?;
            info!(%user_id, %until, "account locked after repeated failures");
            return Ok(Err(CredentialError::Locked { until }));
        }

        sqlx::query("update users set failed_logins = ? where id = ?")
            .bind(failed_logins)
            .bind(user_id)
            .execute(db)
            .await?;
        return Ok(Err(CredentialError::WrongPassword));
    }

    sqlx::query("update users set failed_logins = 0, locked_until = null where id = ?")
        .bind(user_id)
        .execute(db)
        .await?;

    Ok(Ok(user_id))
}

/// Looks a user up by email
pub async fn find_by_email(
    db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    email: &str,
) -> Result<Option<UserId>> {
    let row: Option<(UserId,)> = sqlx::query_as("select id from users where email = ?")
        .bind(email)
        .fetch_optional(db)
        .await?;
    Ok(row.map(|(id,)| id))
}

/// Marks the email address verified
pub async fn mark_email_verified(
    db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
    user_id: UserId,
) -> Result<()> {
    let updated = sqlx::query("update users set email_verified = 1 where id = ?")
        .bind(user_id)
        .execute(db)
        .await?;
    (updated.rows_affected() == 1)
        .then_some(())
        .ok_or_eyre(Error::InvalidUserId)
}

fn password_digest(salt: &Uuid, password: &str) -> [u8; 32] {
    let salt = BASE64_STANDARD.encode(salt.as_bytes());
    let data = format!("{PASSWORD_APP_SECRET}.{salt}.{password}");

    let mut hasher = Sha3_256::new();
    hasher.update(data.as_bytes());
    hasher.finalize().into()
}
