//! Credential tokens
//!
//! Two kinds of credential are issued on login:
//!
//! - The **access token** is a short-lived PASETO v4 public token signed
//!   with a per-issue keypair; only the public key is stored, keyed by its
//!   PASERK id, so authentication is a lookup plus a signature check and
//!   revocation is deleting the row.
//! - The **refresh token** is an opaque `{token_id}.{secret}` pair that
//!   exists solely to mint a new access token. The secret is never stored;
//!   the row keeps a SHA3-256 signature over data from three separate
//!   sources (a builtin app secret, a stored random secret, the presented
//!   token), so no single leak reconstructs a usable token. Every
//!   successful refresh rotates it.

use std::str::FromStr;
use std::time::Duration;

use base64::prelude::*;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use color_eyre::eyre::{OptionExt, bail, ensure};
use pasetors::claims::{Claims, ClaimsValidationRules};
use pasetors::footer::Footer;
use pasetors::keys::{AsymmetricKeyPair, AsymmetricPublicKey, Generate};
use pasetors::paserk::{self, FormatAsPaserk};
use pasetors::token::UntrustedToken;
use pasetors::version4::V4;
use pasetors::{Public, public};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use sqlx::prelude::Type;
use thiserror::Error;
use uuid::Uuid;

use crate::model::users::UserId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid token format")]
    InvalidTokenFormat,
    #[error("Token doesn't exist")]
    NonExistingToken,
    #[error("Token expired")]
    ExpiredToken,
    #[error("Missing user id on a token")]
    MissingUserId,
    #[error("Missing key id on a token")]
    MissingKeyId,
    #[error("Missing token claims")]
    MissingClaims,
    #[error("Signature malformed in the database")]
    InvalidSignatureStored,
    #[error("Invalid token claim {0}")]
    InvalidClaim(&'static str),
    #[error("Token ID collision")]
    TokenIdCollision,
    #[error("Invalid authorization format")]
    InvalidAuthorization,
    #[error("Invalid authorization scheme")]
    InvalidAuthorizationScheme,
}

/// Secret used as key for signing refresh tokens. For now it is a silly
/// constant for testing purposes, but it should be a secret fed from
/// environment variable during the build.
const REFRESH_TOKEN_APP_SECRET: &str = "BookingAppRefreshTokenSecret";

/// PASETO implicit assertion for access tokens
const ACCESS_APP_SECRET: &[u8] = b"BookingAppAccessTokenSecret";

/// Credential extracted from a `Authorization: Bearer [token]` header.
///
/// Both token kinds travel under the Bearer scheme; the endpoint decides
/// which kind it accepts.
#[derive(Debug, Clone)]
pub struct Bearer(pub String);

impl FromStr for Bearer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, token) = s.split_once(' ').ok_or(Error::InvalidAuthorization)?;
        match scheme {
            "Bearer" => Ok(Self(token.to_owned())),
            _ => Err(Error::InvalidAuthorizationScheme),
        }
    }
}

/// An issued-or-verified access token
#[derive(Debug, Clone, PartialEq)]
pub struct AccessToken {
    /// User this token authorizes
    pub user_id: UserId,
    /// The signed token string
    pub token: String,
    /// PASERK id of the signing key, the storage index
    pub key_id: String,
    /// Token expiration time
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Issues a new access token for the user, storing its public key
    pub async fn issue(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
        ttl: Duration,
    ) -> Result<Self> {
        let (access, pk) = Self::sign(user_id, ttl)?;

        sqlx::query("insert into access_keys (id, user_id, public_key, expires_at) values (?, ?, ?, ?)")
            .bind(&access.key_id)
            .bind(user_id)
            .bind(pk)
            .bind(access.expires_at)
            .execute(db)
            .await?;

        Ok(access)
    }

    /// Verifies a presented token against its stored public key
    pub async fn authenticate(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        token: &str,
    ) -> Result<Self> {
        let untrusted = UntrustedToken::<Public, V4>::try_from(token)?;
        let mut footer = Footer::new();
        footer.parse_bytes(untrusted.untrusted_footer())?;

        let key_id = footer
            .get_claim("kid")
            .ok_or_eyre(Error::MissingKeyId)?
            .as_str()
            .ok_or_eyre(Error::MissingKeyId)?;

        let (key,): (String,) = sqlx::query_as("select public_key from access_keys where id = ?")
            .bind(key_id)
            .fetch_optional(db)
            .await?
            .ok_or_eyre(Error::NonExistingToken)?;

        let key = AsymmetricPublicKey::<V4>::try_from(key.as_str())?;

        let rules = ClaimsValidationRules::new();
        let trusted = public::verify(&key, &untrusted, &rules, None, Some(ACCESS_APP_SECRET))?;

        let claims = trusted.payload_claims().ok_or_eyre(Error::MissingClaims)?;
        let user_id = claims
            .get_claim("iss")
            .and_then(|iss| iss.as_str())
            .ok_or_eyre(Error::MissingUserId)?
            .parse()?;

        Ok(Self {
            user_id,
            token: token.to_owned(),
            key_id: key_id.to_owned(),
            expires_at: expires_at(claims)?,
        })
    }

    /// Revokes this token by dropping its verification key
    pub async fn revoke(self, db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<()> {
        Self::revoke_key(db, &self.key_id).await
    }

    /// Drops a verification key by its PASERK id
    pub async fn revoke_key(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        key_id: &str,
    ) -> Result<()> {
        sqlx::query("delete from access_keys where id = ?")
            .bind(key_id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Cleans expired access keys from database
    pub async fn cleanup(db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<()> {
        sqlx::query("delete from access_keys where expires_at < ?")
            .bind(Utc::now())
            .execute(db)
            .await?;
        Ok(())
    }

    /// Signs a fresh token, returning it together with the PASERK-encoded
    /// public key for storage.
    ///
    /// Key collisions are ignored - they are extremely unlikely, and the
    /// worst result is that someone else's token stops verifying.
    fn sign(user_id: UserId, ttl: Duration) -> Result<(Self, String)> {
        let key_pair = AsymmetricKeyPair::<V4>::generate()?;
        let key_id = paserk::Id::from(&key_pair.public);

        let mut claims = Claims::new_expires_in(&ttl)?;
        claims.issuer(&user_id.to_string())?;
        let expires_at = expires_at(&claims)?;

        let mut kid = String::new();
        key_id.fmt(&mut kid)?;

        let mut pk = String::new();
        key_pair.public.fmt(&mut pk)?;

        let mut footer = Footer::new();
        footer.key_id(&key_id);

        let token = public::sign(
            &key_pair.secret,
            &claims,
            Some(&footer),
            Some(ACCESS_APP_SECRET),
        )?;

        let access = Self {
            user_id,
            token,
            key_id: kid,
            expires_at,
        };

        Ok((access, pk))
    }
}

/// Newtype for the opaque refresh token string
#[derive(Debug, Clone, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct RefreshToken(String);

impl RefreshToken {
    /// Creates a new refresh token for the user, storing its signature
    ///
    /// The returned value is the only place the full token ever exists.
    pub async fn create(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
        ttl: Duration,
    ) -> Result<Self> {
        let (entry, token) = TokenEntry::generate(user_id);
        let token_id = Uuid::new_v4();
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(14));

        let insertion = sqlx::query(
            "insert into refresh_tokens (id, user_id, secret, signature, expires_at) \
             values (?, ?, ?, ?, ?) on conflict(id) do nothing",
        )
        .bind(token_id)
        .bind(user_id)
        .bind(entry.secret)
        .bind(entry.signature.as_slice())
        .bind(expires_at)
        .execute(db)
        .await?;

        if insertion.rows_affected() == 0 {
            bail!(Error::TokenIdCollision);
        }

        let token_id = BASE64_STANDARD.encode(token_id.as_bytes());
        Ok(Self(format!("{token_id}.{token}")))
    }

    /// Verifies the token, returning the authenticated user id on success
    ///
    /// An expired entry is dropped on the spot and rejected.
    pub async fn authenticate(&self, db: &sqlx::SqlitePool) -> Result<UserId> {
        let (token_id, token) = self
            .0
            .split_once('.')
            .ok_or_eyre(Error::InvalidTokenFormat)?;

        let token_id: [u8; 16] = BASE64_STANDARD
            .decode(token_id)?
            .try_into()
            .map_err(|_| Error::InvalidTokenFormat)?;
        let token_id = Uuid::from_bytes(token_id);

        let (user_id, secret, signature, expires_at): (UserId, Uuid, Vec<u8>, DateTime<Utc>) =
            sqlx::query_as(
                "select user_id, secret, signature, expires_at from refresh_tokens where id = ?",
            )
            .bind(token_id)
            .fetch_optional(db)
            .await?
            .ok_or_eyre(Error::NonExistingToken)?;

        if expires_at <= Utc::now() {
            sqlx::query("delete from refresh_tokens where id = ?")
                .bind(token_id)
                .execute(db)
                .await?;
            bail!(Error::ExpiredToken);
        }

        let signature: [u8; 32] = signature
            .try_into()
            .map_err(|_| Error::InvalidSignatureStored)?;

        TokenEntry {
            user_id,
            secret,
            signature,
        }
        .verify(token)
    }

    /// Rotates the token: verifies it, drops its entry and issues a
    /// replacement in one transaction.
    pub async fn rotate(self, db: &sqlx::SqlitePool, ttl: Duration) -> Result<(Self, UserId)> {
        let user_id = self.authenticate(db).await?;

        let mut tx = db.begin().await?;
        self.delete(&mut *tx).await?;
        let replacement = Self::create(&mut *tx, user_id, ttl).await?;
        tx.commit().await?;

        Ok((replacement, user_id))
    }

    /// Revokes this token regardless of validity
    pub async fn revoke(self, db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<()> {
        self.delete(db).await
    }

    /// Revokes every refresh token of the user
    pub async fn revoke_all(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        user_id: UserId,
    ) -> Result<()> {
        sqlx::query("delete from refresh_tokens where user_id = ?")
            .bind(user_id)
            .execute(db)
            .await?;
        Ok(())
    }

    /// Cleans expired refresh tokens from database
    pub async fn cleanup(db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<()> {
        sqlx::query("delete from refresh_tokens where expires_at < ?")
            .bind(Utc::now())
            .execute(db)
            .await?;
        Ok(())
    }

    async fn delete(&self, db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>) -> Result<()> {
        let (token_id, _) = self
            .0
            .split_once('.')
            .ok_or_eyre(Error::InvalidTokenFormat)?;
        let token_id: [u8; 16] = BASE64_STANDARD
            .decode(token_id)?
            .try_into()
            .map_err(|_| Error::InvalidTokenFormat)?;

        sqlx::query("delete from refresh_tokens where id = ?")
            .bind(Uuid::from_bytes(token_id))
            .execute(db)
            .await?;
        Ok(())
    }
}

impl std::fmt::Display for RefreshToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RefreshToken {
    fn from(raw: String) -> Self {
        Self(raw)
    }
}

/// Stored half of a refresh token
struct TokenEntry {
    /// Authorized user identifier
    user_id: UserId,
    /// Secret to build the signing key
    secret: Uuid,
    /// Expected hash
    signature: [u8; 32],
}

impl TokenEntry {
    /// Generates a new entry for the given user
    ///
    /// Returns the entry together with the `token` part the client keeps.
    fn generate(user_id: UserId) -> (Self, String) {
        let secret = Uuid::new_v4();
        let token = Uuid::new_v4();
        let token = BASE64_STANDARD.encode(token.as_bytes());

        let secret_base64 = BASE64_STANDARD.encode(secret.as_bytes());

        let data = format!("{REFRESH_TOKEN_APP_SECRET}.{user_id}.{secret_base64}.{token}");

        let mut hasher = Sha3_256::new();
        hasher.update(data.as_bytes());
        let signature = hasher.finalize().into();

        let entry = TokenEntry {
            user_id,
            secret,
            signature,
        };

        (entry, token)
    }

    /// Verifies the presented token part against the stored signature
    fn verify(&self, token: &str) -> Result<UserId> {
        let secret = BASE64_STANDARD.encode(self.secret.as_bytes());
        let user_id = self.user_id;

        let data = format!("{REFRESH_TOKEN_APP_SECRET}.{user_id}.{secret}.{token}");

        let mut hasher = Sha3_256::new();
        hasher.update(data.as_bytes());
        let signature: [u8; 32] = hasher.finalize().into();

        ensure!(signature == self.signature, "Token signature doesn't match");
        Ok(user_id)
    }
}

/// Retrieves `exp` from token claims
fn expires_at(claims: &Claims) -> Result<DateTime<Utc>> {
    let expires_at = claims
        .get_claim("exp")
        .and_then(|exp| exp.as_str())
        .ok_or(Error::InvalidClaim("exp"))?;
    expires_at.parse().map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::model::users::NewUser;
    use session::Role;
    use sqlx::SqlitePool;

    async fn setup_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("model/migrations").run(&pool).await.unwrap();
        pool
    }

    async fn user(pool: &SqlitePool, email: &str) -> UserId {
        NewUser {
            name: "Maya Lin".into(),
            email: email.into(),
            role: Role::Student,
            password: "pw".into(),
        }
        .create(pool)
        .await
        .unwrap()
    }

    const TTL: Duration = Duration::from_secs(30 * 60);

    mod access_token {
        use super::*;

        #[tokio::test]
        async fn verify_with_issued_token() {
            let pool = setup_pool().await;

            let user1 = user(&pool, "u1@example.com").await;
            let token1 = AccessToken::issue(&pool, user1, TTL).await.unwrap();

            let authenticated = AccessToken::authenticate(&pool, &token1.token).await.unwrap();
            assert_eq!(authenticated, token1);

            let user2 = user(&pool, "u2@example.com").await;
            let token2 = AccessToken::issue(&pool, user2, TTL).await.unwrap();
            // Also multiple tokens for a single user
            let token3 = AccessToken::issue(&pool, user2, TTL).await.unwrap();

            let authenticated = AccessToken::authenticate(&pool, &token2.token).await.unwrap();
            assert_eq!(authenticated.user_id, user2);

            let authenticated = AccessToken::authenticate(&pool, &token3.token).await.unwrap();
            assert_eq!(authenticated.user_id, user2);
        }

        #[tokio::test]
        async fn verify_with_random_data_fails() {
            let pool = setup_pool().await;
            let _ = AccessToken::authenticate(&pool, "fake_token")
                .await
                .unwrap_err();
        }

        #[tokio::test]
        async fn revoked_token_stops_verifying() {
            let pool = setup_pool().await;

            let user_id = user(&pool, "u1@example.com").await;
            let access = AccessToken::issue(&pool, user_id, TTL).await.unwrap();
            let token = access.token.clone();

            access.revoke(&pool).await.unwrap();
            let _ = AccessToken::authenticate(&pool, &token).await.unwrap_err();
        }

        #[tokio::test]
        async fn cleanup_drops_expired_keys() {
            let pool = setup_pool().await;

            let user_id = user(&pool, "u1@example.com").await;
            let stale = AccessToken::issue(&pool, user_id, TTL).await.unwrap();
            sqlx::query("update access_keys set expires_at = ? where id = ?")
                .bind(Utc::now() - chrono::Duration::minutes(1))
                .bind(&stale.key_id)
                .execute(&pool)
                .await
                .unwrap();
            let live = AccessToken::issue(&pool, user_id, TTL).await.unwrap();

            AccessToken::cleanup(&pool).await.unwrap();

            let _ = AccessToken::authenticate(&pool, &stale.token)
                .await
                .unwrap_err();
            AccessToken::authenticate(&pool, &live.token).await.unwrap();
        }
    }

    mod refresh_token {
        use super::*;

        #[tokio::test]
        async fn verify_with_created_token() {
            let pool = setup_pool().await;

            let user1 = user(&pool, "u1@example.com").await;
            let token1 = RefreshToken::create(&pool, user1, TTL).await.unwrap();
            assert_eq!(token1.authenticate(&pool).await.unwrap(), user1);

            let user2 = user(&pool, "u2@example.com").await;
            let token2 = RefreshToken::create(&pool, user2, TTL).await.unwrap();
            let token3 = RefreshToken::create(&pool, user2, TTL).await.unwrap();

            assert_eq!(token1.authenticate(&pool).await.unwrap(), user1);
            assert_eq!(token2.authenticate(&pool).await.unwrap(), user2);
            assert_eq!(token3.authenticate(&pool).await.unwrap(), user2);
        }

        #[tokio::test]
        async fn verify_with_random_data_fails() {
            let pool = setup_pool().await;
            let _ = RefreshToken::from("fake_token".to_owned())
                .authenticate(&pool)
                .await
                .unwrap_err();
        }

        #[tokio::test]
        async fn verify_with_invalid_key_fails() {
            let pool = setup_pool().await;
            let _ = RefreshToken::from("U7PydAY1TsKmmVGf4LS3YA==.PUGKx45wSK+0rhl4F2TDdg==".to_owned())
                .authenticate(&pool)
                .await
                .unwrap_err();
        }

        #[tokio::test]
        async fn rotation_invalidates_the_old_token() {
            let pool = setup_pool().await;

            let user_id = user(&pool, "u1@example.com").await;
            let old = RefreshToken::create(&pool, user_id, TTL).await.unwrap();

            let (new, rotated_user) = old.clone().rotate(&pool, TTL).await.unwrap();
            assert_eq!(rotated_user, user_id);
            assert_ne!(old, new);

            let _ = old.authenticate(&pool).await.unwrap_err();
            assert_eq!(new.authenticate(&pool).await.unwrap(), user_id);
        }

        #[tokio::test]
        async fn expired_token_is_rejected_and_dropped() {
            let pool = setup_pool().await;

            let user_id = user(&pool, "u1@example.com").await;
            let token = RefreshToken::create(&pool, user_id, Duration::ZERO)
                .await
                .unwrap();

            let _ = token.authenticate(&pool).await.unwrap_err();

            let (count,): (i64,) = sqlx::query_as("select count(*) from refresh_tokens")
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(count, 0);
        }

        #[tokio::test]
        async fn revoke_all_logs_the_user_out_everywhere() {
            let pool = setup_pool().await;

            let user_id = user(&pool, "u1@example.com").await;
            let token1 = RefreshToken::create(&pool, user_id, TTL).await.unwrap();
            let token2 = RefreshToken::create(&pool, user_id, TTL).await.unwrap();

            RefreshToken::revoke_all(&pool, user_id).await.unwrap();

            let _ = token1.authenticate(&pool).await.unwrap_err();
            let _ = token2.authenticate(&pool).await.unwrap_err();
        }
    }

    #[test]
    fn bearer_scheme_parsing() {
        let bearer: Bearer = "Bearer abc.def".parse().unwrap();
        assert_eq!(bearer.0, "abc.def");

        assert!("Token abc".parse::<Bearer>().is_err());
        assert!("justatoken".parse::<Bearer>().is_err());
    }
}
