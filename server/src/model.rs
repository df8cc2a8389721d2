//! Service data model

use std::path::PathBuf;

use color_eyre::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use thiserror::Error;

pub mod auth;
pub mod cart;
pub mod catalog;
pub mod payments;
pub mod users;

use crate::config;
use crate::model::auth::{AccessToken, RefreshToken};

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Invalid SQLite path: {path}")]
    InvalidSqLitePath { path: PathBuf },
}

/// Shared state of the service: the database pool plus the credential
/// tuning everything auth-related reads.
#[derive(Clone)]
pub struct Model {
    /// Database access
    db: sqlx::SqlitePool,
    /// Credential and token tuning
    auth: config::Auth,
}

impl Model {
    /// Model for testing purposes - using the in-memory SQLite database
    pub async fn test() -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true)
            .foreign_keys(true)
            .shared_cache(true);

        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_lazy_with(opts);

        sqlx::migrate!("model/migrations").run(&db).await?;

        Ok(Self {
            db,
            auth: config::Auth::default(),
        })
    }

    /// Model from configuration
    ///
    /// If the database is created in-memory, the migrations are being executed automatically. If database is
    /// file based migrations would be executed only if requested by configuration.
    pub async fn with_config(config: config::Database, auth: config::Auth) -> Result<Self> {
        use config::Database::*;

        let db = match config {
            Memory { max_connections } => {
                let opts = SqliteConnectOptions::new()
                    .filename(":memory:")
                    .create_if_missing(true)
                    .foreign_keys(true)
                    .shared_cache(true);

                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_lazy_with(opts);

                sqlx::migrate!("model/migrations").run(&pool).await?;
                pool
            }

            SqLite {
                path,
                max_connections,
                migrate,
            } => {
                let path = path
                    .as_path()
                    .to_str()
                    .ok_or_else(|| Error::InvalidSqLitePath { path: path.clone() })?;

                let opts = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .foreign_keys(true);

                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_lazy_with(opts);

                if migrate {
                    sqlx::migrate!("model/migrations").run(&pool).await?;
                }

                pool
            }
        };

        Ok(Self { db, auth })
    }

    /// Accesses the DB pool
    pub fn db(&self) -> &sqlx::SqlitePool {
        &self.db
    }

    /// Credential tuning
    pub fn auth(&self) -> &config::Auth {
        &self.auth
    }

    /// Removes expired access keys and refresh tokens
    pub async fn cleanup(&self) -> Result<()> {
        AccessToken::cleanup(&self.db).await?;
        RefreshToken::cleanup(&self.db).await?;
        Ok(())
    }
}
