//! Payment preferences & webhook log
//!
//! Checkout is pass-through glue: the cart becomes a preference at the
//! payment gateway and the student is redirected there. The gateway's
//! webhook events are logged verbatim; an approved payment marks the
//! preference paid and empties the cart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use sqlx::prelude::Type;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::cart::Cart;
use crate::model::users::UserId;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Cart is empty")]
    EmptyCart,
    #[error("Payment gateway rejected the preference: {0}")]
    Gateway(String),
}

/// Newtype for preference id, doubling as the external reference sent to
/// the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Type, Serialize, Deserialize)]
#[sqlx(transparent)]
#[serde(transparent)]
pub struct PreferenceId(Uuid);

impl std::fmt::Display for PreferenceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One line sent to the gateway
#[derive(Debug, Clone, Serialize)]
pub struct PreferenceItem {
    pub title: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// What the gateway is asked to build a checkout for
#[derive(Debug, Clone, Serialize)]
pub struct PreferenceRequest {
    /// Our preference id, echoed back by webhook events
    pub external_reference: PreferenceId,
    pub payer_email: String,
    pub items: Vec<PreferenceItem>,
}

/// The gateway's answer: its own id plus the redirect target
#[derive(Debug, Clone)]
pub struct GatewayPreference {
    pub gateway_id: String,
    pub init_point: String,
}

/// The payment provider, behind a seam so the service never speaks its
/// SDK directly
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_preference(&self, request: &PreferenceRequest) -> Result<GatewayPreference>;
}

/// Stand-in gateway producing deterministic sandbox redirects
pub struct SandboxGateway;

#[async_trait]
impl PaymentGateway for SandboxGateway {
    async fn create_preference(&self, request: &PreferenceRequest) -> Result<GatewayPreference> {
        let gateway_id = format!("sandbox-{}", request.external_reference);
        let init_point = format!(
            "https://sandbox.checkout.example/pay/{}",
            request.external_reference
        );
        Ok(GatewayPreference {
            gateway_id,
            init_point,
        })
    }
}

/// A stored checkout preference
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Preference {
    pub id: PreferenceId,
    pub user_id: UserId,
    pub gateway_id: String,
    pub init_point: String,
    pub total_cents: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Preference {
    /// Turns the user's cart into a gateway preference and stores it.
    /// The cart stays untouched until a webhook confirms the payment.
    pub async fn create(
        db: &sqlx::SqlitePool,
        gateway: &dyn PaymentGateway,
        user_id: UserId,
        payer_email: String,
    ) -> Result<Self> {
        let cart = Cart::fetch(db, user_id).await?;
        if cart.items.is_empty() {
            return Err(Error::EmptyCart.into());
        }

        let id = PreferenceId(Uuid::new_v4());
        let request = PreferenceRequest {
            external_reference: id,
            payer_email,
            items: cart
                .items
                .iter()
                .map(|item| PreferenceItem {
                    title: item.title.clone(),
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price_cents,
                })
                .collect(),
        };

        let answer = gateway
            .create_preference(&request)
            .await
            .map_err(|err| Error::Gateway(err.to_string()))?;

        let preference = Self {
            id,
            user_id,
            gateway_id: answer.gateway_id,
            init_point: answer.init_point,
            total_cents: cart.total_cents,
            status: "created".into(),
            created_at: Utc::now(),
        };

        sqlx::query(
            "insert into preferences (id, user_id, gateway_id, init_point, total_cents, status, \
             created_at) values (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(preference.id)
        .bind(preference.user_id)
        .bind(&preference.gateway_id)
        .bind(&preference.init_point)
        .bind(preference.total_cents)
        .bind(&preference.status)
        .bind(preference.created_at)
        .execute(db)
        .await?;

        info!(preference = %preference.id, total_cents = preference.total_cents, "preference created");
        Ok(preference)
    }

    /// Fetches a stored preference
    pub async fn fetch(
        db: impl sqlx::Executor<'_, Database = sqlx::Sqlite>,
        id: PreferenceId,
    ) -> Result<Option<Self>> {
        let row: Option<(PreferenceId, UserId, String, String, i64, String, DateTime<Utc>)> =
            sqlx::query_as(
                "select id, user_id, gateway_id, init_point, total_cents, status, created_at \
                 from preferences where id = ?",
            )
            .bind(id)
            .fetch_optional(db)
            .await?;

        Ok(row.map(
            |(id, user_id, gateway_id, init_point, total_cents, status, created_at)| Self {
                id,
                user_id,
                gateway_id,
                init_point,
                total_cents,
                status,
                created_at,
            },
        ))
    }
}

/// Body of a webhook notification, as far as this service cares
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: Option<String>,
    pub external_reference: Option<PreferenceId>,
}

/// Logs a raw webhook payload and applies an approved payment.
///
/// Unparseable or unrelated payloads are logged and acknowledged; the
/// gateway retries delivery on anything but a 2xx, so rejecting them
/// would only produce duplicate noise.
pub async fn record_webhook_event(db: &sqlx::SqlitePool, payload: &str) -> Result<()> {
    sqlx::query("insert into payment_events (received_at, payload) values (?, ?)")
        .bind(Utc::now())
        .bind(payload)
        .execute(db)
        .await?;

    let event: WebhookEvent = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(err) => {
            warn!(%err, "unparseable webhook payload logged and ignored");
            return Ok(());
        }
    };

    if event.kind != "payment" || event.status.as_deref() != Some("approved") {
        return Ok(());
    }
    let Some(reference) = event.external_reference else {
        warn!("approved payment without external reference");
        return Ok(());
    };

    let updated = sqlx::query("update preferences set status = 'paid' where id = ?")
        .bind(reference)
        .execute(db)
        .await?;
    if updated.rows_affected() == 0 {
        warn!(%reference, "approved payment for unknown preference");
        return Ok(());
    }

    if let Some(preference) = Preference::fetch(db, reference).await? {
        Cart::clear(db, preference.user_id).await?;
        info!(preference = %reference, "payment approved, cart emptied");
    }

    Ok(())
}
