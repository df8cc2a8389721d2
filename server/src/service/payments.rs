//! Checkout endpoints

use actix_web::error::{ErrorBadRequest, ErrorInternalServerError, ErrorUnauthorized};
use actix_web::web::{Data, Json};
use actix_web::{HttpResponse, Result, post};
use serde::Serialize;

use crate::model::Model;
use crate::model::payments::{self, PaymentGateway, Preference, PreferenceId};
use crate::service::session::Identity;

/// What the client needs to proceed to checkout
#[derive(Debug, Serialize)]
struct CheckoutResp {
    preference_id: PreferenceId,
    init_point: String,
    total_cents: i64,
}

/// Turns the caller's cart into a gateway preference
#[post("/payments/preference")]
pub(super) async fn create_preference(
    model: Data<Model>,
    gateway: Data<dyn PaymentGateway>,
    identity: Identity,
) -> Result<Json<CheckoutResp>> {
    let profile = identity
        .user_id
        .profile(model.db())
        .await
        .map_err(|_| ErrorInternalServerError("Cannot load profile"))?
        .ok_or_else(|| ErrorUnauthorized("Unknown user"))?;

    let preference = Preference::create(
        model.db(),
        gateway.as_ref(),
        identity.user_id,
        profile.email,
    )
    .await
    .map_err(|err| match err.downcast_ref::<payments::Error>() {
        Some(payments::Error::EmptyCart) => ErrorBadRequest("Cart is empty"),
        _ => ErrorInternalServerError("Cannot create preference"),
    })?;

    Ok(Json(CheckoutResp {
        preference_id: preference.id,
        init_point: preference.init_point,
        total_cents: preference.total_cents,
    }))
}

/// Gateway notification sink.
///
/// Always acknowledged with 200 once the payload is logged; the gateway
/// keeps retrying on any other status.
#[post("/payments/webhook")]
pub(super) async fn webhook(model: Data<Model>, payload: String) -> Result<HttpResponse> {
    payments::record_webhook_event(model.db(), &payload)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot record event"))?;

    Ok(HttpResponse::Ok().finish())
}
