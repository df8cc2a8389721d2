//! Bearer credential verification

use std::future::{Ready, ready};

use actix_web::body::MessageBody;
use actix_web::dev::{Payload, ServiceResponse};
use actix_web::error::ErrorUnauthorized;
use actix_web::http::header;
use actix_web::middleware::Next;
use actix_web::web::Data;
use actix_web::{Error, FromRequest, HttpMessage, HttpRequest};
use chrono::{DateTime, Utc};

use crate::model::Model;
use crate::model::auth::{AccessToken, Bearer};
use crate::model::users::UserId;

/// The authenticated caller, placed in request extensions by the
/// middleware when a valid access token is presented
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: UserId,
    /// PASERK id of the token's verification key
    pub key_id: String,
    pub expires_at: DateTime<Utc>,
}

impl FromRequest for Identity {
    type Error = Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Identity>()
                .cloned()
                .ok_or_else(|| ErrorUnauthorized("Missing credentials")),
        )
    }
}

/// Verifies the `Authorization: Bearer` header when present.
///
/// A missing header passes through so public endpoints keep working; the
/// [`Identity`] extractor rejects such requests on protected ones. A
/// present but invalid token is refused outright.
pub async fn middleware<B>(
    req: actix_web::dev::ServiceRequest,
    next: Next<B>,
) -> Result<ServiceResponse<B>, Error>
where
    B: MessageBody + 'static,
{
    if let Some(auth_header) = req.headers().get(header::AUTHORIZATION) {
        let auth_header = auth_header
            .to_str()
            .map_err(|err| ErrorUnauthorized(err.to_string()))?;

        let bearer: Bearer = auth_header
            .parse()
            .map_err(|err: crate::model::auth::Error| ErrorUnauthorized(err.to_string()))?;

        let model: Data<Model> = req
            .app_data()
            .cloned()
            .ok_or_else(|| ErrorUnauthorized("Missing context"))?;

        let access = AccessToken::authenticate(model.db(), &bearer.0)
            .await
            .map_err(|err| ErrorUnauthorized(err.to_string()))?;

        if access.expires_at <= Utc::now() {
            AccessToken::revoke_key(model.db(), &access.key_id)
                .await
                .map_err(|err| ErrorUnauthorized(err.to_string()))?;
            return Err(ErrorUnauthorized("Token expired"));
        }

        req.extensions_mut().insert(Identity {
            user_id: access.user_id,
            key_id: access.key_id,
            expires_at: access.expires_at,
        });
    }

    next.call(req).await
}
