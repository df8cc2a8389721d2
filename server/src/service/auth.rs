//! Account and credential endpoints

use actix_web::error::{ErrorConflict, ErrorInternalServerError, ErrorUnauthorized};
use actix_web::web::{Data, Json};
use actix_web::{HttpResponse, Result, delete, get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use session::{Role, UserProfile};

use crate::model::auth::{AccessToken, RefreshToken};
use crate::model::users::{self, CredentialError, NewUser};
use crate::model::{Model, users::UserId};
use crate::service::session::Identity;

#[derive(Debug, Deserialize)]
struct RegisterReq {
    name: String,
    email: String,
    role: Role,
    password: String,
}

#[derive(Debug, Deserialize)]
struct LoginReq {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct RefreshReq {
    refresh_token: String,
}

/// Everything a client needs to run a session
#[derive(Debug, Serialize)]
struct Credentials {
    user: UserProfile,
    access_token: String,
    refresh_token: RefreshToken,
    expires_at: DateTime<Utc>,
}

/// Issues a fresh access token around an already minted refresh token
async fn issue_credentials(
    model: &Model,
    user_id: UserId,
    refresh_token: RefreshToken,
) -> Result<Credentials> {
    let access = AccessToken::issue(model.db(), user_id, model.auth().access_ttl())
        .await
        .map_err(|_| ErrorInternalServerError("Cannot issue access token"))?;
    let user = user_id
        .profile(model.db())
        .await
        .map_err(|_| ErrorInternalServerError("Cannot load profile"))?
        .ok_or_else(|| ErrorUnauthorized("Unknown user"))?;

    Ok(Credentials {
        user,
        access_token: access.token,
        refresh_token,
        expires_at: access.expires_at,
    })
}

#[post("/auth/register")]
pub(super) async fn register(model: Data<Model>, req: Json<RegisterReq>) -> Result<HttpResponse> {
    let req = req.into_inner();
    let user_id = NewUser {
        name: req.name,
        email: req.email,
        role: req.role,
        password: req.password,
    }
    .create(model.db())
    .await
    .map_err(|err| match err.downcast_ref::<users::Error>() {
        Some(users::Error::EmailTaken) => ErrorConflict("Email already registered"),
        _ => ErrorInternalServerError("Cannot create account"),
    })?;

    let profile = user_id
        .profile(model.db())
        .await
        .map_err(|_| ErrorInternalServerError("Cannot load profile"))?
        .ok_or_else(|| ErrorInternalServerError("Account vanished"))?;

    Ok(HttpResponse::Created().json(profile))
}

/// Verifies credentials and opens a session.
///
/// Rejections carry a machine-readable `code` so clients can distinguish
/// a locked account from a wrong password without string matching.
#[post("/auth/login")]
pub(super) async fn login(model: Data<Model>, req: Json<LoginReq>) -> Result<HttpResponse> {
    // An address without a user/domain split never reaches the database
    if !req
        .email
        .split_once('@')
        .is_some_and(|(user, domain)| !user.is_empty() && domain.contains('.'))
    {
        return Ok(HttpResponse::Unauthorized().json(json!({
            "code": "malformed_email",
            "message": "Not a valid email address",
        })));
    }

    let verdict = users::verify_credentials(model.db(), model.auth(), &req.email, &req.password)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot verify credentials"))?;

    match verdict {
        Ok(user_id) => {
            let minted = RefreshToken::create(model.db(), user_id, model.auth().refresh_ttl())
                .await
                .map_err(|_| ErrorInternalServerError("Cannot issue refresh token"))?;
            let credentials = issue_credentials(&model, user_id, minted).await?;
            Ok(HttpResponse::Ok().json(credentials))
        }
        Err(rejection) => {
            let code = match &rejection {
                CredentialError::UnknownEmail => "unknown_email",
                CredentialError::WrongPassword => "wrong_password",
                CredentialError::Locked { .. } => "account_locked",
            };
            let mut body = json!({
                "code": code,
                "message": rejection.to_string(),
            });
            if let CredentialError::Locked { until } = rejection {
                body["locked_until"] = json!(until);
            }
            Ok(HttpResponse::Unauthorized().json(body))
        }
    }
}

/// Exchanges a refresh token for fresh credentials, rotating it
#[post("/auth/refresh")]
pub(super) async fn refresh(model: Data<Model>, req: Json<RefreshReq>) -> Result<HttpResponse> {
    let presented = RefreshToken::from(req.into_inner().refresh_token);
    let rotation = presented
        .rotate(model.db(), model.auth().refresh_ttl())
        .await;

    match rotation {
        Ok((replacement, user_id)) => {
            let credentials = issue_credentials(&model, user_id, replacement).await?;
            Ok(HttpResponse::Ok().json(credentials))
        }
        Err(_) => Ok(HttpResponse::Unauthorized().json(json!({
            "code": "invalid_refresh_token",
            "message": "Refresh token is invalid or expired",
        }))),
    }
}

/// Closes the session: the access key is dropped and every refresh token
/// of the user is revoked
#[delete("/auth/session")]
pub(super) async fn expire_session(model: Data<Model>, identity: Identity) -> Result<HttpResponse> {
    AccessToken::revoke_key(model.db(), &identity.key_id)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot close session"))?;
    RefreshToken::revoke_all(model.db(), identity.user_id)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot close session"))?;

    Ok(HttpResponse::NoContent().finish())
}

#[get("/auth/me")]
pub(super) async fn me(model: Data<Model>, identity: Identity) -> Result<Json<UserProfile>> {
    let profile = identity
        .user_id
        .profile(model.db())
        .await
        .map_err(|_| ErrorInternalServerError("Cannot load profile"))?
        .ok_or_else(|| ErrorUnauthorized("Unknown user"))?;

    Ok(Json(profile))
}
