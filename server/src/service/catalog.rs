//! Class catalog endpoints
//!
//! Listing and fetching are public; writes require a teacher account and
//! are scoped to the classes that teacher owns. Admins may delete any
//! class.

use actix_web::error::{ErrorForbidden, ErrorInternalServerError, ErrorNotFound};
use actix_web::web::{Data, Json, Path, Query};
use actix_web::{HttpResponse, Result, delete, get, post, put};
use session::Role;

use crate::model::Model;
use crate::model::catalog::{Class, ClassFields, ClassFilter, ClassId};
use crate::service::session::Identity;

/// Resolves the caller's role, refusing callers whose account vanished
async fn caller_role(model: &Model, identity: &Identity) -> Result<Role> {
    identity
        .user_id
        .role(model.db())
        .await
        .map_err(|_| ErrorInternalServerError("Cannot resolve role"))?
        .ok_or_else(|| ErrorForbidden("Unknown account"))
}

#[get("/classes")]
pub(super) async fn list(model: Data<Model>, filter: Query<ClassFilter>) -> Result<Json<Vec<Class>>> {
    let classes = Class::list(model.db(), &filter)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot list classes"))?;
    Ok(Json(classes))
}

#[get("/classes/{id}")]
pub(super) async fn fetch(model: Data<Model>, id: Path<ClassId>) -> Result<Json<Class>> {
    let class = Class::fetch(model.db(), *id)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot fetch class"))?
        .ok_or_else(|| ErrorNotFound("No such class"))?;
    Ok(Json(class))
}

#[post("/classes")]
pub(super) async fn create(
    model: Data<Model>,
    identity: Identity,
    fields: Json<ClassFields>,
) -> Result<HttpResponse> {
    if caller_role(&model, &identity).await? != Role::Teacher {
        return Err(ErrorForbidden("Only teachers publish classes"));
    }

    let class = Class::create(model.db(), identity.user_id, fields.into_inner())
        .await
        .map_err(|_| ErrorInternalServerError("Cannot create class"))?;

    Ok(HttpResponse::Created().json(class))
}

#[put("/classes/{id}")]
pub(super) async fn update(
    model: Data<Model>,
    identity: Identity,
    id: Path<ClassId>,
    fields: Json<ClassFields>,
) -> Result<Json<Class>> {
    if caller_role(&model, &identity).await? != Role::Teacher {
        return Err(ErrorForbidden("Only teachers publish classes"));
    }

    let updated = Class::update(model.db(), *id, identity.user_id, fields.into_inner())
        .await
        .map_err(|_| ErrorInternalServerError("Cannot update class"))?;
    if !updated {
        return Err(ErrorNotFound("No such class of yours"));
    }

    let class = Class::fetch(model.db(), *id)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot fetch class"))?
        .ok_or_else(|| ErrorNotFound("No such class"))?;
    Ok(Json(class))
}

#[delete("/classes/{id}")]
pub(super) async fn remove(model: Data<Model>, identity: Identity, id: Path<ClassId>) -> Result<HttpResponse> {
    let owner = match caller_role(&model, &identity).await? {
        Role::Admin => None,
        Role::Teacher => Some(identity.user_id),
        Role::Student => return Err(ErrorForbidden("Only teachers publish classes")),
    };

    let deleted = Class::delete(model.db(), *id, owner)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot delete class"))?;
    if !deleted {
        return Err(ErrorNotFound("No such class of yours"));
    }

    Ok(HttpResponse::NoContent().finish())
}
