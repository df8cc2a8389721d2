//! Shopping cart endpoints

use actix_web::error::{ErrorInternalServerError, ErrorNotFound};
use actix_web::web::{Data, Json, Path};
use actix_web::{Result, delete, get, post};
use serde::Deserialize;

use crate::model::Model;
use crate::model::cart::Cart;
use crate::model::catalog::ClassId;
use crate::service::session::Identity;

#[derive(Debug, Deserialize)]
struct AddItem {
    class_id: ClassId,
    #[serde(default = "AddItem::default_quantity")]
    quantity: u32,
}

impl AddItem {
    fn default_quantity() -> u32 {
        1
    }
}

#[get("/cart")]
pub(super) async fn fetch(model: Data<Model>, identity: Identity) -> Result<Json<Cart>> {
    let cart = Cart::fetch(model.db(), identity.user_id)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot fetch cart"))?;
    Ok(Json(cart))
}

/// Adds a class to the cart, accumulating quantity on repeats
#[post("/cart/items")]
pub(super) async fn add(model: Data<Model>, identity: Identity, item: Json<AddItem>) -> Result<Json<Cart>> {
    let added = Cart::add(model.db(), identity.user_id, item.class_id, item.quantity)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot update cart"))?;
    if !added {
        return Err(ErrorNotFound("No such class"));
    }

    let cart = Cart::fetch(model.db(), identity.user_id)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot fetch cart"))?;
    Ok(Json(cart))
}

#[delete("/cart/items/{class_id}")]
pub(super) async fn remove(
    model: Data<Model>,
    identity: Identity,
    class_id: Path<ClassId>,
) -> Result<Json<Cart>> {
    Cart::remove(model.db(), identity.user_id, *class_id)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot update cart"))?;

    let cart = Cart::fetch(model.db(), identity.user_id)
        .await
        .map_err(|_| ErrorInternalServerError("Cannot fetch cart"))?;
    Ok(Json(cart))
}
