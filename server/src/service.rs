//! Utilities for services building

use std::sync::Arc;

use actix_web::middleware;
use actix_web::web::{self, Data, ServiceConfig};


mod auth;
mod cart;
mod catalog;
mod payments;
mod session;

use crate::model::Model;
use crate::model::payments::PaymentGateway;

/// Returns configuration function for the ActixWeb services
pub async fn configure(
    model: Model,
    gateway: Arc<dyn PaymentGateway>,
) -> color_eyre::Result<impl Fn(&mut web::ServiceConfig) + Clone> {
    let cfg = move |cfg: &mut ServiceConfig| {
        let api = web::scope("/api")
            .wrap(middleware::from_fn(session::middleware))
            .service(auth::register)
            .service(auth::login)
            .service(auth::refresh)
            .service(auth::expire_session)
            .service(auth::me)
            .service(catalog::list)
            .service(catalog::fetch)
            .service(catalog::create)
            .service(catalog::update)
            .service(catalog::remove)
            .service(cart::fetch)
            .service(cart::add)
            .service(cart::remove)
            .service(payments::create_preference)
            .service(payments::webhook);

        cfg.app_data(Data::new(model.clone()))
            .app_data(Data::from(gateway.clone()))
            .service(api);
    };

    Ok(cfg)
}
