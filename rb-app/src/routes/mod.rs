pub mod health;
pub mod whatsapp;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(whatsapp::router())
}
