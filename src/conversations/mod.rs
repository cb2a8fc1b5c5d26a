mod handlers;
mod id;
mod registry;

use axum::{routing::{get, post}, Router};

use crate::AppState;

pub use id::IdScheme;
pub use registry::{Conversation, Registry};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/create", post(handlers::create))
        .route("/join", post(handlers::join))
        .route("/leave", post(handlers::leave))
        .route("/list", get(handlers::list))
        .route("/conv", get(handlers::conversation))
        .route("/rename", post(handlers::rename))
}
