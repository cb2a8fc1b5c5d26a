mod history;
pub mod msg;
mod store;
mod ws;

use axum::{routing::get, Router};

use crate::AppState;

pub use msg::{ingest, DropReason, Ingested, Message, MAX_CONTENT_CHARS};
pub use store::{ConversationStore, StoredPage, DEFAULT_PAGE_SIZE};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::connect))
        .route("/history", get(history::history))
}
