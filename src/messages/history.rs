use axum::{debug_handler, extract::{Query, State}, Json};
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

use super::{msg::Message, store::DEFAULT_PAGE_SIZE, ConversationStore};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryQuery {
    conv_id: Option<String>,
    conversation_id: Option<String>,
    page: Option<String>,
    page_size: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HistoryPage {
    msgs: Vec<Message>,
    page: u32,
    page_size: u32,
    has_next_page: bool,
}

/// Positive integers only; anything else falls back to the default.
fn positive_or(raw: Option<&str>, default: u32) -> u32 {
    raw.and_then(|s| s.parse::<u32>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(default)
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn history(
    State(store): State<ConversationStore>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<HistoryPage>> {
    let conv_id = query
        .conv_id
        .or(query.conversation_id)
        .filter(|id| !id.is_empty())
        .ok_or(AppError::MissingParameter("convId"))?;

    let page = positive_or(query.page.as_deref(), 1);
    let page_size = positive_or(query.page_size.as_deref(), DEFAULT_PAGE_SIZE);

    let stored = store.page(&conv_id, page, page_size).await?;
    // a full page only suggests more may follow
    let has_next_page = stored.rows_read == page_size as usize;

    Ok(Json(HistoryPage { msgs: stored.msgs, page, page_size, has_next_page }))
}
