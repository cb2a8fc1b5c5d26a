use axum::{
    debug_handler,
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{parse_user_id, AppError, AppResult, Required};

use super::{Conversation, Registry};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum CreateRequest {
    Named {
        #[serde(default)]
        name: String,
        members: Vec<i64>,
    },
    Pair {
        from: i64,
        to: i64,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MembershipQuery {
    user_id: Option<String>,
    conversation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UserQuery {
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ConvQuery {
    conv_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RenameRequest {
    #[serde(default)]
    conversation_id: String,
    #[serde(default)]
    new_name: String,
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| {
            tracing::debug!(error = %rejection, "rejected request body");
            AppError::invalid("Invalid input")
        })
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn create(
    State(registry): State<Registry>,
    payload: Result<Json<CreateRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let id = match body(payload)? {
        CreateRequest::Named { name, members } => registry.create(&name, &members).await?,
        CreateRequest::Pair { from, to } => registry.create_pair(from, to).await?,
    };
    Ok(Json(json!({ "id": id })))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn join(
    State(registry): State<Registry>,
    Query(query): Query<MembershipQuery>,
) -> AppResult<Json<Value>> {
    let (conv_id, user_id) = membership(query)?;
    registry.join(&conv_id, user_id).await?;
    Ok(Json(json!({ "message": "joined conversation successfully" })))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn leave(
    State(registry): State<Registry>,
    Query(query): Query<MembershipQuery>,
) -> AppResult<Json<Value>> {
    let (conv_id, user_id) = membership(query)?;
    registry.leave(&conv_id, user_id).await?;
    Ok(Json(json!({ "message": "left conversation successfully" })))
}

fn membership(MembershipQuery { user_id, conversation_id }: MembershipQuery) -> AppResult<(String, i64)> {
    let user_id = parse_user_id(&user_id.required("userId")?)?;
    let conv_id = conversation_id.required("conversationId")?;
    Ok((conv_id, user_id))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn list(
    State(registry): State<Registry>,
    Query(UserQuery { user_id }): Query<UserQuery>,
) -> AppResult<Json<Value>> {
    let user_id = parse_user_id(&user_id.required("userId")?)?;

    let mut convs: Vec<Conversation> = Vec::new();
    for conv_id in registry.list_by_user(user_id).await? {
        match registry.conversation(&conv_id).await {
            Ok(conv) => convs.push(conv),
            Err(err) => tracing::warn!(%conv_id, user_id, error = %err, "skipping unreadable conversation"),
        }
    }

    Ok(Json(json!({ "convs": convs })))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn conversation(
    State(registry): State<Registry>,
    Query(ConvQuery { conv_id }): Query<ConvQuery>,
) -> AppResult<Json<Conversation>> {
    let conv_id = conv_id.required("convId")?;
    Ok(Json(registry.conversation(&conv_id).await?))
}

#[debug_handler(state = crate::AppState)]
pub(crate) async fn rename(
    State(registry): State<Registry>,
    payload: Result<Json<RenameRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let RenameRequest { conversation_id, new_name } = body(payload)?;
    if conversation_id.is_empty() {
        return Err(AppError::MissingParameter("conversationId"));
    }
    if new_name.is_empty() {
        return Err(AppError::MissingParameter("newName"));
    }

    registry.rename(&conversation_id, &new_name).await?;
    Ok(Json(json!({ "message": "Conversation renamed successfully" })))
}
