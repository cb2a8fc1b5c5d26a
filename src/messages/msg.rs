use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use uuid::Uuid;

use crate::{bus::user_topic, AppResult, AppState};

pub const MAX_CONTENT_CHARS: usize = 650;

/// Wire and storage form of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub uuid: String,
    pub content: String,
    pub user_id: i64,
    pub conv_id: String,
    #[serde(default)]
    pub time: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    TooLong,
    NoConversation,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Ingested {
    Delivered { message: Message, recipients: usize },
    Dropped(DropReason),
}

pub fn parse(raw: &[u8]) -> Result<Message, DropReason> {
    let msg: Message = serde_json::from_slice(raw).map_err(|_| DropReason::Malformed)?;
    if msg.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(DropReason::TooLong);
    }
    if msg.conv_id.is_empty() {
        return Err(DropReason::NoConversation);
    }
    Ok(msg)
}

impl Message {
    /// Overwrites the client's time with the server's and fills in a missing id.
    pub fn stamp(&mut self, at: OffsetDateTime) -> AppResult<()> {
        self.time = at.format(&Rfc3339).map_err(anyhow::Error::from)?;
        if self.uuid.is_empty() {
            self.uuid = Uuid::now_v7().to_string();
        }
        Ok(())
    }
}

/// Validate, stamp, persist and fan out one inbound frame.
///
/// Bad frames are counted and dropped, never reported to the sender. A store
/// failure is returned and the message is not published.
pub async fn ingest(state: &AppState, raw: &[u8]) -> AppResult<Ingested> {
    let mut msg = match parse(raw) {
        Ok(msg) => msg,
        Err(reason) => {
            state.metrics.frames_dropped.inc();
            tracing::info!(?reason, len = raw.len(), "dropping inbound frame");
            return Ok(Ingested::Dropped(reason));
        }
    };

    let at = OffsetDateTime::now_utc();
    msg.stamp(at)?;
    let body = serde_json::to_string(&msg)?;

    state.store.append(&msg.conv_id, at, &body).await?;

    let members = state.registry.members_of(&msg.conv_id).await?;
    let payload: crate::bus::Payload = body.into();
    let mut recipients = 0;
    for member in &members {
        recipients += state.bus.publish(&user_topic(*member), payload.clone());
    }
    state.metrics.messages_ingested.inc();
    state.metrics.publishes.inc_by(members.len() as u64);

    tracing::debug!(conv_id = %msg.conv_id, user_id = msg.user_id, members = members.len(), recipients, "message relayed");
    Ok(Ingested::Delivered { message: msg, recipients })
}
