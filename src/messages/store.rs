use std::time::Duration;

use sqlx::{Sqlite, SqlitePool, Transaction};
use time::OffsetDateTime;
use tokio::task::JoinHandle;

use super::msg::Message;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

pub(crate) fn unix_ms(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// One page of a conversation log. `rows_read` counts stored rows, including
/// any that could not be decoded into `msgs`.
#[derive(Debug)]
pub struct StoredPage {
    pub msgs: Vec<Message>,
    pub rows_read: usize,
}

/// Per-conversation message logs ordered by server time, each log carrying one
/// retention deadline that every append pushes back to the full duration.
#[derive(Clone)]
pub struct ConversationStore {
    db_pool: SqlitePool,
    retention: Duration,
}

impl ConversationStore {
    pub fn new(db_pool: SqlitePool, retention: Duration) -> Self {
        Self { db_pool, retention }
    }

    /// `body` is the canonical serialized form of a stamped message. A log
    /// whose deadline has already passed is dropped before the new message
    /// starts a fresh one.
    pub async fn append(&self, conv_id: &str, at: OffsetDateTime, body: &str) -> Result<(), sqlx::Error> {
        let ts_ms = unix_ms(at);
        let expires_at_ms = ts_ms.saturating_add(self.retention.as_millis() as i64);

        let mut tx = self.db_pool.begin().await?;
        if expire_log(&mut tx, conv_id, ts_ms).await? {
            tracing::info!(conv_id, "expired conversation log purged before append");
        }
        sqlx::query("INSERT INTO messages (conv_id,ts_ms,body) VALUES (?,?,?)")
            .bind(conv_id)
            .bind(ts_ms)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO message_logs (conv_id,expires_at_ms) VALUES (?,?)
             ON CONFLICT(conv_id) DO UPDATE SET expires_at_ms=excluded.expires_at_ms",
        )
        .bind(conv_id)
        .bind(expires_at_ms)
        .execute(&mut *tx)
        .await?;
        tx.commit().await
    }

    pub async fn range(&self, conv_id: &str, page: u32, page_size: u32) -> Result<Vec<Message>, sqlx::Error> {
        self.range_at(conv_id, page, page_size, OffsetDateTime::now_utc()).await
    }

    pub async fn range_at(
        &self,
        conv_id: &str,
        page: u32,
        page_size: u32,
        now: OffsetDateTime,
    ) -> Result<Vec<Message>, sqlx::Error> {
        Ok(self.page_at(conv_id, page, page_size, now).await?.msgs)
    }

    pub async fn page(&self, conv_id: &str, page: u32, page_size: u32) -> Result<StoredPage, sqlx::Error> {
        self.page_at(conv_id, page, page_size, OffsetDateTime::now_utc()).await
    }

    /// Messages `[(page-1)*page_size, page*page_size)` in server-time order.
    /// An expired log is purged in the same transaction and reads as empty.
    pub async fn page_at(
        &self,
        conv_id: &str,
        page: u32,
        page_size: u32,
        now: OffsetDateTime,
    ) -> Result<StoredPage, sqlx::Error> {
        let page = page.max(1) as i64;
        let page_size = page_size.max(1) as i64;
        let offset = (page - 1).saturating_mul(page_size);

        let mut tx = self.db_pool.begin().await?;
        let expired = expire_log(&mut tx, conv_id, unix_ms(now)).await?;
        let rows: Vec<(String,)> = if expired {
            Vec::new()
        } else {
            sqlx::query_as("SELECT body FROM messages WHERE conv_id=? ORDER BY ts_ms, seq LIMIT ? OFFSET ?")
                .bind(conv_id)
                .bind(page_size)
                .bind(offset)
                .fetch_all(&mut *tx)
                .await?
        };
        tx.commit().await?;

        if expired {
            tracing::info!(conv_id, "expired conversation log purged");
        }

        let rows_read = rows.len();
        let msgs = rows
            .into_iter()
            .filter_map(|(body,)| match serde_json::from_str(&body) {
                Ok(msg) => Some(msg),
                Err(err) => {
                    tracing::warn!(conv_id, error = %err, "skipping undecodable stored message");
                    None
                }
            })
            .collect();
        Ok(StoredPage { msgs, rows_read })
    }

    /// Drops every log whose deadline has passed. Returns the number of logs removed.
    pub async fn purge_expired(&self, now: OffsetDateTime) -> Result<u64, sqlx::Error> {
        let now_ms = unix_ms(now);

        let mut tx = self.db_pool.begin().await?;
        sqlx::query(
            "DELETE FROM messages WHERE conv_id IN (SELECT conv_id FROM message_logs WHERE expires_at_ms <= ?)",
        )
        .bind(now_ms)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM message_logs WHERE expires_at_ms <= ?")
            .bind(now_ms)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(removed)
    }

    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                match store.purge_expired(OffsetDateTime::now_utc()).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(removed, "retention sweep"),
                    Err(err) => tracing::error!(error = %err, "retention sweep failed"),
                }
            }
        })
    }
}

/// Removes the log of `conv_id` and its messages if its deadline is at or
/// before `now_ms`. The deadline is re-read inside `tx`, so a log refreshed by
/// a concurrent append is left alone.
async fn expire_log(tx: &mut Transaction<'_, Sqlite>, conv_id: &str, now_ms: i64) -> Result<bool, sqlx::Error> {
    sqlx::query(
        "DELETE FROM messages WHERE conv_id=?
         AND conv_id IN (SELECT conv_id FROM message_logs WHERE expires_at_ms <= ?)",
    )
    .bind(conv_id)
    .bind(now_ms)
    .execute(&mut **tx)
    .await?;
    let removed = sqlx::query("DELETE FROM message_logs WHERE conv_id=? AND expires_at_ms <= ?")
        .bind(conv_id)
        .bind(now_ms)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use crate::db;

    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn message(conv_id: &str, content: &str) -> Message {
        Message {
            uuid: content.to_owned(),
            content: content.to_owned(),
            user_id: 1,
            conv_id: conv_id.to_owned(),
            time: String::new(),
            kind: "text".to_owned(),
        }
    }

    async fn store_with(conv_id: &str, contents: &[&str], start: OffsetDateTime) -> ConversationStore {
        let store = ConversationStore::new(db::memory_pool().await, 30 * DAY);
        for (i, content) in contents.iter().enumerate() {
            let at = start + time::Duration::seconds(i as i64);
            let body = serde_json::to_string(&message(conv_id, content)).unwrap();
            store.append(conv_id, at, &body).await.unwrap();
        }
        store
    }

    fn contents(msgs: &[Message]) -> Vec<&str> {
        msgs.iter().map(|m| m.content.as_str()).collect()
    }

    #[tokio::test]
    async fn pages_slice_in_time_order() {
        let now = OffsetDateTime::now_utc();
        let store = store_with("c", &["a", "b", "c"], now).await;

        let first = store.range("c", 1, 2).await.unwrap();
        assert_eq!(contents(&first), ["a", "b"]);

        let second = store.range("c", 2, 2).await.unwrap();
        assert_eq!(contents(&second), ["c"]);

        assert!(store.range("c", 3, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn out_of_order_timestamps_sort_by_server_time() {
        let store = ConversationStore::new(db::memory_pool().await, DAY);
        let now = OffsetDateTime::now_utc();

        for (offset, content) in [(5, "late"), (1, "early"), (3, "middle")] {
            let body = serde_json::to_string(&message("c", content)).unwrap();
            store.append("c", now + time::Duration::seconds(offset), &body).await.unwrap();
        }

        let all = store.range("c", 1, 10).await.unwrap();
        assert_eq!(contents(&all), ["early", "middle", "late"]);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_arrival_order() {
        let store = ConversationStore::new(db::memory_pool().await, DAY);
        let now = OffsetDateTime::now_utc();

        for content in ["one", "two", "three"] {
            let body = serde_json::to_string(&message("c", content)).unwrap();
            store.append("c", now, &body).await.unwrap();
        }

        assert_eq!(contents(&store.range("c", 1, 10).await.unwrap()), ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn conversations_are_isolated() {
        let now = OffsetDateTime::now_utc();
        let store = store_with("x", &["for x"], now).await;
        assert!(store.range("y", 1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn whole_log_expires_after_retention() {
        let start = OffsetDateTime::now_utc() - time::Duration::days(40);
        let store = store_with("old", &["a", "b"], start).await;

        assert!(store.range("old", 1, 10).await.unwrap().is_empty());

        let (left,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages")
            .fetch_one(&store.db_pool)
            .await
            .unwrap();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn append_refreshes_retention_for_the_whole_log() {
        let start = OffsetDateTime::now_utc() - time::Duration::days(29);
        let store = store_with("busy", &["old"], start).await;

        let body = serde_json::to_string(&message("busy", "new")).unwrap();
        store.append("busy", OffsetDateTime::now_utc(), &body).await.unwrap();

        // 10 days on, the first message is 39 days old but the log is still live
        let later = OffsetDateTime::now_utc() + time::Duration::days(10);
        let msgs = store.range_at("busy", 1, 10, later).await.unwrap();
        assert_eq!(contents(&msgs), ["old", "new"]);
    }

    #[tokio::test]
    async fn append_after_expiry_starts_a_fresh_log() {
        let store = ConversationStore::new(db::memory_pool().await, DAY);
        let now = OffsetDateTime::now_utc();

        let body = serde_json::to_string(&message("c", "stale")).unwrap();
        store.append("c", now - time::Duration::days(2), &body).await.unwrap();
        let body = serde_json::to_string(&message("c", "fresh")).unwrap();
        store.append("c", now, &body).await.unwrap();

        assert_eq!(contents(&store.range("c", 1, 10).await.unwrap()), ["fresh"]);
    }

    #[tokio::test]
    async fn expiry_rechecks_the_current_deadline() {
        let store = ConversationStore::new(db::memory_pool().await, DAY);
        let now = OffsetDateTime::now_utc();
        let body = serde_json::to_string(&message("c", "live")).unwrap();
        store.append("c", now, &body).await.unwrap();

        // a purge decided on a stale deadline must not touch a refreshed log
        let mut tx = store.db_pool.begin().await.unwrap();
        assert!(!expire_log(&mut tx, "c", unix_ms(now)).await.unwrap());
        tx.commit().await.unwrap();
        assert_eq!(contents(&store.range_at("c", 1, 10, now).await.unwrap()), ["live"]);

        let mut tx = store.db_pool.begin().await.unwrap();
        assert!(expire_log(&mut tx, "c", unix_ms(now + time::Duration::days(2))).await.unwrap());
        tx.commit().await.unwrap();
        assert!(store.range_at("c", 1, 10, now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn page_counts_undecodable_rows() {
        let now = OffsetDateTime::now_utc();
        let store = store_with("c", &["ok"], now).await;
        sqlx::query("INSERT INTO messages (conv_id,ts_ms,body) VALUES ('c',?,'not json')")
            .bind(unix_ms(now) + 1)
            .execute(&store.db_pool)
            .await
            .unwrap();

        let page = store.page("c", 1, 2).await.unwrap();
        assert_eq!(contents(&page.msgs), ["ok"]);
        assert_eq!(page.rows_read, 2);
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_logs() {
        let store = ConversationStore::new(db::memory_pool().await, DAY);
        let now = OffsetDateTime::now_utc();

        let body = serde_json::to_string(&message("stale", "s")).unwrap();
        store.append("stale", now - time::Duration::days(2), &body).await.unwrap();
        let body = serde_json::to_string(&message("fresh", "f")).unwrap();
        store.append("fresh", now, &body).await.unwrap();

        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert_eq!(contents(&store.range_at("fresh", 1, 10, now).await.unwrap()), ["f"]);
        assert!(store.range_at("stale", 1, 10, now).await.unwrap().is_empty());
    }
}
