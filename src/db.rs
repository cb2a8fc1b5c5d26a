use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

// conversations:        one row per conversation, never deleted
// conversation_members: conv_id -> user ids
// user_conversations:   user_id -> conv_id -> marker
// messages:             ordered by (ts_ms, seq)
// message_logs:         one retention deadline per conversation log
const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS conversations (
        id TEXT PRIMARY KEY NOT NULL,
        name TEXT
    )",
    "CREATE TABLE IF NOT EXISTS conversation_members (
        conv_id TEXT NOT NULL,
        user_id INTEGER NOT NULL,
        PRIMARY KEY (conv_id, user_id)
    )",
    "CREATE TABLE IF NOT EXISTS user_conversations (
        user_id INTEGER NOT NULL,
        conv_id TEXT NOT NULL,
        marker INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (user_id, conv_id)
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        conv_id TEXT NOT NULL,
        ts_ms INTEGER NOT NULL,
        body TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS messages_by_conv ON messages (conv_id, ts_ms, seq)",
    "CREATE TABLE IF NOT EXISTS message_logs (
        conv_id TEXT PRIMARY KEY NOT NULL,
        expires_at_ms INTEGER NOT NULL
    )",
];

pub async fn connect(database_url: &str, max_connections: u32) -> Result<SqlitePool, sqlx::Error> {
    let db_pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    init_schema(&db_pool).await?;
    Ok(db_pool)
}

pub async fn init_schema(db_pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(db_pool).await?;
    }
    Ok(())
}

/// Single-connection in-memory pool; every connection to `sqlite::memory:` is its own database.
#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    connect("sqlite::memory:", 1).await.unwrap()
}
