use std::collections::BTreeSet;

use serde::Serialize;
use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::{AppError, AppResult};

use super::IdScheme;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub members: Vec<i64>,
    pub name: Option<String>,
}

/// Users <-> conversations, kept in both directions.
///
/// Every mutation touching both directions runs in one transaction, so a user is
/// in `conversation_members` for a conversation iff that conversation is in the
/// user's `user_conversations` map.
#[derive(Clone)]
pub struct Registry {
    db_pool: SqlitePool,
    scheme: IdScheme,
}

impl Registry {
    pub fn new(db_pool: SqlitePool, scheme: IdScheme) -> Self {
        Self { db_pool, scheme }
    }

    pub async fn create(&self, name: &str, members: &[i64]) -> AppResult<String> {
        let members: BTreeSet<i64> = members.iter().copied().collect();
        if members.len() < 2 {
            return Err(AppError::invalid("At least two members are required"));
        }
        if name.is_empty() {
            return Err(AppError::invalid("Conversation name is required"));
        }

        let id = match self.scheme {
            IdScheme::Opaque => IdScheme::opaque_id(),
            IdScheme::Pairwise => {
                let pair: Vec<i64> = members.iter().copied().collect();
                let &[a, b] = pair.as_slice() else {
                    return Err(AppError::invalid("Pairwise conversations take exactly two members"));
                };
                IdScheme::pair_id(a, b)
            }
        };

        let mut tx = self.db_pool.begin().await?;
        sqlx::query("INSERT INTO conversations (id,name) VALUES (?,?) ON CONFLICT(id) DO UPDATE SET name=excluded.name")
            .bind(&id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        for &member in &members {
            insert_member(&mut tx, &id, member).await?;
        }
        tx.commit().await?;

        tracing::info!(conv_id = %id, members = members.len(), "conversation created");
        Ok(id)
    }

    /// Two-party create. Always keyed by the pair, whatever the configured scheme,
    /// so creating the same pair twice returns the same id.
    pub async fn create_pair(&self, from: i64, to: i64) -> AppResult<String> {
        if from == to {
            return Err(AppError::invalid("A conversation needs two distinct members"));
        }

        let id = IdScheme::pair_id(from, to);
        let mut tx = self.db_pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO conversations (id,name) VALUES (?,NULL)")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        insert_member(&mut tx, &id, from).await?;
        insert_member(&mut tx, &id, to).await?;
        tx.commit().await?;

        tracing::info!(conv_id = %id, from, to, "pair conversation ready");
        Ok(id)
    }

    pub async fn join(&self, conv_id: &str, user_id: i64) -> AppResult<()> {
        let mut tx = self.db_pool.begin().await?;
        ensure_exists(&mut tx, conv_id).await?;
        insert_member(&mut tx, conv_id, user_id).await?;
        tx.commit().await?;

        tracing::debug!(conv_id, user_id, "joined");
        Ok(())
    }

    pub async fn leave(&self, conv_id: &str, user_id: i64) -> AppResult<()> {
        let mut tx = self.db_pool.begin().await?;
        ensure_exists(&mut tx, conv_id).await?;
        sqlx::query("DELETE FROM conversation_members WHERE conv_id=? AND user_id=?")
            .bind(conv_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM user_conversations WHERE user_id=? AND conv_id=?")
            .bind(user_id)
            .bind(conv_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::debug!(conv_id, user_id, "left");
        Ok(())
    }

    pub async fn rename(&self, conv_id: &str, new_name: &str) -> AppResult<()> {
        if new_name.is_empty() {
            return Err(AppError::invalid("newName must not be empty"));
        }

        // a conversation with no members left cannot be renamed
        let mut tx = self.db_pool.begin().await?;
        let (has_members,): (i64,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM conversation_members WHERE conv_id=?)")
                .bind(conv_id)
                .fetch_one(&mut *tx)
                .await?;
        if has_members == 0 {
            return Err(AppError::NotFound("Conversation not found".to_owned()));
        }
        sqlx::query("UPDATE conversations SET name=? WHERE id=?")
            .bind(new_name)
            .bind(conv_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_by_user(&self, user_id: i64) -> AppResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT conv_id FROM user_conversations WHERE user_id=? ORDER BY conv_id")
                .bind(user_id)
                .fetch_all(&self.db_pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn members_of(&self, conv_id: &str) -> AppResult<Vec<i64>> {
        let rows: Vec<(i64,)> =
            sqlx::query_as("SELECT user_id FROM conversation_members WHERE conv_id=? ORDER BY user_id")
                .bind(conv_id)
                .fetch_all(&self.db_pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    /// Display name; `None` for unknown or unnamed conversations.
    pub async fn metadata(&self, conv_id: &str) -> AppResult<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as("SELECT name FROM conversations WHERE id=?")
            .bind(conv_id)
            .fetch_optional(&self.db_pool)
            .await?;
        Ok(row.and_then(|(name,)| name))
    }

    pub async fn conversation(&self, conv_id: &str) -> AppResult<Conversation> {
        let Some((name,)): Option<(Option<String>,)> =
            sqlx::query_as("SELECT name FROM conversations WHERE id=?")
                .bind(conv_id)
                .fetch_optional(&self.db_pool)
                .await?
        else {
            return Err(AppError::NotFound("Conversation not found".to_owned()));
        };

        Ok(Conversation {
            id: conv_id.to_owned(),
            members: self.members_of(conv_id).await?,
            name,
        })
    }
}

async fn ensure_exists(tx: &mut Transaction<'_, Sqlite>, conv_id: &str) -> AppResult<()> {
    let found: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversations WHERE id=?")
        .bind(conv_id)
        .fetch_optional(&mut **tx)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(AppError::NotFound("Conversation not found".to_owned())),
    }
}

async fn insert_member(tx: &mut Transaction<'_, Sqlite>, conv_id: &str, user_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT OR IGNORE INTO conversation_members (conv_id,user_id) VALUES (?,?)")
        .bind(conv_id)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT OR IGNORE INTO user_conversations (user_id,conv_id,marker) VALUES (?,?,1)")
        .bind(user_id)
        .bind(conv_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
