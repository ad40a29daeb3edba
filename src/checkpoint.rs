use anyhow::Context;
use chrono::Utc;

use crate::{chat::Msg, data::Storage};

/// Persisted conversation history, keyed by thread id. Built explicitly at
/// startup and handed to the orchestrator; shares the storage pool.
#[derive(Clone)]
pub struct Checkpoints {
    pool: sqlx::Pool<sqlx::Sqlite>,
}

impl Checkpoints {
    pub fn new(storage: &Storage) -> Self {
        Self {
            pool: storage.pool(),
        }
    }

    pub fn thread_for_user(user_id: i64) -> String {
        format!("thread-{user_id}")
    }

    pub async fn load(&self, thread_id: &str) -> anyhow::Result<Vec<Msg>> {
        let state: Option<(String,)> =
            sqlx::query_as("SELECT state FROM checkpoints WHERE thread_id = ?")
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await?;
        match state {
            None => Ok(Vec::new()),
            Some((state,)) => serde_json::from_str(&state)
                .context("Decoding checkpoint state"),
        }
    }

    /// Read-modify-write. Concurrent appends on one thread id are
    /// last-write-wins; callers are not guarded against interleaving.
    pub async fn append(
        &self,
        thread_id: &str,
        message: Msg,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let state: Option<(String,)> =
            sqlx::query_as("SELECT state FROM checkpoints WHERE thread_id = ?")
                .bind(thread_id)
                .fetch_optional(&mut *tx)
                .await?;
        let mut messages: Vec<Msg> = match state {
            None => Vec::new(),
            Some((state,)) => serde_json::from_str(&state)
                .context("Decoding checkpoint state")?,
        };
        messages.push(message);
        let state = serde_json::to_string(&messages)?;
        sqlx::query(
            "INSERT INTO checkpoints (thread_id, state, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT (thread_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at",
        )
        .bind(thread_id)
        .bind(&state)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn clear(&self, thread_id: &str) -> anyhow::Result<bool> {
        let result =
            sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?")
                .bind(thread_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }
}
