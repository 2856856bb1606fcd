use std::collections::HashSet;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::info;

use crate::db::to_millis;
use crate::error::StoreError;

/// Persisted operator controls per task (pause/resume).
pub struct ControlStore;

impl ControlStore {
    pub async fn set_paused(pool: &SqlitePool, task: &str, paused: bool) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO task_controls (task_name, paused, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (task_name) DO UPDATE SET paused = excluded.paused, updated_at = excluded.updated_at",
        )
        .bind(task)
        .bind(paused)
        .bind(to_millis(Utc::now()))
        .execute(pool)
        .await?;
        info!(task = %task, paused, "task control updated");
        Ok(())
    }

    pub async fn is_paused(pool: &SqlitePool, task: &str) -> Result<bool, StoreError> {
        let paused: Option<bool> =
            sqlx::query_scalar("SELECT paused FROM task_controls WHERE task_name = ?1")
                .bind(task)
                .fetch_optional(pool)
                .await?;
        Ok(paused.unwrap_or(false))
    }

    pub async fn paused(pool: &SqlitePool) -> Result<HashSet<String>, StoreError> {
        let names: Vec<String> =
            sqlx::query_scalar("SELECT task_name FROM task_controls WHERE paused = 1")
                .fetch_all(pool)
                .await?;
        Ok(names.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::in_memory;

    #[tokio::test]
    async fn pause_and_resume() {
        let pool = in_memory().await.unwrap();
        assert!(!ControlStore::is_paused(&pool, "harvest").await.unwrap());

        ControlStore::set_paused(&pool, "harvest", true).await.unwrap();
        assert!(ControlStore::is_paused(&pool, "harvest").await.unwrap());
        assert!(ControlStore::paused(&pool).await.unwrap().contains("harvest"));

        ControlStore::set_paused(&pool, "harvest", false).await.unwrap();
        assert!(ControlStore::paused(&pool).await.unwrap().is_empty());
    }
}
