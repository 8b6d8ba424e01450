use async_trait::async_trait;
use sqlx::{FromRow, PgPool};
use tollgate_application::TaskSource;
use tollgate_core::{AppError, AppResult};
use tollgate_domain::{Task, TaskId};

/// PostgreSQL-backed source of task candidates.
///
/// The query receives the platform as `$1` and the row limit as `$2` and must
/// return `id TEXT` and `payload BYTEA` columns, oldest candidates first.
#[derive(Clone)]
pub struct PostgresTaskSource {
    pool: PgPool,
    query: String,
    platform: String,
}

impl PostgresTaskSource {
    /// Creates a task source running `query` for `platform`.
    #[must_use]
    pub fn new(pool: PgPool, query: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            pool,
            query: query.into(),
            platform: platform.into(),
        }
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: String,
    payload: Vec<u8>,
}

#[async_trait]
impl TaskSource for PostgresTaskSource {
    async fn fetch_candidates(&self, limit: usize) -> AppResult<Vec<Task>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, TaskRow>(self.query.as_str())
            .bind(self.platform.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| {
                AppError::Unavailable(format!(
                    "failed to fetch task candidates for '{}': {error}",
                    self.platform
                ))
            })?;

        rows.into_iter()
            .map(|row| Ok(Task::new(TaskId::new(row.id)?, row.payload)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use sqlx::PgPool;
    use sqlx::postgres::PgPoolOptions;
    use tollgate_application::TaskSource;

    use super::PostgresTaskSource;

    async fn test_pool() -> Option<PgPool> {
        let Ok(database_url) = std::env::var("DATABASE_URL") else {
            return None;
        };

        match PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url.as_str())
            .await
        {
            Ok(pool) => Some(pool),
            Err(error) => panic!("failed to connect to DATABASE_URL in test: {error}"),
        }
    }

    #[tokio::test]
    async fn fetches_the_oldest_candidates_for_one_platform() {
        let Some(pool) = test_pool().await else {
            return;
        };

        let create = sqlx::query(
            r#"
            CREATE TEMPORARY TABLE pending_matches (
                match_id TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                details BYTEA NOT NULL,
                seen_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await;
        assert!(create.is_ok());

        for (match_id, platform, seen_at) in [
            ("EUW1_3", "EUW1", 3_i64),
            ("EUW1_1", "EUW1", 1),
            ("NA1_1", "NA1", 0),
            ("EUW1_2", "EUW1", 2),
        ] {
            let insert = sqlx::query(
                "INSERT INTO pending_matches (match_id, platform, details, seen_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(match_id)
            .bind(platform)
            .bind(match_id.as_bytes().to_vec())
            .bind(seen_at)
            .execute(&pool)
            .await;
            assert!(insert.is_ok());
        }

        let source = PostgresTaskSource::new(
            pool,
            "SELECT match_id AS id, details AS payload FROM pending_matches \
             WHERE platform = $1 ORDER BY seen_at LIMIT $2",
            "EUW1",
        );
        let tasks = source.fetch_candidates(2).await.unwrap_or_default();

        let ids = tasks
            .iter()
            .map(|task| task.id().as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["EUW1_1", "EUW1_2"]);
        assert_eq!(tasks[0].payload(), b"EUW1_1");
    }
}
