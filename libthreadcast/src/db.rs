//! Document store for threads, media, account groups and media jobs
//!
//! Each record is a JSON document; the columns needed for lookups (state,
//! schedule, timestamps) are kept alongside it.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqlitePool;
use std::path::Path;

use crate::error::{DbError, Result, ThreadcastError};
use crate::types::{
    AccountGroup, MediaJobState, MediaUploadJob, PostThread, PostThreadItem, SocialPlatform,
    ThreadState, UploadedMedia,
};

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

fn decode<T: DeserializeOwned>(document: &str) -> Result<T> {
    Ok(serde_json::from_str(document).map_err(DbError::DocumentError)?)
}

fn encode<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value).map_err(DbError::DocumentError)?)
}

/// JSON path of the native id a platform assigns to a thread item
fn native_id_path(platform: SocialPlatform) -> &'static str {
    match platform {
        SocialPlatform::Twitter => "$.twitter_id",
        SocialPlatform::Bluesky => "$.bluesky_this.uri",
        SocialPlatform::Mastodon => "$.mastodon_id",
        SocialPlatform::Threads => "$.threads_id",
    }
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // mode=rwc creates the file on first use
        let db_url = format!("sqlite://{}?mode=rwc", expanded_path.replace('\\', "/"));
        let pool = SqlitePool::connect(&db_url)
            .await
            .map_err(DbError::SqlxError)?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and run migrations on it
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;
        Ok(Self { pool })
    }

    // ------------------------------------------------------------------
    // Threads
    // ------------------------------------------------------------------

    pub async fn insert_thread(&self, thread: &PostThread) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO threads (id, account_group_id, state, scheduled_at, updated_at, document)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&thread.id)
        .bind(&thread.account_group_id)
        .bind(thread.state.as_str())
        .bind(thread.scheduled_at.timestamp())
        .bind(Utc::now().timestamp())
        .bind(encode(thread)?)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<PostThread>> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT document FROM threads WHERE id = ?")
                .bind(thread_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        document.as_deref().map(decode).transpose()
    }

    /// All threads in `state`, earliest scheduled first
    pub async fn find_threads_by_state(&self, state: ThreadState) -> Result<Vec<PostThread>> {
        let documents: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT document FROM threads
            WHERE state = ?
            ORDER BY scheduled_at ASC, id ASC
            "#,
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        documents.iter().map(|d| decode(d)).collect()
    }

    /// Overwrite a stored thread with `thread`
    pub async fn replace_thread(&self, thread: &PostThread) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE threads
            SET account_group_id = ?, state = ?, scheduled_at = ?, updated_at = ?, document = ?
            WHERE id = ?
            "#,
        )
        .bind(&thread.account_group_id)
        .bind(thread.state.as_str())
        .bind(thread.scheduled_at.timestamp())
        .bind(Utc::now().timestamp())
        .bind(encode(thread)?)
        .bind(&thread.id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(ThreadcastError::NotFound(format!("thread {}", thread.id)));
        }
        Ok(())
    }

    /// Find a previously published item by the id `platform` gave it
    pub async fn find_item_by_native_id(
        &self,
        platform: SocialPlatform,
        native_id: &str,
    ) -> Result<Option<PostThreadItem>> {
        let item: Option<String> = sqlx::query_scalar(
            r#"
            SELECT json_each.value
            FROM threads, json_each(threads.document, '$.items')
            WHERE json_extract(json_each.value, ?) = ?
            LIMIT 1
            "#,
        )
        .bind(native_id_path(platform))
        .bind(native_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        item.as_deref().map(decode).transpose()
    }

    // ------------------------------------------------------------------
    // Account groups
    // ------------------------------------------------------------------

    pub async fn insert_account_group(&self, group: &AccountGroup) -> Result<()> {
        sqlx::query("INSERT INTO account_groups (id, document) VALUES (?, ?)")
            .bind(&group.id)
            .bind(encode(group)?)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_account_group(&self, group_id: &str) -> Result<Option<AccountGroup>> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT document FROM account_groups WHERE id = ?")
                .bind(group_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        document.as_deref().map(decode).transpose()
    }

    // ------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------

    pub async fn insert_media(&self, media: &UploadedMedia) -> Result<()> {
        sqlx::query("INSERT INTO media (id, document) VALUES (?, ?)")
            .bind(&media.id)
            .bind(encode(media)?)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_media(&self, media_id: &str) -> Result<Option<UploadedMedia>> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT document FROM media WHERE id = ?")
                .bind(media_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        document.as_deref().map(decode).transpose()
    }

    // ------------------------------------------------------------------
    // Media upload jobs
    // ------------------------------------------------------------------

    pub async fn insert_media_job(&self, job: &MediaUploadJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO media_jobs (id, state, created_at, document) VALUES (?, ?, ?, ?)",
        )
        .bind(&job.id)
        .bind(job.state.as_str())
        .bind(job.created_at.timestamp())
        .bind(encode(job)?)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;
        Ok(())
    }

    pub async fn get_media_job(&self, job_id: &str) -> Result<Option<MediaUploadJob>> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT document FROM media_jobs WHERE id = ?")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(DbError::SqlxError)?;

        document.as_deref().map(decode).transpose()
    }

    pub async fn find_media_jobs_by_state(
        &self,
        state: MediaJobState,
    ) -> Result<Vec<MediaUploadJob>> {
        let documents: Vec<String> = sqlx::query_scalar(
            "SELECT document FROM media_jobs WHERE state = ? ORDER BY created_at ASC",
        )
        .bind(state.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        documents.iter().map(|d| decode(d)).collect()
    }

    pub async fn replace_media_job(&self, job: &MediaUploadJob) -> Result<()> {
        let result = sqlx::query("UPDATE media_jobs SET state = ?, document = ? WHERE id = ?")
            .bind(job.state.as_str())
            .bind(encode(job)?)
            .bind(&job.id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        if result.rows_affected() == 0 {
            return Err(ThreadcastError::NotFound(format!("media job {}", job.id)));
        }
        Ok(())
    }

    /// Delete succeeded or failed jobs created before `older_than`.
    ///
    /// Returns the number of jobs removed.
    pub async fn delete_finished_media_jobs(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM media_jobs
            WHERE state IN ('success', 'failed') AND created_at < ?
            "#,
        )
        .bind(older_than.timestamp())
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}
