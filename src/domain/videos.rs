//! Video domain - DB queries for videos
//!
//! All functions use the generic Executor pattern, allowing them to work with
//! both `&PgPool` (for standalone queries) and `&mut PgConnection` (for transactions).

use sqlx::{Executor, Postgres};

use crate::models::Video;

/// Insert a video with no storage path and no frame count yet
pub async fn insert_video<'e, E>(
    executor: E,
    observation_post_name: &str,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO videos (observation_post_name)
        VALUES ($1)
        RETURNING id
        "#,
    )
    .bind(observation_post_name)
    .fetch_one(executor)
    .await?;

    Ok(row.0)
}

/// Set storage path and final frame count. Returns rows affected.
pub async fn finalize_video<'e, E>(
    executor: E,
    video_id: i64,
    os_filepath: &str,
    frame_count: i32,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE videos
        SET "OS_filepath" = $1, frame_count = $2
        WHERE id = $3
        "#,
    )
    .bind(os_filepath)
    .bind(frame_count)
    .bind(video_id)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn get_video<'e, E>(executor: E, video_id: i64) -> Result<Option<Video>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, observation_post_name, "OS_filepath", frame_count
        FROM videos
        WHERE id = $1
        "#,
    )
    .bind(video_id)
    .fetch_optional(executor)
    .await
}

/// Storage paths of all finalized videos
pub async fn list_video_paths<'e, E>(executor: E) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        SELECT "OS_filepath" FROM videos
        WHERE "OS_filepath" IS NOT NULL
        ORDER BY id
        "#,
    )
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}

/// Ids of videos never finalized (still ingesting, or left by a failed run)
pub async fn list_incomplete_video_ids<'e, E>(executor: E) -> Result<Vec<i64>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT id FROM videos
        WHERE "OS_filepath" IS NULL
        ORDER BY id
        "#,
    )
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(|r| r.0).collect())
}
