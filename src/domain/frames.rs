//! Frame domain - DB queries for frames and their metadata

use sqlx::{Executor, Postgres};

use crate::models::{Frame, FrameAnalysis};

pub async fn insert_metadata<'e, E>(
    executor: E,
    analysis: &FrameAnalysis,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO frame_metadata (is_threat, fov, azimuth, elevation)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(analysis.is_threat)
    .bind(analysis.fov)
    .bind(analysis.azimuth)
    .bind(analysis.elevation)
    .fetch_one(executor)
    .await?;

    Ok(row.0)
}

pub async fn insert_frame<'e, E>(
    executor: E,
    video_id: i64,
    metadata_id: i64,
    os_filepath: &str,
    frame_index: i32,
) -> Result<i64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO frames (video_id, metadata_id, "OS_filepath", frame_index)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(video_id)
    .bind(metadata_id)
    .bind(os_filepath)
    .bind(frame_index)
    .fetch_one(executor)
    .await?;

    Ok(row.0)
}

pub async fn list_frames<'e, E>(executor: E, video_id: i64) -> Result<Vec<Frame>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, video_id, metadata_id, "OS_filepath", frame_index
        FROM frames
        WHERE video_id = $1
        ORDER BY frame_index
        "#,
    )
    .bind(video_id)
    .fetch_all(executor)
    .await
}

pub async fn get_frame_by_index<'e, E>(
    executor: E,
    video_id: i64,
    frame_index: i32,
) -> Result<Option<Frame>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, video_id, metadata_id, "OS_filepath", frame_index
        FROM frames
        WHERE video_id = $1 AND frame_index = $2
        "#,
    )
    .bind(video_id)
    .bind(frame_index)
    .fetch_optional(executor)
    .await
}

/// Frames of a video whose metadata is flagged as a threat
pub async fn list_threat_frames<'e, E>(
    executor: E,
    video_id: i64,
) -> Result<Vec<Frame>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT f.id, f.video_id, f.metadata_id, f."OS_filepath", f.frame_index
        FROM frames f
        JOIN frame_metadata m ON m.id = f.metadata_id
        WHERE f.video_id = $1 AND m.is_threat
        ORDER BY f.frame_index
        "#,
    )
    .bind(video_id)
    .fetch_all(executor)
    .await
}
