//! Persistence gateway.
//!
//! [`Catalog`] is the only mutation surface for relational state. Each
//! operation commits atomically or has no visible effect. Frame inserts run
//! in their own short transaction, so workers on the same video never wait on
//! each other beyond the foreign-key check on the parent row.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::domain::{frames, videos};
use crate::models::{Frame, NewFrame, Video};

const PG_FOREIGN_KEY_VIOLATION: &str = "23503";
const PG_UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("video {video_id} does not exist")]
    ForeignKey { video_id: i64 },

    #[error("frame {frame_index} of video {video_id} already exists")]
    DuplicateFrame { video_id: i64, frame_index: i32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait Catalog: Send + Sync {
    /// Register a video before upload; the id namespaces its storage keys.
    async fn create_video(&self, observation_post_name: &str) -> Result<i64, CatalogError>;

    async fn finalize_video(
        &self,
        video_id: i64,
        os_filepath: &str,
        frame_count: i32,
    ) -> Result<(), CatalogError>;

    /// Insert a metadata row and the frame referencing it, in one transaction.
    async fn create_frame_with_metadata(&self, frame: &NewFrame) -> Result<i64, CatalogError>;

    async fn list_video_paths(&self) -> Result<Vec<String>, CatalogError>;

    async fn list_incomplete_videos(&self) -> Result<Vec<i64>, CatalogError>;

    async fn get_video(&self, video_id: i64) -> Result<Option<Video>, CatalogError>;

    async fn list_frames(&self, video_id: i64) -> Result<Vec<Frame>, CatalogError>;

    async fn get_frame_by_index(
        &self,
        video_id: i64,
        frame_index: i32,
    ) -> Result<Option<Frame>, CatalogError>;

    async fn list_threat_frames(&self, video_id: i64) -> Result<Vec<Frame>, CatalogError>;
}

/// Postgres-backed catalog holding a connection pool
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn classify_insert_error(err: sqlx::Error, frame: &NewFrame) -> CatalogError {
    if let sqlx::Error::Database(db_err) = &err {
        match db_err.code().as_deref() {
            Some(PG_FOREIGN_KEY_VIOLATION) => {
                return CatalogError::ForeignKey {
                    video_id: frame.video_id,
                };
            }
            Some(PG_UNIQUE_VIOLATION) => {
                return CatalogError::DuplicateFrame {
                    video_id: frame.video_id,
                    frame_index: frame.frame_index,
                };
            }
            _ => {}
        }
    }
    CatalogError::Database(err)
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn create_video(&self, observation_post_name: &str) -> Result<i64, CatalogError> {
        Ok(videos::insert_video(&self.pool, observation_post_name).await?)
    }

    async fn finalize_video(
        &self,
        video_id: i64,
        os_filepath: &str,
        frame_count: i32,
    ) -> Result<(), CatalogError> {
        let updated = videos::finalize_video(&self.pool, video_id, os_filepath, frame_count).await?;
        if updated == 0 {
            return Err(CatalogError::NotFound {
                entity: "video",
                id: video_id,
            });
        }
        Ok(())
    }

    async fn create_frame_with_metadata(&self, frame: &NewFrame) -> Result<i64, CatalogError> {
        let mut tx = self.pool.begin().await?;

        let metadata_id = frames::insert_metadata(&mut *tx, &frame.analysis).await?;
        let frame_id = frames::insert_frame(
            &mut *tx,
            frame.video_id,
            metadata_id,
            &frame.os_filepath,
            frame.frame_index,
        )
        .await
        .map_err(|e| classify_insert_error(e, frame))?;

        tx.commit().await?;
        Ok(frame_id)
    }

    async fn list_video_paths(&self) -> Result<Vec<String>, CatalogError> {
        Ok(videos::list_video_paths(&self.pool).await?)
    }

    async fn list_incomplete_videos(&self) -> Result<Vec<i64>, CatalogError> {
        Ok(videos::list_incomplete_video_ids(&self.pool).await?)
    }

    async fn get_video(&self, video_id: i64) -> Result<Option<Video>, CatalogError> {
        Ok(videos::get_video(&self.pool, video_id).await?)
    }

    async fn list_frames(&self, video_id: i64) -> Result<Vec<Frame>, CatalogError> {
        Ok(frames::list_frames(&self.pool, video_id).await?)
    }

    async fn get_frame_by_index(
        &self,
        video_id: i64,
        frame_index: i32,
    ) -> Result<Option<Frame>, CatalogError> {
        Ok(frames::get_frame_by_index(&self.pool, video_id, frame_index).await?)
    }

    async fn list_threat_frames(&self, video_id: i64) -> Result<Vec<Frame>, CatalogError> {
        Ok(frames::list_threat_frames(&self.pool, video_id).await?)
    }
}
