use crate::errors::{Result, StreamingError};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Resolves a logical camera id to its upstream RTSP URL. The gateway only
/// ever issues this single lookup; anything richer lives upstream.
#[async_trait]
pub trait CameraRegistry: Send + Sync {
    async fn resolve_url(&self, camera_id: &str) -> Result<String>;
}

/// Camera registry backed by the central Postgres camera table.
#[derive(Clone)]
pub struct PgCameraRegistry {
    pool: PgPool,
}

impl PgCameraRegistry {
    /// Connects lazily: the pool is created immediately, connections are
    /// opened on first query.
    pub fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect_lazy(database_url)
            .map_err(|e| StreamingError::CameraRegistryError {
                message: format!("Failed to create database pool: {}", e),
            })?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CameraRegistry for PgCameraRegistry {
    async fn resolve_url(&self, camera_id: &str) -> Result<String> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT streaming1_adres FROM m_fa_cctv WHERE cctv_id = $1")
                .bind(camera_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StreamingError::CameraRegistryError {
                    message: format!("Camera lookup failed: {}", e),
                })?;

        match row {
            Some((url,)) if !url.is_empty() => Ok(url),
            _ => Err(StreamingError::CameraNotFound {
                camera_id: camera_id.to_string(),
            }),
        }
    }
}
