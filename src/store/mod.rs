//! Data-access boundary of the promotion engine.
//!
//! The engine reads the class directory, the roster and the rule tables, and
//! writes exactly one thing: a student's class. Everything persisted lives
//! behind [`SchoolStore`].

mod http;
pub mod workspace;

pub use http::{HttpStore, HttpStoreConfig};
pub use workspace::WorkspaceStore;

use crate::model::{ClassRef, PromotionRules, Student, StudentUpdateResult};
use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server error: HTTP {status} - {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response shape: {0}")]
    Decode(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid update: {0}")]
    Invalid(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("invalid base URL: {0}")]
    BadUrl(String),

    #[error("request timed out after {0}ms")]
    Timeout(u64),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Decode(e.to_string())
    }
}

#[async_trait]
pub trait SchoolStore: Send + Sync {
    /// Short label reported by `health`.
    fn kind(&self) -> &'static str;

    async fn get_classes(&self) -> Result<Vec<ClassRef>, StoreError>;

    async fn get_students(&self) -> Result<Vec<Student>, StoreError>;

    async fn get_promotion_rules(&self) -> Result<PromotionRules, StoreError>;

    async fn update_student_class(
        &self,
        student_id: &str,
        class_id: &str,
    ) -> Result<StudentUpdateResult, StoreError>;
}
