use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::PromotionConfig;
use crate::session::{PromotionSession, SharedSession};
use crate::store::SchoolStore;
use rusqlite::Connection;
use serde::Deserialize;
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub db: Option<Arc<Mutex<Connection>>>,
    /// Backend the promotion engine reads from and writes to.
    pub store: Option<Arc<dyn SchoolStore>>,
    pub config: PromotionConfig,
    pub session: SharedSession,
    /// Background promotion runs; awaited before exit.
    pub tasks: Vec<JoinHandle<()>>,
}

impl AppState {
    pub fn new() -> Self {
        Self {
            workspace: None,
            db: None,
            store: None,
            config: PromotionConfig::default(),
            session: PromotionSession::shared(),
            tasks: Vec::new(),
        }
    }

    /// The workspace connection, if one is open.
    pub fn conn(&self) -> Option<MutexGuard<'_, Connection>> {
        self.db
            .as_ref()
            .map(|db| db.lock().unwrap_or_else(|p| p.into_inner()))
    }

    pub async fn drain_tasks(&mut self) {
        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "promotion task did not finish cleanly");
            }
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}
