//! Batch promotion executor.
//!
//! One update per student. Dispatches are phase-shifted by a fixed stagger so
//! the backend does not see a burst, but nothing caps concurrency: every
//! command ends up in flight and every one is awaited. A failing update never
//! stops its siblings and there are no retries.

use crate::config::PromotionConfig;
use crate::model::{BatchResult, PromotionCommand, PromotionOutcome, StudentUpdateResult};
use crate::store::{SchoolStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PromotionError {
    #[error("no eligible students selected for promotion")]
    EmptyBatch,

    #[error("promotion batch could not be joined: {0}")]
    Join(#[from] JoinError),
}

#[derive(Debug, Clone)]
pub struct BatchExecutor {
    stagger: Duration,
    request_timeout: Duration,
    strict_verification: bool,
}

impl BatchExecutor {
    pub fn new(stagger: Duration, request_timeout: Duration) -> Self {
        Self {
            stagger,
            request_timeout,
            strict_verification: false,
        }
    }

    pub fn from_config(cfg: &PromotionConfig) -> Self {
        Self::new(cfg.stagger(), cfg.request_timeout()).strict(cfg.strict_verification)
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict_verification = strict;
        self
    }

    pub async fn execute(
        &self,
        run_id: String,
        commands: Vec<PromotionCommand>,
        store: Arc<dyn SchoolStore>,
        cancel: CancellationToken,
    ) -> Result<BatchResult, PromotionError> {
        if commands.is_empty() {
            return Err(PromotionError::EmptyBatch);
        }

        let started_at = Utc::now();
        let batch_start = Instant::now();
        info!(
            run_id = %run_id,
            commands = commands.len(),
            stagger_ms = self.stagger.as_millis() as u64,
            "promotion batch started"
        );

        let mut handles = Vec::with_capacity(commands.len());
        for (k, cmd) in commands.into_iter().enumerate() {
            let dispatch_at = batch_start + self.stagger * k as u32;
            let store = Arc::clone(&store);
            let cancel = cancel.clone();
            let timeout = self.request_timeout;
            let strict = self.strict_verification;
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return cancelled(cmd),
                    _ = tokio::time::sleep_until(dispatch_at) => {}
                }
                dispatch(cmd, store.as_ref(), timeout, strict).await
            }));
        }

        // Join everything first; outcome order is dispatch order.
        let joined = futures::future::join_all(handles).await;
        let mut outcomes = Vec::with_capacity(joined.len());
        for j in joined {
            outcomes.push(j?);
        }

        let success_count = outcomes.iter().filter(|o| o.success).count();
        let cancelled_count = outcomes.iter().filter(|o| o.cancelled).count();
        let warning_count = outcomes.iter().filter(|o| o.warning.is_some()).count();
        let result = BatchResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            success_count,
            fail_count: outcomes.len() - success_count,
            cancelled_count,
            warning_count,
            outcomes,
        };
        info!(
            run_id = %result.run_id,
            success = result.success_count,
            failed = result.fail_count,
            cancelled = result.cancelled_count,
            warnings = result.warning_count,
            duration_ms = batch_start.elapsed().as_millis() as u64,
            "promotion batch complete"
        );
        Ok(result)
    }
}

async fn dispatch(
    cmd: PromotionCommand,
    store: &dyn SchoolStore,
    timeout: Duration,
    strict: bool,
) -> PromotionOutcome {
    debug!(
        student_id = %cmd.student_id,
        from = %cmd.from_class_id,
        to = %cmd.to_class_id,
        "dispatching promotion"
    );
    let call = store.update_student_class(&cmd.student_id, &cmd.to_class_id);
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(res)) => verify(cmd, res, strict),
        Ok(Err(e)) => failed(cmd, error_text(&e)),
        Err(_) => failed(cmd, StoreError::Timeout(timeout.as_millis() as u64).to_string()),
    }
}

fn error_text(e: &StoreError) -> String {
    match e {
        StoreError::Status { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// The write succeeded; check the echoed class against the one we asked for.
fn verify(cmd: PromotionCommand, res: StudentUpdateResult, strict: bool) -> PromotionOutcome {
    let note = match res.class_id.as_deref() {
        Some(id) if id == cmd.to_class_id => None,
        Some(id) => Some(format!(
            "server reported class {}, expected {}",
            id, cmd.to_class_id
        )),
        None => Some("server response did not include the student's class".to_string()),
    };

    let Some(note) = note else {
        return PromotionOutcome {
            new_class_id: res.class_id,
            ..base(cmd, true)
        };
    };

    warn!(
        student_id = %cmd.student_id,
        note = %note,
        response = %res.raw,
        "promotion verification mismatch"
    );
    if strict {
        PromotionOutcome {
            new_class_id: res.class_id,
            error: Some(note),
            ..base(cmd, false)
        }
    } else {
        PromotionOutcome {
            new_class_id: res.class_id,
            warning: Some(note),
            ..base(cmd, true)
        }
    }
}

fn failed(cmd: PromotionCommand, error: String) -> PromotionOutcome {
    warn!(student_id = %cmd.student_id, error = %error, "promotion failed");
    PromotionOutcome {
        error: Some(error),
        ..base(cmd, false)
    }
}

fn cancelled(cmd: PromotionCommand) -> PromotionOutcome {
    PromotionOutcome {
        error: Some("cancelled before dispatch".to_string()),
        cancelled: true,
        ..base(cmd, false)
    }
}

fn base(cmd: PromotionCommand, success: bool) -> PromotionOutcome {
    PromotionOutcome {
        student_id: cmd.student_id,
        student_number: cmd.student_number,
        success,
        new_class_id: None,
        error: None,
        warning: None,
        cancelled: false,
    }
}
