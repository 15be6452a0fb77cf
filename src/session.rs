//! One promotion cycle at a time.
//!
//! The session owns the loaded directory, roster, rules and the plan built from
//! them, plus the user's selection. A batch runs in a spawned task against the
//! plan it was started from; until that batch and its follow-up reload are done
//! the session refuses anything that would rebuild the plan or change what is
//! being promoted.

use crate::config::PromotionConfig;
use crate::executor::{BatchExecutor, PromotionError};
use crate::model::{BatchResult, ClassRef, PromotionCommand, PromotionRules, Student};
use crate::plan::{self, PlanEntry, SelectionMode};
use crate::report::{Report, ReportKind};
use crate::store::{SchoolStore, StoreError};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a promotion batch is still running")]
    Running,

    #[error("waiting for the roster to reload after the last promotion")]
    ReloadPending,

    #[error("load the promotion plan first")]
    NoPlan,

    #[error("no eligible students selected for promotion")]
    EmptyBatch,

    #[error("student {0} is not in the current plan")]
    UnknownStudent(String),

    #[error("class {0} is not in the current plan")]
    UnknownClass(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SessionError {
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Running => "promotion_running",
            SessionError::ReloadPending => "reload_pending",
            SessionError::NoPlan => "no_plan",
            SessionError::EmptyBatch => "no_eligible_students",
            SessionError::UnknownStudent(_) | SessionError::UnknownClass(_) => "not_found",
            SessionError::Store(_) => "backend_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Banner {
    pub kind: ReportKind,
    pub message: String,
    pub expires_at: Instant,
}

/// Something that went wrong outside of a per-student outcome.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Fault {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleResult {
    pub eligible: bool,
    pub selected: bool,
}

#[derive(Debug, Default)]
pub struct PromotionSession {
    pub classes: Vec<ClassRef>,
    pub students: Vec<Student>,
    pub rules: PromotionRules,
    pub plan: Option<Vec<PlanEntry>>,
    pub mode: SelectionMode,
    pub selected: HashSet<String>,
    pub running: bool,
    pub reload_pending: bool,
    /// Bumped every time a plan is built.
    pub generation: u64,
    pub active_run: Option<String>,
    pub last_result: Option<BatchResult>,
    pub last_report: Option<Report>,
    pub last_error: Option<Fault>,
    cancel: Option<CancellationToken>,
    banner: Option<Banner>,
}

pub type SharedSession = Arc<Mutex<PromotionSession>>;

pub fn lock(session: &SharedSession) -> MutexGuard<'_, PromotionSession> {
    session.lock().unwrap_or_else(|p| p.into_inner())
}

impl PromotionSession {
    pub fn shared() -> SharedSession {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.running {
            return Err(SessionError::Running);
        }
        if self.reload_pending {
            return Err(SessionError::ReloadPending);
        }
        Ok(())
    }

    /// Forgets everything loaded from the previous backend.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        let generation = self.generation + 1;
        *self = Self {
            generation,
            ..Self::default()
        };
        Ok(())
    }

    fn plan_ref(&self) -> Result<&[PlanEntry], SessionError> {
        self.plan.as_deref().ok_or(SessionError::NoPlan)
    }

    /// Replaces everything with freshly fetched data. Selections that are no
    /// longer eligible are dropped.
    pub fn apply_load(&mut self, classes: Vec<ClassRef>, students: Vec<Student>, rules: PromotionRules) {
        let plan = plan::build_plan(&classes, &students, &rules);
        let eligible: HashSet<&str> = plan
            .iter()
            .filter(|e| e.is_eligible())
            .flat_map(|e| e.students.iter().map(|s| s.id.as_str()))
            .collect();
        self.selected.retain(|id| eligible.contains(id.as_str()));

        self.classes = classes;
        self.students = students;
        self.rules = rules;
        self.plan = Some(plan);
        self.generation += 1;
    }

    pub fn set_mode(&mut self, mode: SelectionMode) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.mode = mode;
        Ok(())
    }

    /// Flips one student's selection. Students of classes without a successor
    /// cannot be selected; the toggle is then a no-op.
    pub fn toggle(&mut self, student_id: &str) -> Result<ToggleResult, SessionError> {
        self.ensure_idle()?;
        let entry = plan::entry_for_student(self.plan_ref()?, student_id)
            .ok_or_else(|| SessionError::UnknownStudent(student_id.to_string()))?;
        if !entry.is_eligible() {
            return Ok(ToggleResult {
                eligible: false,
                selected: false,
            });
        }
        let selected = if self.selected.remove(student_id) {
            false
        } else {
            self.selected.insert(student_id.to_string());
            true
        };
        Ok(ToggleResult {
            eligible: true,
            selected,
        })
    }

    /// Selects or clears every student of one class; returns how many changed.
    pub fn set_class_selected(&mut self, class_id: &str, selected: bool) -> Result<usize, SessionError> {
        self.ensure_idle()?;
        let entry = self
            .plan_ref()?
            .iter()
            .find(|e| e.class.id == class_id)
            .ok_or_else(|| SessionError::UnknownClass(class_id.to_string()))?;
        if !entry.is_eligible() {
            return Ok(0);
        }
        let ids: Vec<String> = entry.students.iter().map(|s| s.id.clone()).collect();
        let mut changed = 0;
        for id in ids {
            let did = if selected {
                self.selected.insert(id)
            } else {
                self.selected.remove(&id)
            };
            changed += usize::from(did);
        }
        Ok(changed)
    }

    pub fn clear_selection(&mut self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.selected.clear();
        Ok(())
    }

    pub fn commands(&self) -> Result<Vec<PromotionCommand>, SessionError> {
        Ok(plan::select_commands(self.plan_ref()?, self.mode, &self.selected))
    }

    /// Locks the cycle and hands out the commands to run.
    pub fn begin_run(&mut self, run_id: &str) -> Result<(Vec<PromotionCommand>, CancellationToken), SessionError> {
        self.ensure_idle()?;
        let commands = self.commands()?;
        if commands.is_empty() {
            self.last_report = Some(Report::empty_batch());
            return Err(SessionError::EmptyBatch);
        }
        let token = CancellationToken::new();
        self.running = true;
        self.active_run = Some(run_id.to_string());
        self.cancel = Some(token.clone());
        self.last_error = None;
        Ok((commands, token))
    }

    pub fn cancel(&mut self) -> bool {
        match (&self.cancel, self.running) {
            (Some(token), true) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn finish_run(
        &mut self,
        outcome: Result<BatchResult, PromotionError>,
        banner_ttl: std::time::Duration,
    ) -> Report {
        self.running = false;
        self.cancel = None;
        self.active_run = None;

        let report = match outcome {
            Ok(result) => {
                let report = Report::from_batch(&result);
                self.last_result = Some(result);
                report
            }
            Err(PromotionError::EmptyBatch) => Report::empty_batch(),
            Err(e) => {
                self.last_error = Some(Fault {
                    code: "join_failed",
                    message: e.to_string(),
                });
                Report {
                    kind: ReportKind::Failure,
                    message: "Promotion could not be completed. Please try again.".to_string(),
                    success_count: 0,
                    fail_count: 0,
                    reload: false,
                }
            }
        };

        if report.reload {
            self.selected.clear();
            self.reload_pending = true;
        }
        self.banner = Some(Banner {
            kind: report.kind,
            message: report.message.clone(),
            expires_at: Instant::now() + banner_ttl,
        });
        self.last_report = Some(report.clone());
        report
    }

    pub fn banner(&self) -> Option<&Banner> {
        self.banner
            .as_ref()
            .filter(|b| Instant::now() < b.expires_at)
    }

    pub fn plan_json(&self) -> Value {
        let Some(plan) = self.plan.as_deref() else {
            return json!({ "loaded": false, "entries": [] });
        };
        let entries: Vec<Value> = plan
            .iter()
            .map(|e| {
                let students: Vec<Value> = e
                    .students
                    .iter()
                    .map(|s| {
                        json!({
                            "id": s.id,
                            "studentNumber": s.student_number,
                            "firstName": s.first_name,
                            "lastName": s.last_name,
                            "selected": self.selected.contains(&s.id),
                        })
                    })
                    .collect();
                json!({
                    "class": e.class,
                    "nextClass": e.next_class,
                    "eligible": e.is_eligible(),
                    "matchedBy": e.matched_by,
                    "students": students,
                })
            })
            .collect();
        let eligible_students: usize = plan
            .iter()
            .filter(|e| e.is_eligible())
            .map(|e| e.students.len())
            .sum();
        json!({
            "loaded": true,
            "generation": self.generation,
            "mode": self.mode,
            "selectedCount": self.selected.len(),
            "eligibleStudentCount": eligible_students,
            "entries": entries,
        })
    }

    pub fn status_json(&self) -> Value {
        json!({
            "running": self.running,
            "reloadPending": self.reload_pending,
            "activeRunId": self.active_run,
            "generation": self.generation,
            "lastResult": self.last_result,
            "lastReport": self.last_report,
            "lastError": self.last_error,
            "banner": self.banner().map(|b| json!({ "kind": b.kind, "message": b.message })),
        })
    }
}

async fn fetch_all(
    store: &dyn SchoolStore,
) -> Result<(Vec<ClassRef>, Vec<Student>, PromotionRules), StoreError> {
    tokio::try_join!(
        store.get_classes(),
        store.get_students(),
        store.get_promotion_rules()
    )
}

/// Fetches directory, roster and rules and rebuilds the plan.
pub async fn load(session: &SharedSession, store: &dyn SchoolStore) -> Result<(), SessionError> {
    lock(session).ensure_idle()?;
    let (classes, students, rules) = fetch_all(store).await?;
    let mut s = lock(session);
    // A batch may have started while we were fetching.
    s.ensure_idle()?;
    if rules.is_empty() {
        warn!("no promotion rules configured; no class will be eligible");
    }
    info!(
        classes = classes.len(),
        students = students.len(),
        named_rules = rules.named.len(),
        linked_rules = rules.linked.len(),
        "promotion data loaded"
    );
    s.apply_load(classes, students, rules);
    Ok(())
}

pub struct StartedRun {
    pub run_id: String,
    pub command_count: usize,
    pub handle: JoinHandle<()>,
}

/// Starts a batch in the background. `on_finish` sees the result before the
/// settling reload is scheduled.
pub fn start<F>(
    session: &SharedSession,
    store: Arc<dyn SchoolStore>,
    cfg: &PromotionConfig,
    on_finish: F,
) -> Result<StartedRun, SessionError>
where
    F: FnOnce(&BatchResult) + Send + 'static,
{
    let run_id = Uuid::new_v4().to_string();
    let (commands, cancel) = lock(session).begin_run(&run_id)?;
    let command_count = commands.len();

    let executor = BatchExecutor::from_config(cfg);
    let banner_ttl = cfg.banner();
    let settle = cfg.settle();
    let session = Arc::clone(session);
    let task_run_id = run_id.clone();

    let handle = tokio::spawn(async move {
        let outcome = executor
            .execute(task_run_id, commands, Arc::clone(&store), cancel)
            .await;
        if let Ok(result) = &outcome {
            on_finish(result);
        }
        let (report, generation) = {
            let mut s = lock(&session);
            let report = s.finish_run(outcome, banner_ttl);
            (report, s.generation)
        };
        info!(message = %report.message, "promotion finished");
        if !report.reload {
            return;
        }

        tokio::time::sleep(settle).await;
        let fetched = fetch_all(store.as_ref()).await;
        let mut s = lock(&session);
        s.reload_pending = false;
        match fetched {
            Ok((classes, students, rules)) if s.generation == generation => {
                s.apply_load(classes, students, rules);
                debug!(generation = s.generation, "roster reloaded after promotion");
            }
            Ok(_) => debug!("plan changed since the batch finished; skipping reload"),
            Err(e) => {
                warn!(error = %e, "roster reload after promotion failed");
                // The roster changed under the old plan.
                s.plan = None;
                s.selected.clear();
                s.last_error = Some(Fault {
                    code: "backend_failed",
                    message: format!("reload failed: {e}"),
                });
            }
        }
    });

    Ok(StartedRun {
        run_id,
        command_count,
        handle,
    })
}
