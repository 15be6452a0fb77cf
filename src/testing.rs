//! In-memory store used by unit tests.

use crate::model::{ClassRef, PromotionRules, Student, StudentUpdateResult};
use crate::store::{SchoolStore, StoreError};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Call {
    pub student_id: String,
    pub class_id: String,
    pub at: Instant,
}

pub struct MockStore {
    classes: Vec<ClassRef>,
    students: Mutex<Vec<Student>>,
    rules: PromotionRules,
    failing: HashSet<String>,
    hanging: HashSet<String>,
    delays: HashMap<String, Duration>,
    echo: HashMap<String, Option<String>>,
    calls: Mutex<Vec<Call>>,
    loads: Mutex<usize>,
    load_limit: Option<usize>,
}

impl MockStore {
    pub fn new(classes: Vec<ClassRef>, students: Vec<Student>, rules: PromotionRules) -> Self {
        Self {
            classes,
            students: Mutex::new(students),
            rules,
            failing: HashSet::new(),
            hanging: HashSet::new(),
            delays: HashMap::new(),
            echo: HashMap::new(),
            calls: Mutex::new(Vec::new()),
            loads: Mutex::new(0),
            load_limit: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new(), PromotionRules::default())
    }

    pub fn failing(mut self, student_id: &str) -> Self {
        self.failing.insert(student_id.to_string());
        self
    }

    pub fn hanging(mut self, student_id: &str) -> Self {
        self.hanging.insert(student_id.to_string());
        self
    }

    pub fn delayed(mut self, student_id: &str, d: Duration) -> Self {
        self.delays.insert(student_id.to_string(), d);
        self
    }

    /// Roster loads beyond the first `n` fail.
    pub fn failing_loads_after(mut self, n: usize) -> Self {
        self.load_limit = Some(n);
        self
    }

    /// Overrides the class id echoed back for one student.
    pub fn echoing(mut self, student_id: &str, class_id: Option<&str>) -> Self {
        self.echo
            .insert(student_id.to_string(), class_id.map(str::to_string));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn call_count(&self, student_id: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.student_id == student_id)
            .count()
    }

    /// Number of `get_students` calls, i.e. roster loads.
    pub fn loads(&self) -> usize {
        *self.loads.lock().expect("loads")
    }

    pub fn student_class(&self, student_id: &str) -> Option<String> {
        self.students
            .lock()
            .expect("students")
            .iter()
            .find(|s| s.id == student_id)
            .and_then(|s| s.class_id.clone())
    }
}

#[async_trait]
impl SchoolStore for MockStore {
    fn kind(&self) -> &'static str {
        "mock"
    }

    async fn get_classes(&self) -> Result<Vec<ClassRef>, StoreError> {
        Ok(self.classes.clone())
    }

    async fn get_students(&self) -> Result<Vec<Student>, StoreError> {
        let loads = {
            let mut loads = self.loads.lock().expect("loads");
            *loads += 1;
            *loads
        };
        if self.load_limit.is_some_and(|n| loads > n) {
            return Err(StoreError::Status {
                status: 503,
                message: "roster unavailable".to_string(),
            });
        }
        Ok(self.students.lock().expect("students").clone())
    }

    async fn get_promotion_rules(&self) -> Result<PromotionRules, StoreError> {
        Ok(self.rules.clone())
    }

    async fn update_student_class(
        &self,
        student_id: &str,
        class_id: &str,
    ) -> Result<StudentUpdateResult, StoreError> {
        self.calls.lock().expect("calls").push(Call {
            student_id: student_id.to_string(),
            class_id: class_id.to_string(),
            at: Instant::now(),
        });

        if self.hanging.contains(student_id) {
            std::future::pending::<()>().await;
        }
        if let Some(d) = self.delays.get(student_id) {
            tokio::time::sleep(*d).await;
        }
        if self.failing.contains(student_id) {
            return Err(StoreError::Status {
                status: 500,
                message: format!("could not update {student_id}"),
            });
        }

        {
            let mut students = self.students.lock().expect("students");
            if let Some(s) = students.iter_mut().find(|s| s.id == student_id) {
                s.class_id = Some(class_id.to_string());
            }
        }

        let echoed = self
            .echo
            .get(student_id)
            .cloned()
            .unwrap_or_else(|| Some(class_id.to_string()));
        Ok(StudentUpdateResult::from_value(json!({
            "id": student_id,
            "classId": echoed,
        })))
    }
}
