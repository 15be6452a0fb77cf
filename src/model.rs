use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Rule value marking a terminal class: students there have nowhere to go.
pub const COMPLETED_SENTINEL: &str = "Completed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassRef {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub form: String,
}

impl ClassRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, form: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            form: form.into(),
        }
    }

    /// Stand-in for a class id that the directory does not know about.
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self::new(id, "", "")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    #[serde(default)]
    pub student_number: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub class_id: Option<String>,
}

impl Student {
    /// Class id, with blank values treated as "no class".
    pub fn current_class_id(&self) -> Option<&str> {
        self.class_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// String-keyed rule table: class name or form -> successor name (or `Completed`).
pub type PromotionRuleTable = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionRuleRecord {
    pub from_class_id: String,
    #[serde(default)]
    pub to_class_id: Option<String>,
    #[serde(default)]
    pub is_final_class: bool,
}

/// Both rule representations as delivered by a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionRules {
    #[serde(default)]
    pub named: PromotionRuleTable,
    #[serde(default)]
    pub linked: Vec<PromotionRuleRecord>,
}

impl PromotionRules {
    pub fn from_table(named: PromotionRuleTable) -> Self {
        Self {
            named,
            linked: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.named.is_empty() && self.linked.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionCommand {
    pub student_id: String,
    pub student_number: String,
    pub from_class_id: String,
    pub to_class_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionOutcome {
    pub student_id: String,
    pub student_number: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_class_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success_count: usize,
    pub fail_count: usize,
    pub cancelled_count: usize,
    pub warning_count: usize,
    pub outcomes: Vec<PromotionOutcome>,
}

/// What the store echoed back after moving a student.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentUpdateResult {
    pub class_id: Option<String>,
    pub raw: serde_json::Value,
}

impl StudentUpdateResult {
    /// Reads the class id from a response body: `classId` / `class_id` directly,
    /// otherwise the nested `class.id` relation. A `{data: ...}` envelope is unwrapped.
    pub fn from_value(raw: serde_json::Value) -> Self {
        let body = match raw.get("data") {
            Some(inner) if inner.is_object() => inner,
            _ => &raw,
        };
        let direct = body
            .get("classId")
            .or_else(|| body.get("class_id"))
            .and_then(value_as_id);
        let nested = || {
            body.get("class")
                .and_then(|c| c.get("id"))
                .and_then(value_as_id)
        };
        let class_id = direct.or_else(nested);
        Self { class_id, raw }
    }
}

fn value_as_id(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
