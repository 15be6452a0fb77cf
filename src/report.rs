use crate::model::BatchResult;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportKind {
    Success,
    Partial,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub kind: ReportKind,
    pub message: String,
    pub success_count: usize,
    pub fail_count: usize,
    /// Whether the roster should be reloaded once the backend settles.
    pub reload: bool,
}

fn students(n: usize) -> String {
    if n == 1 {
        "1 student".to_string()
    } else {
        format!("{} students", n)
    }
}

impl Report {
    pub fn from_batch(result: &BatchResult) -> Self {
        let ok = result.success_count;
        let failed = result.fail_count;

        if ok == 0 {
            return Self {
                kind: ReportKind::Failure,
                message: format!(
                    "Failed to promote students ({} failed). Please try again.",
                    failed
                ),
                success_count: ok,
                fail_count: failed,
                reload: false,
            };
        }

        let mut message = format!("Successfully promoted {}.", students(ok));
        if failed > 0 {
            message.push_str(&format!(" {} failed.", failed));
        }
        if result.warning_count > 0 {
            message.push_str(&format!(
                " {} with verification warnings.",
                result.warning_count
            ));
        }
        Self {
            kind: if failed > 0 {
                ReportKind::Partial
            } else {
                ReportKind::Success
            },
            message,
            success_count: ok,
            fail_count: failed,
            reload: true,
        }
    }

    /// Reported when the batch never ran because nothing was selected.
    pub fn empty_batch() -> Self {
        Self {
            kind: ReportKind::Failure,
            message: "No eligible students selected for promotion.".to_string(),
            success_count: 0,
            fail_count: 0,
            reload: false,
        }
    }
}
