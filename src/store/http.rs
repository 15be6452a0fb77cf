//! Remote school API over HTTP.

use super::{SchoolStore, StoreError};
use crate::model::{ClassRef, PromotionRuleRecord, PromotionRules, Student, StudentUpdateResult};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Url};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct HttpStoreConfig {
    /// e.g. "https://school.example.com/api"
    pub base_url: String,
    pub token: Option<String>,
    pub timeout_ms: u64,
}

pub struct HttpStore {
    client: Client,
    base: Url,
    config: HttpStoreConfig,
}

impl HttpStore {
    pub fn new(config: HttpStoreConfig) -> Result<Self, StoreError> {
        let base = Url::parse(config.base_url.trim())
            .map_err(|e| StoreError::BadUrl(format!("{}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::BadUrl(config.base_url.clone()));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base,
            config,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Appends `segments` to the base path, percent-encoding each one.
    fn url_for(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.client.request(method, self.url_for(segments));
        match &self.config.token {
            Some(t) => builder.bearer_auth(t),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> Result<Value, StoreError> {
        let started = Instant::now();
        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let body = response.text().await.map_err(|e| self.transport_error(e))?;
        debug!(
            what,
            status = status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "school api response"
        );

        if !status.is_success() {
            return Err(StoreError::Status {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }

    fn transport_error(&self, e: reqwest::Error) -> StoreError {
        if e.is_timeout() {
            StoreError::Timeout(self.config.timeout_ms)
        } else {
            StoreError::Http(e)
        }
    }
}

/// Pulls a human message out of an error body (`message`, `error`, `detail`),
/// falling back to the raw text.
fn error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        for key in ["message", "error", "detail"] {
            match v.get(key) {
                Some(Value::String(s)) if !s.is_empty() => return s.clone(),
                Some(Value::Object(inner)) => {
                    if let Some(Value::String(s)) = inner.get("message") {
                        return s.clone();
                    }
                }
                _ => {}
            }
        }
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        "empty error response".to_string()
    } else {
        trimmed.chars().take(300).collect()
    }
}

fn unwrap_data(v: Value) -> Value {
    match v {
        Value::Object(mut map) if map.contains_key("data") => map.remove("data").unwrap_or(Value::Null),
        other => other,
    }
}

fn into_list(v: Value, what: &str) -> Result<Vec<Value>, StoreError> {
    match unwrap_data(v) {
        Value::Array(items) => Ok(items),
        other => Err(StoreError::Decode(format!(
            "{what}: expected a list, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn id_of(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_of(obj: &Value, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(|v| v.as_str()))
        .unwrap_or_default()
        .to_string()
}

fn parse_class(v: &Value) -> Option<ClassRef> {
    let id = id_of(v.get("id"))?;
    Some(ClassRef {
        id,
        name: str_of(v, &["name", "className"]),
        form: str_of(v, &["form", "level"]),
    })
}

fn parse_student(v: &Value) -> Option<Student> {
    let id = id_of(v.get("id"))?;
    let class_id = id_of(v.get("classId"))
        .or_else(|| id_of(v.get("class_id")))
        .or_else(|| id_of(v.get("class").and_then(|c| c.get("id"))));
    let student_number = id_of(v.get("studentNumber"))
        .or_else(|| id_of(v.get("student_number")))
        .unwrap_or_default();
    Some(Student {
        id,
        student_number,
        first_name: str_of(v, &["firstName", "first_name"]),
        last_name: str_of(v, &["lastName", "last_name"]),
        class_id,
    })
}

fn parse_record(v: &Value) -> Option<PromotionRuleRecord> {
    Some(PromotionRuleRecord {
        from_class_id: id_of(v.get("fromClassId"))?,
        to_class_id: id_of(v.get("toClassId")),
        is_final_class: v
            .get("isFinalClass")
            .and_then(|b| b.as_bool())
            .unwrap_or(false),
    })
}

/// Accepts a name map, a record list, or `{rules: {...}, links: [...]}`.
pub(crate) fn parse_rules(v: Value) -> Result<PromotionRules, StoreError> {
    let mut out = PromotionRules::default();
    match unwrap_data(v) {
        Value::Null => {}
        Value::Array(items) => out.linked = records(&items),
        Value::Object(map) if map.contains_key("rules") || map.contains_key("links") => {
            if let Some(Value::Object(named)) = map.get("rules") {
                out.named = named_table(named);
            }
            if let Some(Value::Array(items)) = map.get("links") {
                out.linked = records(items);
            }
        }
        Value::Object(named) => out.named = named_table(&named),
        other => {
            return Err(StoreError::Decode(format!(
                "promotion rules: unexpected {}",
                kind_of(&other)
            )))
        }
    }
    Ok(out)
}

fn named_table(map: &serde_json::Map<String, Value>) -> crate::model::PromotionRuleTable {
    let mut table = crate::model::PromotionRuleTable::new();
    for (k, v) in map {
        match v.as_str() {
            Some(s) => {
                table.insert(k.clone(), s.to_string());
            }
            None => warn!(key = %k, "ignoring non-string promotion rule value"),
        }
    }
    table
}

fn records(items: &[Value]) -> Vec<PromotionRuleRecord> {
    items
        .iter()
        .filter_map(|item| {
            let rec = parse_record(item);
            if rec.is_none() {
                warn!("ignoring promotion rule record without fromClassId");
            }
            rec
        })
        .collect()
}

#[async_trait]
impl SchoolStore for HttpStore {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn get_classes(&self) -> Result<Vec<ClassRef>, StoreError> {
        let body = self.send(self.request(Method::GET, &["classes"]), "classes").await?;
        Ok(into_list(body, "classes")?
            .iter()
            .filter_map(parse_class)
            .collect())
    }

    async fn get_students(&self) -> Result<Vec<Student>, StoreError> {
        let body = self.send(self.request(Method::GET, &["students"]), "students").await?;
        Ok(into_list(body, "students")?
            .iter()
            .filter_map(parse_student)
            .collect())
    }

    async fn get_promotion_rules(&self) -> Result<PromotionRules, StoreError> {
        let body = self
            .send(self.request(Method::GET, &["promotion-rules"]), "promotion-rules")
            .await?;
        parse_rules(body)
    }

    async fn update_student_class(
        &self,
        student_id: &str,
        class_id: &str,
    ) -> Result<StudentUpdateResult, StoreError> {
        let builder = self
            .request(Method::PATCH, &["students", student_id])
            .json(&json!({ "classId": class_id }));
        let body = self.send(builder, "students.update").await?;
        Ok(StudentUpdateResult::from_value(body))
    }
}
