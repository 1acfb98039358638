//! Typed REST client plus per-endpoint normalization adapters.
//!
//! Backend responses arrive in several envelope shapes depending on
//! endpoint version: a bare array, `{"items": [...]}`, `{"data":
//! [...]}`, or wrapped in a `{"result": ...}` envelope. Each adapter
//! maps every observed shape to one internal typed structure so
//! callers never see the raw JSON.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use steward_core::timeline::{StepStatus, TimelineStep};
use steward_core::types::{Event, Stage};

use crate::error::SyncError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One row of the tracked-entity list inside an aggregate snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub entity_id: String,
    pub status: Option<String>,
    pub service: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Normalized aggregate snapshot: per-stage counts, recent events,
/// and the tracked-entity list.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OverviewSnapshot {
    /// Indexed by `Stage::index()`.
    pub stage_counts: [u64; 4],
    pub events: Vec<Event>,
    pub entities: Vec<EntityRow>,
}

/// Normalized single-entity detail with its authoritative timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDetail {
    pub entity_id: String,
    pub status: Option<String>,
    pub timeline: Vec<TimelineStep>,
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, SyncError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Fetch the aggregate overview snapshot.
    pub async fn fetch_overview(&self) -> Result<OverviewSnapshot, SyncError> {
        let url = format!("{}/api/overview", self.base_url);
        let value: Value = self.http.get(&url).send().await?.json().await?;
        parse_overview(&value)
    }

    /// Fetch one entity's authoritative detail, including its stage timeline.
    pub async fn fetch_entity(&self, entity_id: &str) -> Result<EntityDetail, SyncError> {
        let url = format!("{}/api/entities/{}", self.base_url, entity_id);
        let value: Value = self.http.get(&url).send().await?.json().await?;
        parse_detail(entity_id, &value)
    }

    /// Write action: set the backend-side status for an entity.
    /// Fire-and-forget from the sync core's perspective; the caller
    /// re-fetches the affected feed on success.
    pub async fn activate(&self, entity_id: &str, status: &str) -> Result<(), SyncError> {
        let url = format!("{}/api/entities/{}/activate", self.base_url, entity_id);
        let body = serde_json::json!({ "status": status });
        let resp = self.http.post(&url).json(&body).send().await?;
        reject_on_error(resp).await
    }

    /// Write action: approve or deny a pending governance item.
    pub async fn resolve_approval(&self, entity_id: &str, approve: bool) -> Result<(), SyncError> {
        let verb = if approve { "approve" } else { "deny" };
        let url = format!("{}/api/entities/{}/{}", self.base_url, entity_id, verb);
        let resp = self.http.post(&url).send().await?;
        reject_on_error(resp).await
    }
}

/// Map a non-2xx write-endpoint response to a user-action rejection.
async fn reject_on_error(resp: reqwest::Response) -> Result<(), SyncError> {
    if resp.status().is_success() {
        return Ok(());
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Err(SyncError::ActionRejected(format!("{status}: {body}")))
}

// ---------------------------------------------------------------------------
// Normalization adapters
// ---------------------------------------------------------------------------

/// Unwrap a collection that may arrive bare, under one of `keys`, or
/// inside a `result` envelope.
fn unwrap_collection<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Vec<Value>> {
    if let Some(arr) = value.as_array() {
        return Some(arr);
    }
    for key in keys.iter().chain(["items", "data"].iter()) {
        if let Some(arr) = value.get(*key).and_then(Value::as_array) {
            return Some(arr);
        }
    }
    if let Some(inner) = value.get("result") {
        return unwrap_collection(inner, keys);
    }
    None
}

/// Strip a `result`/`data` envelope from an object response.
fn unwrap_object(value: &Value) -> &Value {
    for key in ["result", "data"] {
        if let Some(inner) = value.get(key) {
            if inner.is_object() {
                return inner;
            }
        }
    }
    value
}

fn get_str(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn get_timestamp(value: &Value, keys: &[&str]) -> Option<DateTime<Utc>> {
    keys.iter()
        .find_map(|k| value.get(*k).and_then(Value::as_str))
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

/// Normalize one event payload. Field spellings vary by backend
/// version; anything beyond the known fields is kept as opaque
/// metadata. Returns `None` for payloads missing identity, timestamp,
/// or topic — the caller logs and drops those (Protocol error class).
pub fn parse_event(value: &Value) -> Option<Event> {
    // Stream deliveries nest the detail fields under a payload key.
    let body = value
        .get("payload")
        .filter(|p| p.is_object())
        .unwrap_or(value);

    let id = get_str(value, &["id", "event_id"]).or_else(|| get_str(body, &["id", "event_id"]))?;
    let created_at = get_timestamp(value, &["created_at", "createdAt", "timestamp", "ts"])
        .or_else(|| get_timestamp(body, &["created_at", "createdAt", "timestamp", "ts"]))?;
    let topic = get_str(value, &["topic", "type"]).or_else(|| get_str(body, &["topic", "type"]))?;

    let stage = get_str(body, &["stage"]).and_then(|s| parse_stage(&s));

    let known = [
        "id",
        "event_id",
        "created_at",
        "createdAt",
        "timestamp",
        "ts",
        "topic",
        "type",
        "payload",
        "entity_id",
        "entityId",
        "vtid",
        "stage",
        "status",
        "service",
        "message",
    ];
    let mut metadata = serde_json::Map::new();
    if let Some(obj) = body.as_object() {
        for (k, v) in obj {
            if !known.contains(&k.as_str()) {
                metadata.insert(k.clone(), v.clone());
            }
        }
    }

    Some(Event {
        id,
        created_at,
        entity_id: get_str(body, &["entity_id", "entityId", "vtid"]),
        topic,
        stage,
        status: get_str(body, &["status"]),
        service: get_str(body, &["service"]),
        message: get_str(body, &["message"]),
        metadata: if metadata.is_empty() {
            Value::Null
        } else {
            Value::Object(metadata)
        },
    })
}

/// Stage spellings observed in the wild: lowercase snake_case and the
/// older SHOUTING form.
fn parse_stage(s: &str) -> Option<Stage> {
    match s.to_ascii_lowercase().as_str() {
        "planner" | "planning" => Some(Stage::Planner),
        "worker" | "execution" => Some(Stage::Worker),
        "validator" | "validation" => Some(Stage::Validator),
        "deploy" | "release" => Some(Stage::Deploy),
        _ => None,
    }
}

/// Normalize the aggregate overview response.
pub fn parse_overview(value: &Value) -> Result<OverviewSnapshot, SyncError> {
    let body = unwrap_object(value);

    let mut stage_counts = [0u64; 4];
    if let Some(counts) = body
        .get("stage_counts")
        .or_else(|| body.get("counts"))
        .and_then(Value::as_object)
    {
        for (key, count) in counts {
            if let (Some(stage), Some(n)) = (parse_stage(key), count.as_u64()) {
                stage_counts[stage.index()] = n;
            }
        }
    }

    let mut events = Vec::new();
    if let Some(raw) = body
        .get("events")
        .or_else(|| body.get("recent_events"))
        .and_then(|v| unwrap_collection(v, &["events"]))
    {
        for item in raw {
            match parse_event(item) {
                Some(ev) => events.push(ev),
                None => tracing::debug!("dropping malformed snapshot event"),
            }
        }
    }

    let mut entities = Vec::new();
    let raw_entities = body
        .get("entities")
        .or_else(|| body.get("tasks"))
        .and_then(|v| unwrap_collection(v, &["entities", "tasks"]))
        .or_else(|| unwrap_collection(body, &["entities", "tasks"]));
    if let Some(raw) = raw_entities {
        for item in raw {
            let Some(entity_id) = get_str(item, &["entity_id", "entityId", "vtid", "id"]) else {
                tracing::debug!("dropping entity row without id");
                continue;
            };
            entities.push(EntityRow {
                entity_id,
                status: get_str(item, &["status", "state"]),
                service: get_str(item, &["service"]),
                updated_at: get_timestamp(item, &["updated_at", "updatedAt"]),
            });
        }
    }

    if events.is_empty() && entities.is_empty() && body.get("stage_counts").is_none() && body.get("counts").is_none() {
        // An overview with none of the expected sections is an
        // endpoint mismatch, not an empty system.
        if !body.is_object() || body.as_object().is_some_and(|o| o.is_empty()) {
            return Err(SyncError::Protocol("empty overview response".into()));
        }
    }

    Ok(OverviewSnapshot {
        stage_counts,
        events,
        entities,
    })
}

/// Normalize the per-entity detail response. Timeline steps with
/// unknown stage or status vocabulary are dropped individually.
pub fn parse_detail(entity_id: &str, value: &Value) -> Result<EntityDetail, SyncError> {
    let body = unwrap_object(value);

    let mut timeline = Vec::new();
    if let Some(raw) = body
        .get("timeline")
        .or_else(|| body.get("stages"))
        .and_then(|v| unwrap_collection(v, &["steps"]))
    {
        for item in raw {
            let stage = get_str(item, &["stage", "name"]).and_then(|s| parse_stage(&s));
            let status = get_str(item, &["status", "state"]).and_then(|s| StepStatus::parse(&s));
            let (Some(stage), Some(status)) = (stage, status) else {
                tracing::debug!(entity_id, "dropping timeline step with unknown vocabulary");
                continue;
            };
            timeline.push(TimelineStep {
                stage,
                status,
                latest_event: item.get("latest_event").and_then(parse_event),
                event_count: item
                    .get("event_count")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize,
            });
        }
    }

    Ok(EntityDetail {
        entity_id: get_str(body, &["entity_id", "entityId", "vtid", "id"])
            .unwrap_or_else(|| entity_id.to_string()),
        status: get_str(body, &["status", "state"]),
        timeline,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
