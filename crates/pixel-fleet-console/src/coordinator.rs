//! Request/response operations against the coordinator's REST API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use pixel_fleet_core::error::{FleetError, Result};
use pixel_fleet_core::types::{Project, ProjectMode, SessionRecord, SessionStatus, Strategy, lenient};

/// Result of a single cooperative batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    #[serde(default, deserialize_with = "lenient::count")]
    pub assigned: u64,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default, deserialize_with = "lenient::count")]
    pub total_remaining: u64,
    #[serde(default)]
    pub plan: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FavoriteOutcome {
    #[serde(default)]
    pub favorite: String,
    #[serde(default)]
    pub unchanged: bool,
    #[serde(default)]
    pub demoted: Vec<String>,
}

/// Latest preview payload held by the coordinator for the favorite agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardPreview {
    #[serde(rename = "slave_id")]
    pub agent_id: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearedCounts {
    #[serde(default, deserialize_with = "lenient::count")]
    pub projects_deleted: u64,
    #[serde(default, deserialize_with = "lenient::count")]
    pub sessions_deleted: u64,
}

/// Everything the console asks of the coordinator.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn create_project(&self, name: &str, mode: ProjectMode, config: &Value) -> Result<Project>;
    async fn create_session(
        &self,
        project_id: &str,
        agent_ids: &[String],
        strategy: Strategy,
    ) -> Result<SessionRecord>;
    async fn start_session(&self, session_id: &str) -> Result<()>;
    async fn pause_session(&self, session_id: &str) -> Result<()>;
    async fn stop_session(&self, session_id: &str) -> Result<()>;
    async fn one_batch(&self, session_id: &str) -> Result<BatchOutcome>;

    async fn update_selection(&self, agent_ids: &[String]) -> Result<Vec<String>>;
    async fn set_favorite(&self, agent_id: &str) -> Result<FavoriteOutcome>;

    async fn guard_config(&self) -> Result<Value>;
    /// Returns the fields the coordinator reports as changed.
    async fn save_guard_config(&self, patch: &Value) -> Result<Value>;
    /// Returns the id of the agent the data was sent to.
    async fn upload_guard(&self, filename: Option<&str>, data: &Value) -> Result<String>;
    /// Returns the agents that were told to clear.
    async fn clear_guard(&self) -> Result<Vec<String>>;
    /// Returns the agent asked to re-check.
    async fn guard_check(&self) -> Result<String>;
    async fn guard_preview(&self) -> Result<GuardPreview>;

    async fn list_projects(&self) -> Result<Vec<Project>>;
    async fn delete_project(&self, project_id: &str) -> Result<()>;
    async fn clear_all_projects(&self) -> Result<ClearedCounts>;
}

/// [`Coordinator`] over HTTP.
pub struct HttpCoordinator {
    base_url: String,
    client: reqwest::Client,
}

impl HttpCoordinator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Request(format!("HTTP client: {e}")))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn call(&self, method: reqwest::Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let url = format!("{}{path}", self.base_url);
        debug!(%method, %url, "Coordinator request");
        let mut req = self.client.request(method.clone(), &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| FleetError::Request(format!("{method} {path}: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| FleetError::Request(format!("{method} {path}: {e}")))?;
        if !status.is_success() {
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("detail").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(text);
            return Err(FleetError::Request(format!(
                "{method} {path}: HTTP {}: {detail}",
                status.as_u16()
            )));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| FleetError::Request(format!("{method} {path}: bad response body: {e}")))
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.call(reqwest::Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Value> {
        self.call(reqwest::Method::POST, path, body).await
    }
}

fn field<T: serde::de::DeserializeOwned>(v: &Value, key: &str) -> Result<T> {
    let raw = v
        .get(key)
        .cloned()
        .ok_or_else(|| FleetError::Request(format!("response missing '{key}'")))?;
    serde_json::from_value(raw).map_err(|e| FleetError::Request(format!("bad '{key}': {e}")))
}

#[async_trait]
impl Coordinator for HttpCoordinator {
    async fn create_project(&self, name: &str, mode: ProjectMode, config: &Value) -> Result<Project> {
        let body = json!({"name": name, "mode": mode, "config": config});
        let resp = self.post("/api/projects", Some(&body)).await?;
        let id: String = field(&resp, "project_id")?;
        Ok(Project {
            id,
            name: name.to_string(),
            mode,
            config: config.clone(),
        })
    }

    async fn create_session(
        &self,
        project_id: &str,
        agent_ids: &[String],
        strategy: Strategy,
    ) -> Result<SessionRecord> {
        let body = json!({
            "project_id": project_id,
            "slave_ids": agent_ids,
            "strategy": strategy,
        });
        let resp = self.post("/api/sessions", Some(&body)).await?;
        let id: String = field(&resp, "session_id")?;
        Ok(SessionRecord {
            id,
            project_id: project_id.to_string(),
            agent_ids: agent_ids.to_vec(),
            strategy,
            status: SessionStatus::Created,
        })
    }

    async fn start_session(&self, session_id: &str) -> Result<()> {
        self.post(&format!("/api/sessions/{session_id}/start"), None)
            .await
            .map(|_| ())
    }

    async fn pause_session(&self, session_id: &str) -> Result<()> {
        self.post(&format!("/api/sessions/{session_id}/pause"), None)
            .await
            .map(|_| ())
    }

    async fn stop_session(&self, session_id: &str) -> Result<()> {
        self.post(&format!("/api/sessions/{session_id}/stop"), None)
            .await
            .map(|_| ())
    }

    async fn one_batch(&self, session_id: &str) -> Result<BatchOutcome> {
        let resp = self
            .post(&format!("/api/sessions/{session_id}/one-batch"), None)
            .await?;
        serde_json::from_value(resp).map_err(|e| FleetError::Request(format!("bad one-batch response: {e}")))
    }

    async fn update_selection(&self, agent_ids: &[String]) -> Result<Vec<String>> {
        let body = json!({"slave_ids": agent_ids});
        let resp = self.post("/api/ui/selected-slaves", Some(&body)).await?;
        field(&resp, "slave_ids")
    }

    async fn set_favorite(&self, agent_id: &str) -> Result<FavoriteOutcome> {
        let resp = self
            .post(&format!("/api/slaves/{agent_id}/favorite"), None)
            .await?;
        serde_json::from_value(resp).map_err(|e| FleetError::Request(format!("bad favorite response: {e}")))
    }

    async fn guard_config(&self) -> Result<Value> {
        let resp = self.get("/api/guard/config").await?;
        field(&resp, "config")
    }

    async fn save_guard_config(&self, patch: &Value) -> Result<Value> {
        let resp = self.post("/api/guard/config", Some(patch)).await?;
        Ok(resp.get("changed").cloned().unwrap_or(Value::Null))
    }

    async fn upload_guard(&self, filename: Option<&str>, data: &Value) -> Result<String> {
        let body = json!({"filename": filename, "data": data});
        let resp = self.post("/api/guard/upload", Some(&body)).await?;
        field(&resp, "sent_to")
    }

    async fn clear_guard(&self) -> Result<Vec<String>> {
        let resp = self.post("/api/guard/clear", None).await?;
        field(&resp, "cleared_slaves")
    }

    async fn guard_check(&self) -> Result<String> {
        let resp = self.post("/api/guard/check", None).await?;
        field(&resp, "requested")
    }

    async fn guard_preview(&self) -> Result<GuardPreview> {
        let resp = self.get("/api/guard/preview").await?;
        serde_json::from_value(resp).map_err(|e| FleetError::Request(format!("bad preview response: {e}")))
    }

    async fn list_projects(&self) -> Result<Vec<Project>> {
        let resp = self.get("/api/projects").await?;
        let items = resp
            .get("projects")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        Ok(items
            .into_iter()
            .filter_map(|p| serde_json::from_value(p).ok())
            .collect())
    }

    async fn delete_project(&self, project_id: &str) -> Result<()> {
        self.call(
            reqwest::Method::DELETE,
            &format!("/api/projects/{project_id}"),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn clear_all_projects(&self) -> Result<ClearedCounts> {
        let resp = self.post("/api/projects/clear-all", None).await?;
        serde_json::from_value(resp).map_err(|e| FleetError::Request(format!("bad clear-all response: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_outcome_lenient() {
        let outcome: BatchOutcome = serde_json::from_value(json!({
            "ok": true,
            "session_id": "s",
            "assigned": 0,
            "reason": "no_changes",
            "total_remaining": "12"
        }))
        .unwrap();
        assert_eq!(outcome.reason.as_deref(), Some("no_changes"));
        assert_eq!(outcome.total_remaining, 12);
        assert!(outcome.plan.is_null());
    }

    #[test]
    fn test_field_missing() {
        let err = field::<String>(&json!({"a": 1}), "b").unwrap_err();
        assert!(matches!(err, FleetError::Request(m) if m.contains("'b'")));
    }

    #[test]
    fn test_base_url_trimmed() {
        let c = HttpCoordinator::new("http://127.0.0.1:8008/", Duration::from_secs(1)).unwrap();
        assert_eq!(c.base_url(), "http://127.0.0.1:8008");
    }
}
