//! Wire types for the Rollout Controller HTTP surface.

use serde::{Deserialize, Serialize};

/// Registry push notification delivered to `POST /update`.
///
/// ```json
/// {
///   "time": "2024-05-01T12:00:00Z",
///   "detail": {
///     "result": "SUCCESS",
///     "repository-name": "app",
///     "image-tag": "prod-1.2.3"
///   }
/// }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateEvent {
    #[serde(default)]
    pub time: Option<String>,
    pub detail: UpdateEventDetail,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpdateEventDetail {
    /// Registry action result; absent means success.
    #[serde(default)]
    pub result: Option<String>,
    #[serde(rename = "repository-name")]
    pub repository_name: String,
    #[serde(rename = "image-tag")]
    pub image_tag: String,
}

impl UpdateEvent {
    /// Whether the registry reported the push as successful.
    ///
    /// Events without a `result` field are treated as successful.
    pub fn is_success(&self) -> bool {
        self.detail
            .result
            .as_deref()
            .map_or(true, |result| result.eq_ignore_ascii_case("SUCCESS"))
    }
}

/// Response body for `POST /update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateResponse {
    /// First container started for a tracked slot.
    Deployed { container_id: String },
    /// Running container replaced by a new one.
    Replaced {
        previous_container_id: String,
        container_id: String,
    },
    /// Event acknowledged without action.
    Ignored { reason: String },
    /// Rollout attempted and aborted; the slot is left `failed`.
    Failed { reason: String },
}

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}
