//! Registry push webhook handler.
//!
//! Runs after the admission and auth middleware. Parses the event and hands
//! the (repository, tag) pair to the rollout engine.
//!
//! The rollout runs on its own task. A request timeout or a client that
//! disconnects drops only the wait for the result, never a half-finished
//! container swap.

use crate::errors::RcError;
use crate::models::{UpdateEvent, UpdateResponse};
use crate::routes::AppState;
use crate::services::rollout_engine::RolloutOutcome;
use axum::{body::Bytes, extract::State, Json};
use std::sync::Arc;
use tracing::instrument;

/// Handler for POST /update
///
/// The body is parsed as JSON regardless of Content-Type.
///
/// # Response
///
/// - 200 with `{"outcome": "deployed" | "replaced" | "ignored", ...}`
/// - 200 with `{"outcome": "failed", "reason": ...}` if a registry or
///   container runtime call failed; the event is not redelivered
/// - 400 if the body is not a valid update event
#[instrument(skip_all, name = "rc.handlers.update")]
pub async fn handle_update(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<UpdateResponse>, RcError> {
    let event: UpdateEvent = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!(target: "rc.handlers.update", error = %e, "Malformed update event");
        RcError::BadRequest("Failed to parse request body".to_string())
    })?;

    let detail = &event.detail;
    if detail.repository_name.trim().is_empty() || detail.image_tag.trim().is_empty() {
        return Err(RcError::BadRequest(
            "repository-name and image-tag must not be empty".to_string(),
        ));
    }

    if !event.is_success() {
        tracing::info!(
            target: "rc.handlers.update",
            repository = %detail.repository_name,
            tag = %detail.image_tag,
            result = ?detail.result,
            "Ignoring unsuccessful registry action"
        );
        return Ok(Json(UpdateResponse::Ignored {
            reason: "registry action did not succeed".to_string(),
        }));
    }

    let engine = state.engine.clone();
    let repository = detail.repository_name.clone();
    let tag = detail.image_tag.clone();
    let result = tokio::spawn(async move { engine.handle_update(&repository, &tag).await })
        .await
        .map_err(|e| {
            tracing::error!(target: "rc.handlers.update", error = %e, "Rollout task panicked");
            RcError::Internal
        })?;

    match result {
        Ok(outcome) => Ok(Json(outcome.into())),
        Err(e) => {
            tracing::warn!(
                target: "rc.handlers.update",
                repository = %detail.repository_name,
                tag = %detail.image_tag,
                error = %e,
                "Acknowledging failed rollout"
            );
            Ok(Json(UpdateResponse::Failed {
                reason: e.to_string(),
            }))
        }
    }
}

impl From<RolloutOutcome> for UpdateResponse {
    fn from(outcome: RolloutOutcome) -> Self {
        match outcome {
            RolloutOutcome::UnknownRepository => UpdateResponse::Ignored {
                reason: "repository is not tracked".to_string(),
            },
            RolloutOutcome::NoMatchingPrefix => UpdateResponse::Ignored {
                reason: "no tracked tag prefix matches".to_string(),
            },
            RolloutOutcome::Deployed { container_id } => UpdateResponse::Deployed { container_id },
            RolloutOutcome::Replaced {
                old_container_id,
                container_id,
            } => UpdateResponse::Replaced {
                previous_container_id: old_container_id,
                container_id,
            },
        }
    }
}
