//! Update event fixtures.

use rollout_controller::config::WatchedImage;
use serde_json::{json, Value};

/// Registry host used by the default tracked image.
pub const TEST_REPOSITORY_URI: &str = "123456789012.dkr.ecr.eu-north-1.amazonaws.com";

/// Repository tracked by the default test server.
pub const TEST_REPOSITORY: &str = "app";

/// Tag prefix tracked by the default test server.
pub const TEST_TAG_PREFIX: &str = "prod";

/// A successful image push event for `repository:tag`.
pub fn push_event(repository: &str, tag: &str) -> Value {
    event_with_result(repository, tag, "SUCCESS")
}

/// A push event whose registry action failed.
pub fn failed_push_event(repository: &str, tag: &str) -> Value {
    event_with_result(repository, tag, "FAILURE")
}

fn event_with_result(repository: &str, tag: &str, result: &str) -> Value {
    json!({
        "version": "0",
        "id": "b1b7c2a4-0000-0000-0000-000000000000",
        "detail-type": "ECR Image Action",
        "source": "aws.ecr",
        "account": "123456789012",
        "time": "2024-05-01T12:00:00Z",
        "region": "eu-north-1",
        "detail": {
            "result": result,
            "repository-name": repository,
            "image-digest": "sha256:0d6c1f0e2a",
            "action-type": "PUSH",
            "image-tag": tag
        }
    })
}

/// The image the default test server tracks.
pub fn default_watched_image() -> WatchedImage {
    WatchedImage {
        repository_name: TEST_REPOSITORY.to_string(),
        repository_uri: TEST_REPOSITORY_URI.to_string(),
        image_tag_prefix: TEST_TAG_PREFIX.to_string(),
    }
}

/// Full image reference for `tag` in the default tracked repository.
pub fn default_image_reference(tag: &str) -> String {
    format!("{}/{}:{}", TEST_REPOSITORY_URI, TEST_REPOSITORY, tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_event_shape() {
        let event = push_event("app", "prod-1");
        assert_eq!(event["detail"]["result"], "SUCCESS");
        assert_eq!(event["detail"]["repository-name"], "app");
        assert_eq!(event["detail"]["image-tag"], "prod-1");

        assert_eq!(failed_push_event("app", "prod-1")["detail"]["result"], "FAILURE");
    }

    #[test]
    fn test_default_image_reference() {
        assert_eq!(
            default_image_reference("prod-2"),
            "123456789012.dkr.ecr.eu-north-1.amazonaws.com/app:prod-2"
        );
    }
}
