//! In-memory table of tracked images.
//!
//! One row per (repository, tag prefix) pair from configuration. Rows are
//! keyed by the repository name with any leading `/` stripped, so the
//! configured `/app` and the webhook's `app` land on the same entry.
//!
//! The table has no locking of its own; the rollout engine owns it behind a
//! single mutex held for the whole of each update.

use crate::config::WatchedImage;
use crate::services::container_runtime::ContainerSummary;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tracing::info;

/// Lifecycle of a tracked slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RolloutStatus {
    /// No container owned yet.
    Idle,
    /// A container is owned and the last rollout completed.
    Running,
    /// Tags updated, container swap in progress.
    ///
    /// Set only while the engine lock is held, so it is observable only on a
    /// row whose rollout task was cancelled before the swap finished.
    Pending,
    /// Tags updated but the container swap was aborted.
    Failed { reason: String },
}

/// One tracked (repository, tag prefix) slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedImage {
    pub repository_name: String,
    pub repository_uri: String,
    pub tag_prefix: String,
    pub current_tag: String,
    pub previous_tag: String,
    /// Empty when no container is owned.
    pub container_id: String,
    pub last_updated: Option<DateTime<Utc>>,
    pub status: RolloutStatus,
}

impl TrackedImage {
    pub fn new(repository_name: &str, repository_uri: &str, tag_prefix: &str) -> Self {
        Self {
            repository_name: repository_name.to_string(),
            repository_uri: repository_uri.to_string(),
            tag_prefix: tag_prefix.to_string(),
            current_tag: String::new(),
            previous_tag: String::new(),
            container_id: String::new(),
            last_updated: None,
            status: RolloutStatus::Idle,
        }
    }

    /// Full image reference for `tag` in this slot's repository.
    pub fn image_reference(&self, tag: &str) -> String {
        image_reference(&self.repository_uri, &self.repository_name, tag)
    }

    pub fn has_container(&self) -> bool {
        !self.container_id.is_empty()
    }
}

impl From<&WatchedImage> for TrackedImage {
    fn from(watched: &WatchedImage) -> Self {
        Self::new(
            &watched.repository_name,
            &watched.repository_uri,
            &watched.image_tag_prefix,
        )
    }
}

/// Table key for a repository name: leading `/` removed.
pub fn normalize_repository(name: &str) -> &str {
    name.trim_start_matches('/')
}

/// Build `uri/name:tag`, tolerating a trailing `/` on the uri and a
/// leading `/` on the name.
pub fn image_reference(repository_uri: &str, repository_name: &str, tag: &str) -> String {
    format!(
        "{}/{}:{}",
        repository_uri.trim_end_matches('/'),
        normalize_repository(repository_name),
        tag
    )
}

/// Result of looking up an update event in the table.
#[derive(Debug)]
pub enum TableLookup<'a> {
    UnknownRepository,
    NoMatchingPrefix,
    Matched(&'a mut TrackedImage),
}

/// Tracked images grouped by normalized repository name.
#[derive(Debug, Default)]
pub struct RolloutTable {
    repositories: HashMap<String, Vec<TrackedImage>>,
}

impl RolloutTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the table from configuration, one row per (repository, prefix).
    ///
    /// A repeated pair keeps only its first row.
    pub fn from_watched_images(watched: &[WatchedImage]) -> Self {
        let mut table = Self::new();
        for image in watched {
            table.track(TrackedImage::from(image));
        }
        table
    }

    /// Add a row unless its (repository, prefix) pair is already tracked.
    pub fn track(&mut self, image: TrackedImage) -> bool {
        let rows = self
            .repositories
            .entry(normalize_repository(&image.repository_name).to_string())
            .or_default();
        if rows.iter().any(|row| row.tag_prefix == image.tag_prefix) {
            return false;
        }
        rows.push(image);
        true
    }

    /// Seed rows from containers that already exist.
    ///
    /// A container belongs to the row whose `uri/name:prefix` is the longest
    /// prefix of its image reference, so overlapping prefixes such as `v1`
    /// and `v1.2` never claim the same container. A running container is
    /// preferred over a stopped one; otherwise the last listed candidate
    /// wins. Returns the number of rows seeded.
    pub fn reconcile(&mut self, containers: &[ContainerSummary]) -> usize {
        let mut seeded = 0;

        for rows in self.repositories.values_mut() {
            let prefix_refs: Vec<String> = rows
                .iter()
                .map(|row| row.image_reference(&row.tag_prefix))
                .collect();

            for (row, prefix_ref) in rows.iter_mut().zip(&prefix_refs) {
                let candidates = containers
                    .iter()
                    .filter(|c| owning_prefix(&c.image_ref, &prefix_refs) == Some(prefix_ref));
                let chosen = candidates
                    .clone()
                    .filter(|c| c.is_running())
                    .last()
                    .or_else(|| candidates.last());

                let Some(container) = chosen else {
                    continue;
                };
                let Some((_, tag)) = container.image_ref.rsplit_once(':') else {
                    continue;
                };

                row.current_tag = tag.to_string();
                row.container_id = container.id.clone();
                row.status = RolloutStatus::Running;
                seeded += 1;

                info!(
                    target: "rc.repositories.rollout_table",
                    repository = %row.repository_name,
                    tag_prefix = %row.tag_prefix,
                    current_tag = %row.current_tag,
                    container_id = %row.container_id,
                    "Seeded tracked image from existing container"
                );
            }
        }

        seeded
    }

    /// Find the row for `repository` whose prefix matches `tag`.
    ///
    /// When several prefixes match, the longest wins.
    pub fn find_match_mut(&mut self, repository: &str, tag: &str) -> TableLookup<'_> {
        let Some(rows) = self.repositories.get_mut(normalize_repository(repository)) else {
            return TableLookup::UnknownRepository;
        };

        match rows
            .iter_mut()
            .filter(|row| tag.starts_with(&row.tag_prefix))
            .max_by_key(|row| row.tag_prefix.len())
        {
            Some(row) => TableLookup::Matched(row),
            None => TableLookup::NoMatchingPrefix,
        }
    }

    pub fn contains_repository(&self, repository: &str) -> bool {
        self.repositories.contains_key(normalize_repository(repository))
    }

    /// Stop tracking every prefix of `repository`, returning the removed rows.
    pub fn remove_repository(&mut self, repository: &str) -> Option<Vec<TrackedImage>> {
        self.repositories.remove(normalize_repository(repository))
    }

    /// Cloned rows, ordered by repository then prefix.
    pub fn rows(&self) -> Vec<TrackedImage> {
        let mut rows: Vec<TrackedImage> = self.repositories.values().flatten().cloned().collect();
        rows.sort_by(|a, b| {
            normalize_repository(&a.repository_name)
                .cmp(normalize_repository(&b.repository_name))
                .then_with(|| a.tag_prefix.cmp(&b.tag_prefix))
        });
        rows
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.repositories.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The longest of `prefix_refs` that `image_ref` starts with.
fn owning_prefix<'a>(image_ref: &str, prefix_refs: &'a [String]) -> Option<&'a String> {
    prefix_refs
        .iter()
        .filter(|prefix_ref| image_ref.starts_with(prefix_ref.as_str()))
        .max_by_key(|prefix_ref| prefix_ref.len())
}
