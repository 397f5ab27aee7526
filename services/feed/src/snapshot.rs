//! Snapshot construction.
//!
//! A [`Snapshot`] is the result of one complete listing pass: eligible
//! records mapped to [`Item`]s, newest first. Snapshots are built off to the
//! side and never modified once published.

use crate::config::{S3Config, SnapshotConfig, KEY_PLACEHOLDER};
use crate::lister::{ListingError, ObjectRecord};
use chrono::{DateTime, Utc};
use futures::{pin_mut, Stream, StreamExt};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Errors that abort a refresh cycle.
#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("Source listing failed: {0}")]
    SourceListingFailed(#[from] ListingError),
}

/// Rejected item construction
#[derive(Debug, Error, PartialEq)]
#[error("Invalid item location {location:?}: {reason}")]
pub struct InvalidItem {
    pub location: String,
    pub reason: String,
}

/// One discovered video
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    location: String,
    observed_at: DateTime<Utc>,
}

impl Item {
    /// Create an item. `location` must be an absolute URL.
    pub fn new(location: impl Into<String>, observed_at: DateTime<Utc>) -> Result<Self, InvalidItem> {
        let location = location.into();

        let parsed = Url::parse(&location).map_err(|e| InvalidItem {
            location: location.clone(),
            reason: e.to_string(),
        })?;

        if !parsed.has_host() {
            return Err(InvalidItem {
                location,
                reason: "missing host".to_string(),
            });
        }

        Ok(Self {
            location,
            observed_at,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn observed_at(&self) -> DateTime<Utc> {
        self.observed_at
    }
}

/// Ordered, immutable view of the latest videos
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    items: Vec<Item>,
    generation: u64,
    built_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// The snapshot served before the first successful refresh
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a snapshot from unordered items, newest first.
    ///
    /// The sort is stable, so items with equal timestamps keep their input order.
    pub fn from_items(mut items: Vec<Item>) -> Self {
        items.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));

        Self {
            items,
            generation: 0,
            built_at: Some(Utc::now()),
        }
    }

    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// At most `limit` of the newest items
    pub fn latest(&self, limit: usize) -> &[Item] {
        &self.items[..limit.min(self.items.len())]
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Publish sequence number, 0 until installed in a cache
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub(crate) fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}

/// Turns a raw listing into a [`Snapshot`]
#[derive(Debug, Clone)]
pub struct SnapshotBuilder {
    eligible_suffix: String,
    base_url: String,
}

impl SnapshotBuilder {
    pub fn new(eligible_suffix: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            eligible_suffix: eligible_suffix.into(),
            base_url: base_url.into(),
        }
    }

    pub fn from_config(snapshot: &SnapshotConfig, s3: &S3Config) -> Self {
        Self::new(snapshot.eligible_suffix.clone(), s3.base_url.clone())
    }

    /// Whether a key should be published
    pub fn is_eligible(&self, key: &str) -> bool {
        !key.ends_with('/') && key.ends_with(&self.eligible_suffix)
    }

    /// Public address of an object key
    pub fn location_for(&self, key: &str) -> String {
        self.base_url.replace(KEY_PLACEHOLDER, key)
    }

    /// Consume a complete listing stream.
    ///
    /// Fails on the first listing error; whatever was collected before it is
    /// dropped, so a partial listing is never turned into a snapshot.
    pub async fn build<S>(&self, records: S) -> Result<Snapshot, RefreshError>
    where
        S: Stream<Item = Result<ObjectRecord, ListingError>>,
    {
        pin_mut!(records);

        let mut items = Vec::new();
        let mut seen = 0usize;

        while let Some(record) = records.next().await {
            let record = record?;
            seen += 1;

            if let Some(item) = self.to_item(record) {
                items.push(item);
            }
        }

        debug!(seen, eligible = items.len(), "Listing consumed");

        Ok(Snapshot::from_items(items))
    }

    /// Build from records that are already in memory
    #[cfg(test)]
    pub fn build_from_records<I>(&self, records: I) -> Snapshot
    where
        I: IntoIterator<Item = ObjectRecord>,
    {
        let items = records
            .into_iter()
            .filter_map(|record| self.to_item(record))
            .collect();

        Snapshot::from_items(items)
    }

    fn to_item(&self, record: ObjectRecord) -> Option<Item> {
        if !self.is_eligible(&record.key) {
            return None;
        }

        let Some(observed_at) = record.last_modified else {
            debug!(key = %record.key, "Skipping object without last modified time");
            return None;
        };

        match Item::new(self.location_for(&record.key), observed_at) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(key = %record.key, error = %e, "Skipping object with invalid location");
                None
            }
        }
    }
}
