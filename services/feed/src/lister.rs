//! Remote object listing contract.
//!
//! A lister only knows how to fetch one page at a time. [`list_all`] turns
//! any lister into a lazy stream of records that follows continuation tokens
//! until the listing is exhausted or a page request fails.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;

/// Errors produced while listing the remote source.
#[derive(Debug, Error)]
pub enum ListingError {
    #[error("List request failed: {0}")]
    Request(String),

    #[error("Listing timed out after {0:?}")]
    TimedOut(Duration),

    #[error("Listing returned continuation token {0:?} twice")]
    RepeatedToken(String),
}

/// One object reported by the remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Object key within the bucket
    pub key: String,
    /// Last modified timestamp, if the source reported one
    pub last_modified: Option<DateTime<Utc>>,
}

impl ObjectRecord {
    pub fn new(key: impl Into<String>, last_modified: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            last_modified: Some(last_modified),
        }
    }
}

/// A single page of listing results.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub records: Vec<ObjectRecord>,
    /// Token for the next page, `None` on the last page
    pub next_token: Option<String>,
}

/// Paginated source of object records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectLister: Send + Sync {
    /// Fetch the page that starts at `continuation_token` (first page when `None`).
    async fn list_page(
        &self,
        continuation_token: Option<String>,
    ) -> Result<ListingPage, ListingError>;

    /// Human readable name of the source, used in logs.
    fn source(&self) -> String;
}

/// Stream every record of the listing, page after page.
///
/// The stream ends after the last page. A failed page request is yielded as
/// an error and ends the stream; records from earlier pages have already
/// been yielded, so consumers that need all-or-nothing must discard them.
pub fn list_all<L>(lister: &L) -> BoxStream<'_, Result<ObjectRecord, ListingError>>
where
    L: ObjectLister + ?Sized,
{
    Box::pin(try_stream! {
        let mut token: Option<String> = None;
        let mut seen = HashSet::new();

        loop {
            let page = lister.list_page(token.clone()).await?;

            for record in page.records {
                yield record;
            }

            match page.next_token {
                Some(next) if !seen.insert(next.clone()) => {
                    Err::<(), _>(ListingError::RepeatedToken(next))?;
                }
                Some(next) => token = Some(next),
                None => break,
            }
        }
    })
}
