//! Camjam Feed Service
//!
//! Serves the newest traffic-camera videos published to a public S3 bucket.
//! A background task periodically lists the whole bucket, keeps the video
//! objects, orders them newest first and publishes the result as an immutable
//! snapshot. HTTP requests are answered from that snapshot and never touch S3.
//!
//! ## Features
//!
//! - **Paginated Listing**: Every cycle walks all `ListObjectsV2` pages before
//!   anything is published
//! - **Atomic Snapshots**: Readers always see one complete listing, old or new,
//!   never a mix
//! - **Stale on Failure**: A failed or timed-out cycle keeps the previous
//!   snapshot and backs off before the next attempt
//! - **Video API**: `/latest_videos` returns the newest items as JSON
//!
//! ## Architecture
//!
//! ```text
//! S3 Bucket                  Refresh Task               Snapshot Cache
//! ┌──────────────┐          ┌──────────────┐           ┌──────────────┐
//! │ ListObjects  │◀─────────│ Scheduler    │──────────▶│ Arc<Snapshot>│
//! │ V2 pages     │─────────▶│ (interval)   │  replace  │              │
//! └──────────────┘          └──────────────┘           └──────────────┘
//!                                  │                          │ read
//!                                  ▼                          ▼
//!                           ┌──────────────┐           ┌──────────────┐
//!                           │ Snapshot     │           │ Video API    │
//!                           │ Builder      │           │ (axum)       │
//!                           └──────────────┘           └──────────────┘
//! ```

pub mod api;
pub mod cache;
pub mod config;
pub mod lister;
pub mod s3_lister;
pub mod scheduler;
pub mod snapshot;

pub use api::{AppState, VideoResponse};
pub use cache::{CacheStatus, SnapshotCache};
pub use config::Config;
pub use lister::{list_all, ListingError, ListingPage, ObjectLister, ObjectRecord};
pub use s3_lister::S3Lister;
pub use scheduler::{RefreshOutcome, RefreshScheduler};
pub use snapshot::{Item, RefreshError, Snapshot, SnapshotBuilder};
