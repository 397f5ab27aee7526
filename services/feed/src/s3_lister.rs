use crate::config::S3Config;
use crate::lister::{ListingError, ListingPage, ObjectLister, ObjectRecord};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::types::Object;
use aws_sdk_s3::Client as S3Client;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

/// Lists video objects from an S3 bucket, one `ListObjectsV2` page at a time
pub struct S3Lister {
    client: S3Client,
    bucket: String,
    prefix: Option<String>,
    page_size: i32,
}

impl S3Lister {
    /// Create a new S3 lister
    pub async fn new(config: &S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        // Public buckets are listed with unsigned requests
        if config.anonymous {
            loader = loader.no_credentials();
        }

        let aws_config = loader.load().await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            anonymous = config.anonymous,
            "S3 lister initialized"
        );

        Self::from_client(client, config)
    }

    /// Wrap an already configured client
    pub fn from_client(client: S3Client, config: &S3Config) -> Self {
        Self {
            client,
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            page_size: config.page_size,
        }
    }

}

#[async_trait]
impl ObjectLister for S3Lister {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list_page(
        &self,
        continuation_token: Option<String>,
    ) -> Result<ListingPage, ListingError> {
        let mut request = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(self.page_size);

        if let Some(ref prefix) = self.prefix {
            request = request.prefix(prefix);
        }

        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ListingError::Request(DisplayErrorContext(&e).to_string()))?;

        let records: Vec<ObjectRecord> = response
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(to_record)
            .collect();

        let next_token = continuation(response.is_truncated, response.next_continuation_token)?;

        debug!(
            records = records.len(),
            has_more = next_token.is_some(),
            "Listed S3 page"
        );

        Ok(ListingPage {
            records,
            next_token,
        })
    }

    fn source(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Continuation token for the following page, `None` after the last one.
/// A truncated page without a token cannot be continued, so the listing fails.
fn continuation(
    is_truncated: Option<bool>,
    token: Option<String>,
) -> Result<Option<String>, ListingError> {
    if is_truncated != Some(true) {
        return Ok(None);
    }

    match token {
        Some(token) if !token.is_empty() => Ok(Some(token)),
        _ => Err(ListingError::Request(
            "truncated listing page without continuation token".to_string(),
        )),
    }
}

/// Convert an S3 object summary, dropping entries without a key
fn to_record(object: Object) -> Option<ObjectRecord> {
    let key = object.key.filter(|k| !k.is_empty())?;
    let last_modified = object
        .last_modified
        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()));

    Some(ObjectRecord { key, last_modified })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::primitives::DateTime as SmithyDateTime;
    use chrono::TimeZone;

    #[test]
    fn test_to_record_converts_timestamp() {
        let object = Object::builder()
            .key("JamCams_00001.01234.mp4")
            .last_modified(SmithyDateTime::from_secs(1_705_314_645))
            .build();

        let record = to_record(object).unwrap();
        assert_eq!(record.key, "JamCams_00001.01234.mp4");
        assert_eq!(
            record.last_modified,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 45).unwrap())
        );
    }

    #[test]
    fn test_to_record_without_timestamp() {
        let object = Object::builder().key("video.mp4").build();

        let record = to_record(object).unwrap();
        assert!(record.last_modified.is_none());
    }

    #[test]
    fn test_to_record_skips_missing_key() {
        assert!(to_record(Object::builder().build()).is_none());
        assert!(to_record(Object::builder().key("").build()).is_none());
    }

    #[test]
    fn test_continuation_follows_truncated_pages() {
        assert_eq!(
            continuation(Some(true), Some("abc".to_string())).unwrap(),
            Some("abc".to_string())
        );
    }

    #[test]
    fn test_continuation_ends_on_last_page() {
        assert_eq!(continuation(Some(false), None).unwrap(), None);
        assert_eq!(continuation(None, None).unwrap(), None);
        // A stray token on a complete page is ignored
        assert_eq!(continuation(Some(false), Some("abc".to_string())).unwrap(), None);
    }

    #[test]
    fn test_truncated_page_without_token_fails() {
        assert!(matches!(
            continuation(Some(true), None),
            Err(ListingError::Request(_))
        ));
        assert!(matches!(
            continuation(Some(true), Some(String::new())),
            Err(ListingError::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_source_names_bucket() {
        let config = S3Config::default();
        let client = S3Client::from_conf(
            S3ConfigBuilder::new()
                .behavior_version(BehaviorVersion::latest())
                .region(aws_config::Region::new("eu-west-1"))
                .build(),
        );

        let lister = S3Lister::from_client(client, &config);
        assert_eq!(lister.source(), "s3://jamcams.tfl.gov.uk");
    }
}
