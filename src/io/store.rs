//! Object store access for remote (`s3://`) inputs.
//!
//! Remote items are never processed in place; the cache stager streams them to local disk
//! through the clients created here.

use crate::config::InputConfig;
use anyhow::{Context, Result};
use object_store::aws::AmazonS3Builder;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, RetryConfig};
use std::sync::Arc;
use std::time::Duration;

/// Parse an S3 URI into bucket and key components.
///
/// Accepts URIs in the format `s3://bucket/key/path`.
///
/// # Errors
/// Returns an error if the URI is malformed (missing scheme, bucket, or key).
pub fn parse_s3_uri(uri: &str) -> Result<(&str, &str)> {
    let without_scheme = uri
        .strip_prefix("s3://")
        .with_context(|| format!("Invalid S3 URI: expected 's3://' prefix in '{}'", uri))?;

    without_scheme
        .split_once('/')
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .with_context(|| format!("Invalid S3 URI: expected 's3://bucket/key' format in '{}'", uri))
}

/// Client options for downloading single large slide files.
fn create_client_options() -> ClientOptions {
    ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(5))
        // Whole-slide images can be several GB; the stream must not be cut off mid-download
        .with_timeout(Duration::from_secs(60 * 60))
        .with_pool_idle_timeout(Duration::from_secs(90))
}

/// Create retry configuration for transient failures.
fn create_retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 5,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

/// Create an S3 client for reading items from `bucket`.
///
/// Credentials and region are loaded from the environment (AWS_ACCESS_KEY_ID, AWS_REGION, ...)
/// unless the input configuration asks for anonymous access.
pub fn create_input_store(bucket: &str, input: &InputConfig) -> Result<Arc<dyn ObjectStore>> {
    tracing::debug!(
        "Creating {} S3 client for bucket: {}",
        if input.s3_anonymous { "anonymous" } else { "authenticated" },
        bucket
    );

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_client_options(create_client_options())
        .with_retry(create_retry_config());

    if let Some(region) = &input.s3_region {
        builder = builder.with_region(region);
    }
    if input.s3_anonymous {
        builder = builder.with_skip_signature(true);
    }

    Ok(Arc::new(builder.build()?))
}
