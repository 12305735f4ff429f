//! Operators the report board runs on.
//!
//! The board only needs list, read and write on one prefix, so any OpenDAL
//! service works. Two are wired up: an S3 bucket shared by every device, and
//! a process-local map for development and tests.

use anyhow::{bail, Context, Result};
use ito_core::config::{StorageBackend, StorageConfig};
use opendal::layers::{LoggingLayer, RetryLayer};
use opendal::Operator;

/// Attempts per board request before the error reaches the caller.
const INDEX_RETRIES: usize = 4;

/// Report board kept in process memory; published reports vanish with it.
pub fn build_memory_operator() -> Result<Operator> {
    Ok(Operator::new(opendal::services::Memory::default())
        .context("creating in-memory report index")?
        .layer(LoggingLayer::default())
        .finish())
}

/// Operator for the configured report index.
///
/// Empty credentials give anonymous access, which is enough to poll a
/// public board. Plaintext endpoints are refused under `enforce_tls` since
/// report contents would be visible to the network.
pub fn build_index_operator(
    storage: &StorageConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    match storage.backend {
        StorageBackend::Memory => {
            tracing::warn!("report index uses the in-memory backend; reports are not shared");
            build_memory_operator()
        }
        StorageBackend::S3 => {
            check_endpoint(storage)?;
            let mut builder = opendal::services::S3::default()
                .endpoint(&storage.endpoint)
                .region(&storage.region)
                .bucket(&storage.bucket);
            if access_key_id.is_empty() {
                builder = builder.allow_anonymous();
            } else {
                builder = builder
                    .access_key_id(access_key_id)
                    .secret_access_key(secret_access_key);
            }

            Ok(Operator::new(builder)
                .with_context(|| format!("creating report index for bucket {}", storage.bucket))?
                .layer(LoggingLayer::default())
                .layer(RetryLayer::new().with_max_times(INDEX_RETRIES).with_jitter())
                .finish())
        }
    }
}

fn check_endpoint(storage: &StorageConfig) -> Result<()> {
    if !storage.endpoint.starts_with("http://") {
        return Ok(());
    }
    if storage.enforce_tls {
        bail!(
            "report index endpoint {} is plaintext HTTP and storage.enforce_tls is set",
            storage.endpoint
        );
    }
    tracing::warn!(endpoint = %storage.endpoint, "report index endpoint is plaintext HTTP");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s3_index(endpoint: &str, enforce_tls: bool) -> StorageConfig {
        StorageConfig {
            endpoint: endpoint.into(),
            enforce_tls,
            ..Default::default()
        }
    }

    #[test]
    fn https_index_with_credentials() {
        let storage = s3_index("https://reports.example.org", true);
        assert!(build_index_operator(&storage, "publisher", "secret").is_ok());
    }

    #[test]
    fn anonymous_index_for_polling() {
        let storage = s3_index("https://reports.example.org", false);
        assert!(build_index_operator(&storage, "", "").is_ok());
    }

    #[test]
    fn plaintext_index_refused_under_enforce_tls() {
        let err = build_index_operator(&s3_index("http://reports.local:8333", true), "k", "s")
            .unwrap_err();
        assert!(err.to_string().contains("enforce_tls"));

        // Allowed, with a warning, when not enforced
        assert!(build_index_operator(&s3_index("http://reports.local:8333", false), "k", "s").is_ok());
    }

    #[test]
    fn memory_index_ignores_endpoint() {
        let storage = StorageConfig {
            backend: StorageBackend::Memory,
            ..s3_index("http://reports.local:8333", true)
        };
        assert!(build_index_operator(&storage, "", "").is_ok());
    }

    #[tokio::test]
    async fn memory_index_is_private_per_operator() {
        let a = build_memory_operator().unwrap();
        let b = build_memory_operator().unwrap();
        a.write("ito/reports/x.bin", b"r".to_vec()).await.unwrap();
        assert!(b.read("ito/reports/x.bin").await.is_err());
    }
}
