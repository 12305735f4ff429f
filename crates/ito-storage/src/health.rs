//! Report index health check

use anyhow::Result;
use opendal::Operator;

/// Verify the report index is reachable by listing the root
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("report index health check failed: {e}"))
}

/// Returns true if the report index is reachable, false otherwise (non-panicking)
pub async fn is_healthy(op: &Operator) -> bool {
    check_health(op).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_operator_is_healthy() {
        let op = crate::build_memory_operator().unwrap();
        assert!(is_healthy(&op).await);
    }
}
