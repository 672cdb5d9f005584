//! Best-effort audit trail.
//!
//! One record per administrative action and one per proxied request. Write
//! failures log and vanish — audit must never fail the caller.

use std::sync::Arc;

use chrono::Utc;

use aiguard_store::AuditRepo;
use aiguard_types::{AuditAction, AuditLog, AuditStatus};

/// Client attribution attached to every audit entry.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

pub struct AuditWriter {
    repo: Arc<dyn AuditRepo>,
}

impl AuditWriter {
    pub fn new(repo: Arc<dyn AuditRepo>) -> Self {
        Self { repo }
    }

    /// Append one entry. Failures are logged, never raised.
    #[allow(clippy::too_many_arguments)]
    pub async fn write(
        &self,
        user_id: Option<&str>,
        action: AuditAction,
        resource_type: &str,
        resource_id: Option<&str>,
        details: serde_json::Value,
        client: &ClientInfo,
        status: AuditStatus,
        error: Option<String>,
    ) {
        let log = AuditLog {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.map(String::from),
            action: action.name(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.map(String::from),
            details,
            client_ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
            timestamp: Utc::now(),
            status,
            error,
        };

        if let Err(e) = self.repo.append_audit(log).await {
            tracing::warn!(error = %e, "Failed to append audit record");
        }
    }

    /// Convenience for successful administrative actions.
    pub async fn success(
        &self,
        user_id: &str,
        action: AuditAction,
        resource_type: &str,
        resource_id: Option<&str>,
        details: serde_json::Value,
        client: &ClientInfo,
    ) {
        self.write(
            Some(user_id),
            action,
            resource_type,
            resource_id,
            details,
            client,
            AuditStatus::Success,
            None,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiguard_store::{MemoryStore, StoreError};
    use aiguard_types::AuditLog;

    #[tokio::test]
    async fn writes_an_entry_with_the_action_name() {
        let store = MemoryStore::new();
        let writer = AuditWriter::new(Arc::new(store.clone()));

        writer
            .success(
                "u1",
                AuditAction::ProjectCreated,
                "project",
                Some("p1"),
                serde_json::json!({"name": "demo"}),
                &ClientInfo {
                    ip: Some("10.0.0.9".to_string()),
                    user_agent: Some("curl/8".to_string()),
                },
            )
            .await;

        let entries = store.audit_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "project.created");
        assert_eq!(entries[0].client_ip.as_deref(), Some("10.0.0.9"));
        assert_eq!(entries[0].status, AuditStatus::Success);
    }

    struct FailingAudit;

    #[async_trait::async_trait]
    impl AuditRepo for FailingAudit {
        async fn append_audit(&self, _log: AuditLog) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk full".to_string()))
        }
    }

    #[tokio::test]
    async fn write_failure_is_swallowed() {
        let writer = AuditWriter::new(Arc::new(FailingAudit));
        writer
            .write(
                None,
                AuditAction::Api("POST".to_string()),
                "proxy",
                None,
                serde_json::Value::Null,
                &ClientInfo::default(),
                AuditStatus::Failure,
                Some("upstream 502".to_string()),
            )
            .await;
    }
}
