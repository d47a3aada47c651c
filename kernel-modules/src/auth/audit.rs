use kernel_core::storage_mirror::StorageWithStateMirror;
use serde_json::{json, Value};

pub const NAMESPACE: &str = "auth_audit_log";

/// Truncates a subject identifier to 16 characters before it ever reaches
/// a log line or a persisted audit record.
pub fn truncate_subject(subject: &str) -> String {
    subject.chars().take(16).collect()
}

/// Writes one audit record. Failures here are swallowed — an audit
/// hiccup must never block the operation it was describing.
pub async fn record(storage: &StorageWithStateMirror, event_type: &str, subject: &str, success: bool, details: Value) {
    let truncated = truncate_subject(subject);
    let key = format!("{}_{}", chrono::Utc::now().timestamp_millis(), super::revocation::digest(subject).chars().take(16).collect::<String>());
    let record = json!({
        "timestamp": chrono::Utc::now(),
        "event_type": event_type,
        "subject": truncated,
        "success": success,
        "details": details,
    });
    if let Err(e) = storage.set(NAMESPACE, &key, record).await {
        tracing::warn!(event_type, error = %e, "failed to write audit record");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::state_engine::StateEngine;
    use kernel_core::storage::Storage;
    use kernel_store::InMemoryAdapter;
    use std::sync::Arc;

    fn storage() -> StorageWithStateMirror {
        StorageWithStateMirror::new(Storage::new(Arc::new(InMemoryAdapter::new())), StateEngine::new())
    }

    #[tokio::test]
    async fn record_persists_truncated_subject() {
        let s = storage();
        record(&s, "auth.login", "a_very_long_user_identifier_here", true, json!({})).await;
        let keys = s.list_keys(NAMESPACE).await.unwrap();
        assert_eq!(keys.len(), 1);
        let entry = s.get(NAMESPACE, &keys[0]).await.unwrap().unwrap();
        assert_eq!(entry["subject"], json!("a_very_long_user"));
    }

    #[test]
    fn truncate_subject_caps_at_16_chars() {
        assert_eq!(truncate_subject("0123456789abcdefXYZ").len(), 16);
    }
}
