//! Canary channel: a durably committed marker written just before a crash
//! and looked up again after recovery.

use crate::errors::ProtocolError;
use crate::rpc::{RpcError, ServerRpc};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CanaryDocument {
    /// Unix seconds at insertion, with sub-second precision.
    pub x: f64,
}

impl CanaryDocument {
    pub fn now() -> Self {
        Self {
            x: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
        }
    }
}

impl std::fmt::Display for CanaryDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{x: {}}}", self.x)
    }
}

/// Insert `doc` with a journaled write concern. Returns once the server
/// acknowledged the on-disk commit.
pub async fn insert(
    rpc: &dyn ServerRpc,
    db: &str,
    collection: &str,
    doc: &CanaryDocument,
) -> Result<(), RpcError> {
    let command = json!({
        "insert": collection,
        "documents": [doc],
        "writeConcern": {"j": true},
    });
    let reply = rpc.run_command(db, command).await?;
    let first_error = reply
        .get("writeErrors")
        .and_then(Value::as_array)
        .and_then(|errors| errors.first());
    if let Some(first) = first_error {
        return Err(RpcError::Command {
            command: "insert".to_string(),
            code: first.get("code").and_then(Value::as_i64),
            code_name: "WriteError".to_string(),
            errmsg: first
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("write error")
                .to_string(),
        });
    }
    info!(%doc, db, collection, "Canary inserted");
    Ok(())
}

/// Look `doc` up. With no document to check this is a no-op. A missing
/// document is fatal unless `tolerate_loss` is set, in which case it is
/// logged as a discrepancy.
pub async fn validate(
    rpc: &dyn ServerRpc,
    db: &str,
    collection: &str,
    doc: Option<&CanaryDocument>,
    tolerate_loss: bool,
) -> Result<(), ProtocolError> {
    let Some(doc) = doc else {
        return Ok(());
    };
    let reply = rpc
        .run_command(
            db,
            json!({"find": collection, "filter": {"x": doc.x}, "limit": 1}),
        )
        .await?;
    let found = reply
        .pointer("/cursor/firstBatch")
        .and_then(Value::as_array)
        .is_some_and(|batch| !batch.is_empty());
    if found {
        info!(%doc, "Canary found");
        return Ok(());
    }
    if tolerate_loss {
        warn!(%doc, "Canary missing, tolerated because writes are not durable");
        return Ok(());
    }
    Err(ProtocolError::CanaryMissing {
        canary: doc.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::commands::testing::ScriptedRpc;

    const DOC: CanaryDocument = CanaryDocument { x: 1_700_000_000.25 };

    #[tokio::test]
    async fn test_insert_requests_journaled_write() {
        let rpc = ScriptedRpc::new().reply("insert", json!({"ok": 1, "n": 1}));
        insert(&rpc, "power", "cycle", &DOC).await.unwrap();
        let sent = &rpc.called("insert")[0];
        assert_eq!(sent["writeConcern"], json!({"j": true}));
        assert_eq!(sent["documents"][0]["x"], json!(1_700_000_000.25));
    }

    #[tokio::test]
    async fn test_insert_surfaces_write_errors() {
        let rpc = ScriptedRpc::new().reply(
            "insert",
            json!({"ok": 1, "n": 0, "writeErrors": [{"index": 0, "code": 11000, "errmsg": "dup key"}]}),
        );
        let err = insert(&rpc, "power", "cycle", &DOC).await.unwrap_err();
        assert!(err.to_string().contains("dup key"));
    }

    #[tokio::test]
    async fn test_validate_without_document_is_noop() {
        let rpc = ScriptedRpc::new();
        validate(&rpc, "power", "cycle", None, false).await.unwrap();
        assert!(rpc.called("find").is_empty());
    }

    #[tokio::test]
    async fn test_validate_finds_document() {
        let rpc = ScriptedRpc::new().reply(
            "find",
            json!({"ok": 1, "cursor": {"firstBatch": [{"x": 1_700_000_000.25}]}}),
        );
        validate(&rpc, "power", "cycle", Some(&DOC), false)
            .await
            .unwrap();
        assert_eq!(rpc.called("find")[0]["filter"], json!({"x": 1_700_000_000.25}));
    }

    #[tokio::test]
    async fn test_missing_canary_fails_unless_tolerated() {
        let rpc =
            ScriptedRpc::new().reply("find", json!({"ok": 1, "cursor": {"firstBatch": []}}));
        let err = validate(&rpc, "power", "cycle", Some(&DOC), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CanaryMissing { .. }));
        validate(&rpc, "power", "cycle", Some(&DOC), true)
            .await
            .unwrap();
    }
}
