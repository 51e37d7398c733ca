//! Protocol steps built from server commands.

use super::{RpcError, ServerRpc};
use crate::errors::ProtocolError;
use crate::wait::{WaitPolicy, wait_until};
use rand::Rng;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

/// Documents inserted per `insert` command while seeding.
const SEED_BATCH: u64 = 1_000;
const SEED_MAX_DOC_LEN: usize = 1_024;

pub async fn is_master(rpc: &dyn ServerRpc) -> Result<Value, RpcError> {
    rpc.run_command("admin", json!({"isMaster": 1})).await
}

/// Wait until the server answers `isMaster` at all.
pub async fn wait_for_liveness(rpc: &dyn ServerRpc, policy: WaitPolicy) -> Result<(), ProtocolError> {
    let port = rpc.endpoint().port;
    wait_until(policy, move || async move { is_master(rpc).await.map(|_| true) })
        .await
        .map(|attempts| debug!(port, attempts, "Server answered isMaster"))
        .map_err(|timeout| {
            warn!(port, %timeout, "Server never answered isMaster");
            ProtocolError::NotLive {
                port,
                attempts: timeout.attempts,
            }
        })
}

/// Wait until the server reports itself primary (`ismaster: true`).
pub async fn wait_for_primary(rpc: &dyn ServerRpc, policy: WaitPolicy) -> Result<(), ProtocolError> {
    let port = rpc.endpoint().port;
    wait_until(policy, move || async move {
        is_master(rpc)
            .await
            .map(|reply| reply.get("ismaster").and_then(Value::as_bool) == Some(true))
    })
    .await
    .map(|_| ())
    .map_err(|timeout| {
        warn!(port, %timeout, "Server never became primary");
        ProtocolError::NotPrimary { port }
    })
}

/// Log `buildinfo` and `serverStatus`. Failures are only logged.
pub async fn log_server_info(rpc: &dyn ServerRpc) {
    for command in [json!({"buildinfo": 1}), json!({"serverStatus": 1})] {
        match rpc.run_command("admin", command.clone()).await {
            Ok(reply) => info!("{}: {}", super::command_name(&command), reply),
            Err(err) => warn!(error = %err, "Could not fetch {}", super::command_name(&command)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplSetAction {
    Initiated,
    Reconfigured,
    Unchanged,
}

/// Make the server primary of a single-member replica set whose only
/// member is `host_port`: initiate on first start, force-reconfigure when
/// the member host changed, then wait for primary.
pub async fn ensure_replica_set(
    rpc: &dyn ServerRpc,
    repl_set: &str,
    host_port: &str,
    primary_wait: WaitPolicy,
) -> Result<ReplSetAction, ProtocolError> {
    let existing = rpc
        .run_command("local", json!({"find": "system.replset", "limit": 1}))
        .await?;
    let first_start = existing
        .pointer("/cursor/firstBatch")
        .and_then(Value::as_array)
        .is_none_or(|batch| batch.is_empty());

    let action = if first_start {
        info!(repl_set, host_port, "Initiating replica set");
        rpc.run_command(
            "admin",
            json!({
                "replSetInitiate": {
                    "_id": repl_set,
                    "members": [{"_id": 0, "host": host_port}],
                }
            }),
        )
        .await?;
        ReplSetAction::Initiated
    } else {
        let reply = match rpc.run_command("admin", json!({"replSetGetConfig": 1})).await {
            Err(err) if err.code_name() == Some("NotYetInitialized") => {
                return Err(ProtocolError::ReplSetNotInitialized {
                    repl_set: repl_set.to_string(),
                });
            }
            other => other?,
        };
        let mut config = reply.get("config").cloned().unwrap_or(Value::Null);
        let member = config
            .get_mut("members")
            .and_then(|members| members.get_mut(0))
            .and_then(Value::as_object_mut)
            .ok_or_else(|| RpcError::Malformed {
                output: reply.to_string(),
            })?;

        if member.get("host").and_then(Value::as_str) == Some(host_port) {
            ReplSetAction::Unchanged
        } else {
            info!(repl_set, host_port, "Member host changed, forcing reconfig");
            member.insert("host".to_string(), Value::String(host_port.to_string()));
            rpc.run_command("admin", json!({"replSetReconfig": config, "force": true}))
                .await?;
            ReplSetAction::Reconfigured
        }
    };

    wait_for_primary(rpc, primary_wait).await?;
    match rpc.run_command("admin", json!({"replSetGetStatus": 1})).await {
        Ok(status) => info!("replSetGetStatus: {}", status),
        Err(err) => warn!(error = %err, "Could not fetch replSetGetStatus"),
    }
    Ok(action)
}

pub async fn set_feature_compatibility_version(
    rpc: &dyn ServerRpc,
    version: &str,
) -> Result<(), RpcError> {
    info!(version, "Setting feature compatibility version");
    rpc.run_command(
        "admin",
        json!({"setFeatureCompatibilityVersion": version, "confirm": true}),
    )
    .await
    .map(|_| ())
}

/// Ask the server to shut down. The server dropping the connection while
/// it goes away counts as acknowledgement.
pub async fn shutdown(rpc: &dyn ServerRpc) -> Result<(), ProtocolError> {
    let port = rpc.endpoint().port;
    match rpc
        .run_command("admin", json!({"shutdown": 1, "force": true}))
        .await
    {
        Ok(_) => Ok(()),
        Err(err @ RpcError::Command { .. }) if err.is_network_error() => {
            debug!(port, "Connection closed by shutdown");
            Ok(())
        }
        Err(err) => Err(ProtocolError::ShutdownNotAcknowledged {
            port,
            message: err.to_string(),
        }),
    }
}

pub async fn count(rpc: &dyn ServerRpc, db: &str, collection: &str) -> Result<u64, RpcError> {
    let reply = rpc.run_command(db, json!({"count": collection})).await?;
    Ok(reply.get("n").and_then(Value::as_u64).unwrap_or(0))
}

fn random_documents(n: u64) -> Vec<Value> {
    let mut rng = rand::rng();
    (0..n)
        .map(|_| {
            let len = rng.random_range(1..=SEED_MAX_DOC_LEN);
            let doc: String = (0..len)
                .map(|_| char::from(rng.random_range(b'a'..=b'z')))
                .collect();
            json!({"x": rng.random_range(0..100_000), "doc": doc})
        })
        .collect()
}

/// Insert random documents into `db.collection` until it holds at least
/// `target` documents.
pub async fn seed_docs(
    rpc: &dyn ServerRpc,
    db: &str,
    collection: &str,
    target: u64,
) -> Result<u64, ProtocolError> {
    let mut current = count(rpc, db, collection).await?;
    info!(db, collection, current, target, "Seeding documents");
    while current < target {
        let documents = random_documents((target - current).min(SEED_BATCH));
        rpc.run_command(
            db,
            json!({"insert": collection, "documents": documents, "ordered": false}),
        )
        .await?;
        let next = count(rpc, db, collection).await?;
        if next <= current {
            return Err(RpcError::Malformed {
                output: format!("document count stuck at {current} while seeding"),
            }
            .into());
        }
        current = next;
    }
    Ok(current)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub validated: Vec<String>,
    /// Namespaces whose outcome is tolerated (dropped concurrently, or
    /// reported as affected by an unclean shutdown).
    pub permitted: Vec<String>,
    pub invalid: Vec<String>,
}

fn mentions_unclean_shutdown(text: &str) -> bool {
    text.to_lowercase().contains("unclean shutdown")
}

fn string_list(reply: &Value, field: &str) -> Vec<String> {
    reply
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn batch_names(reply: &Value, pointer: &str) -> Vec<String> {
    reply
        .pointer(pointer)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Run a full `validate` on every collection of every database.
pub async fn validate_collections(rpc: &dyn ServerRpc) -> Result<ValidationReport, RpcError> {
    let mut report = ValidationReport::default();
    let databases = rpc
        .run_command("admin", json!({"listDatabases": 1, "nameOnly": true}))
        .await?;

    for db in batch_names(&databases, "/databases") {
        let collections = rpc
            .run_command(
                &db,
                json!({
                    "listCollections": 1,
                    "filter": {"type": "collection"},
                    "nameOnly": true,
                    "cursor": {"batchSize": 100_000},
                }),
            )
            .await?;

        for collection in batch_names(&collections, "/cursor/firstBatch") {
            let ns = format!("{db}.{collection}");
            match rpc
                .run_command(&db, json!({"validate": collection, "full": true}))
                .await
            {
                Err(err) if err.code_name() == Some("NamespaceNotFound") => {
                    debug!(ns = %ns, "Collection dropped before validation");
                    report.permitted.push(ns);
                }
                Err(RpcError::Command { ref errmsg, .. }) if mentions_unclean_shutdown(errmsg) => {
                    warn!(ns = %ns, errmsg = %errmsg, "Validation skipped after unclean shutdown");
                    report.permitted.push(ns);
                }
                Err(err) => return Err(err),
                Ok(reply) => {
                    let errors = string_list(&reply, "errors");
                    for warning in string_list(&reply, "warnings") {
                        warn!(ns = %ns, warning = %warning, "Validation warning");
                    }
                    if reply.get("valid").and_then(Value::as_bool) == Some(true) {
                        report.validated.push(ns);
                    } else if !errors.is_empty() && errors.iter().all(|e| mentions_unclean_shutdown(e)) {
                        warn!(ns = %ns, ?errors, "Collection flagged by unclean shutdown");
                        report.permitted.push(ns);
                    } else {
                        warn!(ns = %ns, ?errors, "Collection failed validation");
                        report.invalid.push(ns);
                    }
                }
            }
        }
    }
    Ok(report)
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedRpc;
    use super::*;
    use std::time::Duration;

    fn quick() -> WaitPolicy {
        WaitPolicy::new(Duration::from_millis(50), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_wait_for_primary_polls_ismaster() {
        let rpc = ScriptedRpc::new()
            .reply("isMaster", json!({"ok": 1, "ismaster": false}))
            .reply("isMaster", json!({"ok": 1, "ismaster": true}));
        wait_for_primary(&rpc, quick()).await.unwrap();
        assert_eq!(rpc.called("isMaster").len(), 2);
    }

    #[tokio::test]
    async fn test_wait_for_primary_times_out() {
        let rpc = ScriptedRpc::new().reply("isMaster", json!({"ok": 1, "ismaster": false}));
        let err = wait_for_primary(&rpc, quick()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::NotPrimary { port: 27017 }));
    }

    #[tokio::test]
    async fn test_liveness_accepts_secondary() {
        let rpc = ScriptedRpc::new().reply("isMaster", json!({"ok": 1, "ismaster": false}));
        wait_for_liveness(&rpc, quick()).await.unwrap();
    }

    #[tokio::test]
    async fn test_replica_set_first_start_initiates() {
        let rpc = ScriptedRpc::new()
            .reply("find", json!({"ok": 1, "cursor": {"firstBatch": []}}))
            .reply("replSetInitiate", json!({"ok": 1}))
            .reply("isMaster", json!({"ok": 1, "ismaster": true}))
            .reply("replSetGetStatus", json!({"ok": 1}));
        let action = ensure_replica_set(&rpc, "rs0", "db1:27017", quick()).await.unwrap();
        assert_eq!(action, ReplSetAction::Initiated);
        let initiate = &rpc.called("replSetInitiate")[0];
        assert_eq!(initiate["replSetInitiate"]["_id"], json!("rs0"));
        assert_eq!(
            initiate["replSetInitiate"]["members"][0]["host"],
            json!("db1:27017")
        );
    }

    #[tokio::test]
    async fn test_replica_set_port_change_forces_reconfig() {
        let rpc = ScriptedRpc::new()
            .reply("find", json!({"ok": 1, "cursor": {"firstBatch": [{"_id": "rs0"}]}}))
            .reply(
                "replSetGetConfig",
                json!({"ok": 1, "config": {"_id": "rs0", "version": 3, "members": [{"_id": 0, "host": "db1:37017"}]}}),
            )
            .reply("replSetReconfig", json!({"ok": 1}))
            .reply("isMaster", json!({"ok": 1, "ismaster": true}))
            .reply("replSetGetStatus", json!({"ok": 1}));
        let action = ensure_replica_set(&rpc, "rs0", "db1:27017", quick()).await.unwrap();
        assert_eq!(action, ReplSetAction::Reconfigured);
        let reconfig = &rpc.called("replSetReconfig")[0];
        assert_eq!(reconfig["force"], json!(true));
        assert_eq!(reconfig["replSetReconfig"]["members"][0]["host"], json!("db1:27017"));
    }

    #[tokio::test]
    async fn test_replica_set_same_host_is_unchanged() {
        let rpc = ScriptedRpc::new()
            .reply("find", json!({"ok": 1, "cursor": {"firstBatch": [{"_id": "rs0"}]}}))
            .reply(
                "replSetGetConfig",
                json!({"ok": 1, "config": {"members": [{"_id": 0, "host": "db1:27017"}]}}),
            )
            .reply("isMaster", json!({"ok": 1, "ismaster": true}))
            .reply("replSetGetStatus", json!({"ok": 1}));
        let action = ensure_replica_set(&rpc, "rs0", "db1:27017", quick()).await.unwrap();
        assert_eq!(action, ReplSetAction::Unchanged);
        assert!(rpc.called("replSetReconfig").is_empty());
    }

    #[tokio::test]
    async fn test_not_yet_initialized_after_first_start_is_protocol_error() {
        let rpc = ScriptedRpc::new()
            .reply("find", json!({"ok": 1, "cursor": {"firstBatch": [{"_id": "rs0"}]}}))
            .reply(
                "replSetGetConfig",
                json!({"ok": 0, "code": 94, "codeName": "NotYetInitialized", "errmsg": "no config"}),
            );
        let err = ensure_replica_set(&rpc, "rs0", "db1:27017", quick()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ReplSetNotInitialized { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_treats_dropped_connection_as_ack() {
        let rpc = ScriptedRpc::new().reply(
            "shutdown",
            json!({"ok": 0, "codeName": "ShellException", "errmsg": "Error: network error while attempting to run command 'shutdown'"}),
        );
        shutdown(&rpc).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_refused_is_protocol_error() {
        let rpc = ScriptedRpc::new().reply(
            "shutdown",
            json!({"ok": 0, "codeName": "Unauthorized", "errmsg": "not authorized"}),
        );
        let err = shutdown(&rpc).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ShutdownNotAcknowledged { .. }));
    }

    #[tokio::test]
    async fn test_seed_docs_inserts_until_target() {
        let rpc = ScriptedRpc::new()
            .reply("count", json!({"ok": 1, "n": 0}))
            .reply("count", json!({"ok": 1, "n": 1000}))
            .reply("count", json!({"ok": 1, "n": 1500}))
            .reply("insert", json!({"ok": 1}));
        let total = seed_docs(&rpc, "power", "cycle", 1500).await.unwrap();
        assert_eq!(total, 1500);
        let inserts = rpc.called("insert");
        assert_eq!(inserts.len(), 2);
        assert_eq!(inserts[0]["documents"].as_array().unwrap().len(), 1000);
        assert_eq!(inserts[1]["documents"].as_array().unwrap().len(), 500);
        let doc = &inserts[0]["documents"][0];
        assert!(doc["x"].as_u64().unwrap() < 100_000);
        let len = doc["doc"].as_str().unwrap().len();
        assert!((1..=SEED_MAX_DOC_LEN).contains(&len));
    }

    #[tokio::test]
    async fn test_seed_docs_noop_when_full() {
        let rpc = ScriptedRpc::new().reply("count", json!({"ok": 1, "n": 20}));
        assert_eq!(seed_docs(&rpc, "power", "cycle", 10).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_validate_collections_classifies_outcomes() {
        let rpc = ScriptedRpc::new()
            .reply("listDatabases", json!({"ok": 1, "databases": [{"name": "power"}]}))
            .reply(
                "listCollections",
                json!({"ok": 1, "cursor": {"firstBatch": [{"name": "a"}, {"name": "b"}, {"name": "c"}, {"name": "d"}]}}),
            )
            .reply("validate", json!({"ok": 1, "valid": true, "warnings": ["EBUSY on file"]}))
            .reply(
                "validate",
                json!({"ok": 0, "code": 26, "codeName": "NamespaceNotFound", "errmsg": "ns not found"}),
            )
            .reply(
                "validate",
                json!({"ok": 1, "valid": false, "errors": ["detected unclean shutdown"]}),
            )
            .reply("validate", json!({"ok": 1, "valid": false, "errors": ["bad record"]}));
        let report = validate_collections(&rpc).await.unwrap();
        assert_eq!(report.validated, vec!["power.a"]);
        assert_eq!(report.permitted, vec!["power.b", "power.c"]);
        assert_eq!(report.invalid, vec!["power.d"]);
    }
}
