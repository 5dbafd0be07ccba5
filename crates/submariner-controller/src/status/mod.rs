//! Submariner 状态汇聚
//!
//! 将托管集群上 Submariner 资源的状态映射为 Addon 的状态条件：
//!
//! | 条件 | True | False | Unknown |
//! |------|------|-------|---------|
//! | SubmarinerConnectionDegraded | 无 active Gateway 或存在未连通的连接 | 全部连通 | 状态缺失或格式错误 |
//! | SubmarinerAgentDegraded | DaemonSet 未就绪或镜像不一致 | 两个 DaemonSet 均就绪 | DaemonSet 状态缺失 |
//! | SubmarinerGatewayNodesLabeled | 存在 Gateway | 没有 Gateway | 状态缺失或格式错误 |
//!
//! 来自不受控集群的异常输入只会产生 Unknown 条件，不会中断协调。

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use serde_json::Value;
use submariner_common::condition::{new_condition, ConditionStatus};
use submariner_common::constants::{conditions, ADDON_NAME};
use submariner_common::error::Result;
use submariner_common::models::{
    ManagedClusterAddOn, ManagedClusterAddOnStatus, SubmarinerStatus, CONNECTION_CONNECTED,
};
use submariner_common::status::{update_condition_fn, StatusUpdateOutcome, StatusUpdater};
use submariner_common::store::ObjectStore;
use tracing::{debug, info, warn};

const REASON_STATUS_UNAVAILABLE: &str = "StatusUnavailable";
const REASON_INVALID_STATUS: &str = "InvalidSubmarinerStatus";

/// 由 Submariner 资源状态推导 Addon 条件
///
/// `status` 为资源的原始 status 字段；`None` 表示资源或状态尚不存在。
pub fn derive_conditions(status: Option<&Value>) -> Vec<Condition> {
    let status = match status {
        None | Some(Value::Null) => {
            return unknown_all(REASON_STATUS_UNAVAILABLE, "Submariner 尚未报告状态".to_string())
        }
        Some(value) => match serde_json::from_value::<SubmarinerStatus>(value.clone()) {
            Ok(status) => status,
            Err(e) => {
                return unknown_all(REASON_INVALID_STATUS, format!("无法解析 Submariner 状态: {e}"))
            }
        },
    };

    vec![
        connection_condition(&status),
        agent_condition(&status),
        gateway_nodes_condition(&status),
    ]
}

fn unknown_all(reason: &str, message: String) -> Vec<Condition> {
    [
        conditions::CONNECTION_DEGRADED,
        conditions::AGENT_DEGRADED,
        conditions::GATEWAY_NODES_LABELED,
    ]
    .into_iter()
    .map(|type_| new_condition(type_, ConditionStatus::Unknown, reason, message.clone()))
    .collect()
}

fn connection_condition(status: &SubmarinerStatus) -> Condition {
    let Some(gateways) = &status.gateways else {
        return new_condition(
            conditions::CONNECTION_DEGRADED,
            ConditionStatus::Unknown,
            REASON_STATUS_UNAVAILABLE,
            "Gateway 状态缺失",
        );
    };

    let Some(active) = gateways.iter().find(|gw| gw.ha_status == "active") else {
        return new_condition(
            conditions::CONNECTION_DEGRADED,
            ConditionStatus::True,
            "NoActiveGateway",
            "没有 active 状态的 Gateway",
        );
    };

    let degraded: Vec<String> = active
        .connections
        .iter()
        .filter(|conn| conn.status != CONNECTION_CONNECTED)
        .map(|conn| {
            format!(
                "{}({}): {}",
                conn.endpoint.cluster_id, conn.endpoint.hostname, conn.status
            )
        })
        .collect();

    if degraded.is_empty() {
        new_condition(
            conditions::CONNECTION_DEGRADED,
            ConditionStatus::False,
            "ConnectionsEstablished",
            format!("{} 个连接均已建立", active.connections.len()),
        )
    } else {
        new_condition(
            conditions::CONNECTION_DEGRADED,
            ConditionStatus::True,
            "ConnectionsDegraded",
            format!("未建立的连接: {}", degraded.join(", ")),
        )
    }
}

fn agent_condition(status: &SubmarinerStatus) -> Condition {
    let (Some(gateway), Some(route_agent)) = (
        &status.gateway_daemon_set_status,
        &status.route_agent_daemon_set_status,
    ) else {
        return new_condition(
            conditions::AGENT_DEGRADED,
            ConditionStatus::Unknown,
            REASON_STATUS_UNAVAILABLE,
            "DaemonSet 状态缺失",
        );
    };

    let mut degraded = Vec::new();
    if !gateway.is_ready() {
        degraded.push("gateway");
    }
    if !route_agent.is_ready() {
        degraded.push("route agent");
    }

    if degraded.is_empty() {
        new_condition(
            conditions::AGENT_DEGRADED,
            ConditionStatus::False,
            "AgentsReady",
            "Gateway 与 Route Agent 均已就绪",
        )
    } else {
        new_condition(
            conditions::AGENT_DEGRADED,
            ConditionStatus::True,
            "AgentsDegraded",
            format!("未就绪: {}", degraded.join(", ")),
        )
    }
}

fn gateway_nodes_condition(status: &SubmarinerStatus) -> Condition {
    match &status.gateways {
        None => new_condition(
            conditions::GATEWAY_NODES_LABELED,
            ConditionStatus::Unknown,
            REASON_STATUS_UNAVAILABLE,
            "Gateway 状态缺失",
        ),
        Some(gateways) if gateways.is_empty() => new_condition(
            conditions::GATEWAY_NODES_LABELED,
            ConditionStatus::False,
            "GatewayNodesUnlabeled",
            "没有节点被标记为 Gateway",
        ),
        Some(gateways) => new_condition(
            conditions::GATEWAY_NODES_LABELED,
            ConditionStatus::True,
            "GatewayNodesLabeled",
            format!("{} 个 Gateway 节点", gateways.len()),
        ),
    }
}

/// 状态汇聚器
pub struct StatusAggregator<S> {
    updater: StatusUpdater<S>,
}

impl<S: ObjectStore> StatusAggregator<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            updater: StatusUpdater::new(store),
        }
    }

    /// 将观察到的 Submariner 状态写入集群的 Addon 条件
    pub async fn aggregate(
        &self,
        cluster: &str,
        status: Option<&Value>,
    ) -> Result<StatusUpdateOutcome<ManagedClusterAddOnStatus>> {
        let derived = derive_conditions(status);
        for condition in derived.iter().filter(|c| c.status == "Unknown") {
            debug!(cluster, condition = %condition.type_, reason = %condition.reason, "条件未知");
        }
        if derived.iter().any(|c| c.reason == REASON_INVALID_STATUS) {
            warn!(cluster, "Submariner 状态格式错误");
        }

        let mutators: Vec<_> = derived.into_iter().map(update_condition_fn).collect();
        let outcome = self
            .updater
            .update_status::<ManagedClusterAddOn>(Some(cluster), ADDON_NAME, &mutators)
            .await?;
        if outcome.changed {
            info!(cluster, "已更新 Addon 状态条件");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use submariner_common::condition::find_condition;
    use submariner_common::models::ManagedClusterAddOnSpec;
    use submariner_common::store::MemoryStore;

    fn daemon_set(ready: i32, desired: i32) -> Value {
        json!({
            "mismatchedContainerImages": false,
            "status": {
                "currentNumberScheduled": desired,
                "desiredNumberScheduled": desired,
                "numberMisscheduled": 0,
                "numberReady": ready
            }
        })
    }

    fn gateway(ha_status: &str, connections: &[&str]) -> Value {
        json!({
            "haStatus": ha_status,
            "localEndpoint": {"cluster_id": "c1", "hostname": "gw-1"},
            "connections": connections
                .iter()
                .enumerate()
                .map(|(i, status)| json!({
                    "status": status,
                    "endpoint": {"cluster_id": format!("peer{i}"), "hostname": format!("gw-peer{i}")}
                }))
                .collect::<Vec<_>>()
        })
    }

    fn healthy() -> Value {
        json!({
            "clusterID": "c1",
            "gateways": [gateway("active", &["connected", "connected"])],
            "gatewayDaemonSetStatus": daemon_set(1, 1),
            "routeAgentDaemonSetStatus": daemon_set(3, 3)
        })
    }

    fn condition(conditions: &[Condition], type_: &str) -> (String, String) {
        let c = find_condition(conditions, type_).unwrap();
        (c.status.clone(), c.reason.clone())
    }

    #[test]
    fn test_healthy_status() {
        let conds = derive_conditions(Some(&healthy()));
        assert_eq!(conds.len(), 3);
        assert_eq!(
            condition(&conds, conditions::CONNECTION_DEGRADED),
            ("False".to_string(), "ConnectionsEstablished".to_string())
        );
        assert_eq!(
            condition(&conds, conditions::AGENT_DEGRADED),
            ("False".to_string(), "AgentsReady".to_string())
        );
        assert_eq!(
            condition(&conds, conditions::GATEWAY_NODES_LABELED),
            ("True".to_string(), "GatewayNodesLabeled".to_string())
        );
    }

    #[rstest]
    #[case::one_peer_down(json!([gateway("active", &["connected", "error"])]), "True", "ConnectionsDegraded")]
    #[case::connecting(json!([gateway("active", &["connecting"])]), "True", "ConnectionsDegraded")]
    #[case::passive_only(json!([gateway("passive", &["connected"])]), "True", "NoActiveGateway")]
    #[case::no_gateways(json!([]), "True", "NoActiveGateway")]
    #[case::no_peers(json!([gateway("active", &[])]), "False", "ConnectionsEstablished")]
    fn test_connection_mapping(#[case] gateways: Value, #[case] status: &str, #[case] reason: &str) {
        let mut value = healthy();
        value["gateways"] = gateways;
        let conds = derive_conditions(Some(&value));
        assert_eq!(
            condition(&conds, conditions::CONNECTION_DEGRADED),
            (status.to_string(), reason.to_string())
        );
    }

    #[test]
    fn test_agent_degraded() {
        let mut value = healthy();
        value["routeAgentDaemonSetStatus"] = daemon_set(2, 3);
        let conds = derive_conditions(Some(&value));
        let c = find_condition(&conds, conditions::AGENT_DEGRADED).unwrap();
        assert_eq!(c.status, "True");
        assert!(c.message.contains("route agent"));

        value["routeAgentDaemonSetStatus"] = Value::Null;
        let conds = derive_conditions(Some(&value));
        assert_eq!(
            condition(&conds, conditions::AGENT_DEGRADED).0,
            "Unknown".to_string()
        );
    }

    #[test]
    fn test_gateway_nodes_unlabeled() {
        let mut value = healthy();
        value["gateways"] = json!([]);
        let conds = derive_conditions(Some(&value));
        assert_eq!(
            condition(&conds, conditions::GATEWAY_NODES_LABELED),
            ("False".to_string(), "GatewayNodesUnlabeled".to_string())
        );

        value.as_object_mut().unwrap().remove("gateways");
        let conds = derive_conditions(Some(&value));
        assert_eq!(condition(&conds, conditions::GATEWAY_NODES_LABELED).0, "Unknown");
        assert_eq!(condition(&conds, conditions::CONNECTION_DEGRADED).0, "Unknown");
    }

    #[rstest]
    #[case::missing(None, REASON_STATUS_UNAVAILABLE)]
    #[case::null(Some(Value::Null), REASON_STATUS_UNAVAILABLE)]
    #[case::wrong_type(Some(json!({"gateways": "broken"})), REASON_INVALID_STATUS)]
    #[case::not_an_object(Some(json!(42)), REASON_INVALID_STATUS)]
    fn test_malformed_status_is_unknown(#[case] status: Option<Value>, #[case] reason: &str) {
        let conds = derive_conditions(status.as_ref());
        assert_eq!(conds.len(), 3);
        assert!(conds.iter().all(|c| c.status == "Unknown" && c.reason == reason));
    }

    #[tokio::test]
    async fn test_aggregate_writes_only_on_change() {
        let store = Arc::new(MemoryStore::new());
        let mut addon = ManagedClusterAddOn::new(ADDON_NAME, ManagedClusterAddOnSpec::default());
        addon.metadata.namespace = Some("c1".to_string());
        store.create(&addon).await.unwrap();
        let aggregator = StatusAggregator::new(Arc::clone(&store));

        let outcome = aggregator.aggregate("c1", Some(&healthy())).await.unwrap();
        assert!(outcome.changed);
        assert_eq!(outcome.status.unwrap().conditions.len(), 3);

        // 状态不变时不写入
        let writes = store.writes();
        let outcome = aggregator.aggregate("c1", Some(&healthy())).await.unwrap();
        assert!(!outcome.changed);
        assert_eq!(store.writes(), writes);

        let mut degraded = healthy();
        degraded["gateways"] = json!([gateway("active", &["error"])]);
        let outcome = aggregator.aggregate("c1", Some(&degraded)).await.unwrap();
        assert!(outcome.changed);
        let status = outcome.status.unwrap();
        assert!(submariner_common::condition::is_condition_true(
            &status.conditions,
            conditions::CONNECTION_DEGRADED
        ));
    }

    #[tokio::test]
    async fn test_aggregate_missing_addon_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let aggregator = StatusAggregator::new(Arc::clone(&store));
        let outcome = aggregator.aggregate("c1", Some(&healthy())).await.unwrap();
        assert_eq!(outcome.status, None);
        assert!(!outcome.changed);
    }
}
