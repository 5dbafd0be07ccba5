//! 清单渲染
//!
//! 构建期嵌入的 YAML 模板按逻辑路径寻址，使用 minijinja 以严格模式渲染
//! （引用配置中不存在的字段即报错），再通过按 `apiVersion/kind` 注册的解码表
//! 解码为具体资源对象。三类错误都是构建期契约被破坏，不会被重试。

mod config;

pub use config::{AddOnRbacConfig, BrokerConfig, ClusterRbacConfig, OperatorConfig, SubmarinerConfig};

use std::collections::HashMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use minijinja::{AutoEscape, Environment, ErrorKind, UndefinedBehavior};
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use submariner_common::error::{Error, Result};
use submariner_common::models::{Broker, Submariner};
use submariner_common::store::{apply, ApplyOutcome, ObjectStore};

/// 模板资源的逻辑路径
pub mod assets {
    pub const BROKER_NAMESPACE: &str = "manifests/broker/broker-namespace.yaml";
    pub const BROKER_CLUSTER_ROLE: &str = "manifests/broker/broker-cluster-role.yaml";
    pub const BROKER_IPSEC_PSK: &str = "manifests/broker/broker-ipsec-psk.yaml";
    pub const BROKER: &str = "manifests/broker/broker.yaml";
    pub const BROKERS_CRD: &str = "manifests/broker/brokers-crd.yaml";
    pub const CLUSTERS_CRD: &str = "manifests/broker/clusters-crd.yaml";
    pub const ENDPOINTS_CRD: &str = "manifests/broker/endpoints-crd.yaml";
    pub const CLUSTER_SERVICE_ACCOUNT: &str = "manifests/broker/cluster-serviceaccount.yaml";
    pub const CLUSTER_TOKEN_SECRET: &str = "manifests/broker/cluster-token-secret.yaml";
    pub const CLUSTER_ROLE_BINDING: &str = "manifests/broker/cluster-rolebinding.yaml";

    pub const OPERATOR_NAMESPACE: &str = "manifests/agent/operator-namespace.yaml";
    pub const OPERATOR_SERVICE_ACCOUNT: &str = "manifests/agent/operator-serviceaccount.yaml";
    pub const OPERATOR_CLUSTER_ROLE: &str = "manifests/agent/operator-clusterrole.yaml";
    pub const OPERATOR_CLUSTER_ROLE_BINDING: &str =
        "manifests/agent/operator-clusterrolebinding.yaml";
    pub const OPERATOR_DEPLOYMENT: &str = "manifests/agent/operator-deployment.yaml";
    pub const ADDON_AGENT_DEPLOYMENT: &str = "manifests/agent/addon-agent-deployment.yaml";
    pub const SUBMARINER: &str = "manifests/agent/submariner.yaml";

    pub const ADDON_ROLE: &str = "manifests/rbac/addon-role.yaml";
    pub const ADDON_ROLE_BINDING: &str = "manifests/rbac/addon-rolebinding.yaml";

    /// Broker 命名空间中的 CRD
    pub const BROKER_CRDS: &[&str] = &[BROKERS_CRD, CLUSTERS_CRD, ENDPOINTS_CRD];

    /// Broker 命名空间中按集群创建的 RBAC
    pub const CLUSTER_RBAC: &[&str] = &[
        CLUSTER_SERVICE_ACCOUNT,
        CLUSTER_TOKEN_SECRET,
        CLUSTER_ROLE_BINDING,
    ];

    /// 安装 Submariner Operator 的清单
    pub const OPERATOR: &[&str] = &[
        OPERATOR_NAMESPACE,
        OPERATOR_SERVICE_ACCOUNT,
        OPERATOR_CLUSTER_ROLE,
        OPERATOR_CLUSTER_ROLE_BINDING,
        OPERATOR_DEPLOYMENT,
        ADDON_AGENT_DEPLOYMENT,
    ];

    /// Agent 更新自身 Addon 状态所需的 RBAC
    pub const ADDON_RBAC: &[&str] = &[ADDON_ROLE, ADDON_ROLE_BINDING];
}

macro_rules! embedded_assets {
    ($($path:literal),* $(,)?) => {
        &[$(($path, include_str!(concat!("../../", $path)))),*]
    };
}

static EMBEDDED_ASSETS: &[(&str, &str)] = embedded_assets!(
    "manifests/broker/broker-namespace.yaml",
    "manifests/broker/broker-cluster-role.yaml",
    "manifests/broker/broker-ipsec-psk.yaml",
    "manifests/broker/broker.yaml",
    "manifests/broker/brokers-crd.yaml",
    "manifests/broker/clusters-crd.yaml",
    "manifests/broker/endpoints-crd.yaml",
    "manifests/broker/cluster-serviceaccount.yaml",
    "manifests/broker/cluster-token-secret.yaml",
    "manifests/broker/cluster-rolebinding.yaml",
    "manifests/agent/operator-namespace.yaml",
    "manifests/agent/operator-serviceaccount.yaml",
    "manifests/agent/operator-clusterrole.yaml",
    "manifests/agent/operator-clusterrolebinding.yaml",
    "manifests/agent/operator-deployment.yaml",
    "manifests/agent/addon-agent-deployment.yaml",
    "manifests/agent/submariner.yaml",
    "manifests/rbac/addon-role.yaml",
    "manifests/rbac/addon-rolebinding.yaml",
);

/// 渲染得到的已知类型资源
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestObject {
    Namespace(Namespace),
    ServiceAccount(ServiceAccount),
    Secret(Secret),
    Role(Role),
    RoleBinding(RoleBinding),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    CustomResourceDefinition(CustomResourceDefinition),
    Deployment(Deployment),
    Broker(Broker),
    Submariner(Submariner),
}

type Decoder = fn(Value) -> serde_json::Result<ManifestObject>;

macro_rules! decoders {
    ($($tag:literal => $variant:ident),* $(,)?) => {{
        let mut registry: HashMap<&'static str, Decoder> = HashMap::new();
        $(
            registry.insert($tag, |value| serde_json::from_value(value).map(ManifestObject::$variant));
        )*
        registry
    }};
}

/// `apiVersion/kind` 到解码函数的注册表
static DECODERS: Lazy<HashMap<&'static str, Decoder>> = Lazy::new(|| {
    decoders! {
        "v1/Namespace" => Namespace,
        "v1/ServiceAccount" => ServiceAccount,
        "v1/Secret" => Secret,
        "rbac.authorization.k8s.io/v1/Role" => Role,
        "rbac.authorization.k8s.io/v1/RoleBinding" => RoleBinding,
        "rbac.authorization.k8s.io/v1/ClusterRole" => ClusterRole,
        "rbac.authorization.k8s.io/v1/ClusterRoleBinding" => ClusterRoleBinding,
        "apiextensions.k8s.io/v1/CustomResourceDefinition" => CustomResourceDefinition,
        "apps/v1/Deployment" => Deployment,
        "submariner.io/v1alpha1/Broker" => Broker,
        "submariner.io/v1alpha1/Submariner" => Submariner,
    }
});

impl ManifestObject {
    /// 按 `apiVersion/kind` 解码
    pub fn decode(asset: &str, value: Value) -> Result<Self> {
        let api_version = value.get("apiVersion").and_then(Value::as_str).unwrap_or_default();
        let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
        let tag = format!("{api_version}/{kind}");
        let decoder = DECODERS.get(tag.as_str()).ok_or_else(|| Error::Decode {
            asset: asset.to_string(),
            message: format!("未注册的资源类型 {tag}"),
        })?;
        decoder(value).map_err(|e| Error::Decode {
            asset: asset.to_string(),
            message: e.to_string(),
        })
    }

    /// 转换为原始清单
    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            ManifestObject::Namespace(o) => serde_json::to_value(o),
            ManifestObject::ServiceAccount(o) => serde_json::to_value(o),
            ManifestObject::Secret(o) => serde_json::to_value(o),
            ManifestObject::Role(o) => serde_json::to_value(o),
            ManifestObject::RoleBinding(o) => serde_json::to_value(o),
            ManifestObject::ClusterRole(o) => serde_json::to_value(o),
            ManifestObject::ClusterRoleBinding(o) => serde_json::to_value(o),
            ManifestObject::CustomResourceDefinition(o) => serde_json::to_value(o),
            ManifestObject::Deployment(o) => serde_json::to_value(o),
            ManifestObject::Broker(o) => serde_json::to_value(o),
            ManifestObject::Submariner(o) => serde_json::to_value(o),
        }?;
        Ok(value)
    }

    /// 创建或合并更新到存储
    pub async fn apply<S: ObjectStore>(&self, store: &S) -> Result<ApplyOutcome> {
        match self {
            ManifestObject::Namespace(o) => apply(store, o).await,
            ManifestObject::ServiceAccount(o) => apply(store, o).await,
            ManifestObject::Secret(o) => apply(store, o).await,
            ManifestObject::Role(o) => apply(store, o).await,
            ManifestObject::RoleBinding(o) => apply(store, o).await,
            ManifestObject::ClusterRole(o) => apply(store, o).await,
            ManifestObject::ClusterRoleBinding(o) => apply(store, o).await,
            ManifestObject::CustomResourceDefinition(o) => apply(store, o).await,
            ManifestObject::Deployment(o) => apply(store, o).await,
            ManifestObject::Broker(o) => apply(store, o).await,
            ManifestObject::Submariner(o) => apply(store, o).await,
        }
    }

    /// 资源名称
    pub fn name(&self) -> String {
        use kube::ResourceExt;
        match self {
            ManifestObject::Namespace(o) => o.name_any(),
            ManifestObject::ServiceAccount(o) => o.name_any(),
            ManifestObject::Secret(o) => o.name_any(),
            ManifestObject::Role(o) => o.name_any(),
            ManifestObject::RoleBinding(o) => o.name_any(),
            ManifestObject::ClusterRole(o) => o.name_any(),
            ManifestObject::ClusterRoleBinding(o) => o.name_any(),
            ManifestObject::CustomResourceDefinition(o) => o.name_any(),
            ManifestObject::Deployment(o) => o.name_any(),
            ManifestObject::Broker(o) => o.name_any(),
            ManifestObject::Submariner(o) => o.name_any(),
        }
    }
}

/// 清单渲染器
pub struct ManifestRenderer {
    env: Environment<'static>,
}

impl ManifestRenderer {
    /// 使用构建期嵌入的模板
    pub fn new() -> Result<Self> {
        Self::from_assets(EMBEDDED_ASSETS)
    }

    /// 使用给定的模板集合
    pub fn from_assets(assets: &[(&'static str, &'static str)]) -> Result<Self> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        env.set_keep_trailing_newline(true);
        for &(name, source) in assets {
            env.add_template(name, source).map_err(|e| Error::Template {
                asset: name.to_string(),
                message: e.to_string(),
            })?;
        }
        Ok(Self { env })
    }

    /// 渲染为文本
    pub fn render_string<C: Serialize>(&self, asset: &str, ctx: &C) -> Result<String> {
        let template = self.env.get_template(asset).map_err(|e| match e.kind() {
            ErrorKind::TemplateNotFound => Error::AssetNotFound(asset.to_string()),
            _ => Error::Template {
                asset: asset.to_string(),
                message: e.to_string(),
            },
        })?;
        template.render(ctx).map_err(|e| Error::Template {
            asset: asset.to_string(),
            message: e.to_string(),
        })
    }

    /// 渲染并解码为指定类型
    pub fn render<T: DeserializeOwned, C: Serialize>(&self, asset: &str, ctx: &C) -> Result<T> {
        let rendered = self.render_string(asset, ctx)?;
        serde_yaml::from_str(&rendered).map_err(|e| Error::Decode {
            asset: asset.to_string(),
            message: e.to_string(),
        })
    }

    /// 渲染并通过注册表解码为已知类型的资源
    pub fn render_object<C: Serialize>(&self, asset: &str, ctx: &C) -> Result<ManifestObject> {
        let value: Value = self.render(asset, ctx)?;
        ManifestObject::decode(asset, value)
    }

    /// 依次渲染多个模板
    pub fn render_objects<C: Serialize>(
        &self,
        assets: &[&str],
        ctx: &C,
    ) -> Result<Vec<ManifestObject>> {
        assets
            .iter()
            .map(|asset| self.render_object(asset, ctx))
            .collect()
    }
}
