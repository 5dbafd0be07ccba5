//! 控制平面工具函数
//!
//! 清单哈希、随机密钥生成以及 Hub 连接信息解析等辅助函数。

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use submariner_common::error::{Error, Result};

/// 一组清单的内容哈希，用于判断 ManifestWork 是否需要更新
pub fn manifests_hash(manifests: &[Value]) -> Result<String> {
    let serialized = serde_json::to_vec(manifests)?;
    Ok(format!("{:x}", Sha256::digest(serialized)))
}

/// 生成指定长度的随机密钥，返回 Base64 编码
pub fn generate_psk(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Base64 编码
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// 去掉 URL 的协议前缀，得到 `host:port`
pub fn strip_scheme(url: &str) -> &str {
    url.split_once("://").map_or(url, |(_, rest)| rest).trim_end_matches('/')
}

/// 从 `cluster-info` 中的 kubeconfig 提取 API Server 地址
pub fn api_server_from_kubeconfig(kubeconfig: &str) -> Result<String> {
    let value: serde_yaml::Value = serde_yaml::from_str(kubeconfig)?;
    value
        .get("clusters")
        .and_then(|clusters| clusters.get(0))
        .and_then(|cluster| cluster.get("cluster"))
        .and_then(|cluster| cluster.get("server"))
        .and_then(|server| server.as_str())
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidObject("cluster-info 中缺少 API Server 地址".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_manifests_hash_changes_with_content() {
        let a = manifests_hash(&[json!({"kind": "Namespace"})]).unwrap();
        let b = manifests_hash(&[json!({"kind": "Namespace"})]).unwrap();
        let c = manifests_hash(&[json!({"kind": "Secret"})]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_psk() {
        let psk = generate_psk(48);
        let decoded = STANDARD.decode(&psk).unwrap();
        assert_eq!(decoded.len(), 48);
        assert_ne!(psk, generate_psk(48));
    }

    #[test]
    fn test_api_server_from_kubeconfig() {
        let kubeconfig = r#"
apiVersion: v1
kind: Config
clusters:
- name: ""
  cluster:
    certificate-authority-data: Y2E=
    server: https://api.hub.example.com:6443
"#;
        let server = api_server_from_kubeconfig(kubeconfig).unwrap();
        assert_eq!(server, "https://api.hub.example.com:6443");
        assert_eq!(strip_scheme(&server), "api.hub.example.com:6443");
        assert!(api_server_from_kubeconfig("clusters: []").is_err());
    }
}
