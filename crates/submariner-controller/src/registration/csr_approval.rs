//! Agent 证书请求审批
//!
//! 自动签发 Agent 身份的唯一授权边界。只有同时满足签发者、PEM 类型、
//! 组织集合精确匹配以及 CN 匹配的请求才会被批准；任何异常都视为拒绝。

use std::collections::BTreeSet;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::ResourceExt;
use submariner_common::constants::{
    agent_user, cluster_addon_group, ADDON_GROUP, AUTHENTICATED_GROUP,
    KUBE_APISERVER_CLIENT_SIGNER,
};
use submariner_common::models::{ManagedCluster, ManagedClusterAddOn};
use tracing::debug;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

/// PKCS#10 请求的 PEM 类型
const CERTIFICATE_REQUEST_TAG: &str = "CERTIFICATE REQUEST";

/// 判断证书请求是否可以自动批准
pub fn approve(
    cluster: &ManagedCluster,
    addon: &ManagedClusterAddOn,
    csr: &CertificateSigningRequest,
) -> bool {
    let cluster_name = cluster.name_any();
    let csr_name = csr.name_any();

    if csr.spec.signer_name != KUBE_APISERVER_CLIENT_SIGNER {
        debug!(csr = %csr_name, signer = %csr.spec.signer_name, "签发者不匹配");
        return false;
    }

    let block = match pem::parse(&csr.spec.request.0) {
        Ok(block) => block,
        Err(e) => {
            debug!(csr = %csr_name, "PEM 解码失败: {}", e);
            return false;
        }
    };
    if block.tag() != CERTIFICATE_REQUEST_TAG {
        debug!(csr = %csr_name, tag = %block.tag(), "PEM 类型不是证书请求");
        return false;
    }

    let request = match X509CertificationRequest::from_der(block.contents()) {
        Ok((_, request)) => request,
        Err(e) => {
            debug!(csr = %csr_name, "证书请求解析失败: {}", e);
            return false;
        }
    };
    let subject = &request.certification_request_info.subject;

    let mut organizations = Vec::new();
    for attribute in subject.iter_organization() {
        match attribute.as_str() {
            Ok(org) => organizations.push(org.to_string()),
            Err(_) => return false,
        }
    }
    let expected: BTreeSet<String> = [
        AUTHENTICATED_GROUP.to_string(),
        ADDON_GROUP.to_string(),
        cluster_addon_group(&cluster_name),
    ]
    .into();
    let actual: BTreeSet<String> = organizations.iter().cloned().collect();
    if organizations.len() != expected.len() || actual != expected {
        debug!(csr = %csr_name, ?organizations, "组织集合不匹配");
        return false;
    }

    // 主体中只能有一个 CN，否则不同实现取到的身份可能不同
    let common_names: Vec<_> = subject.iter_common_name().collect();
    let common_name = match common_names.as_slice() {
        [cn] => cn.as_str().ok(),
        _ => {
            debug!(csr = %csr_name, count = common_names.len(), "CN 数量不为 1");
            return false;
        }
    };
    if common_name != Some(agent_user(&cluster_name).as_str()) {
        debug!(csr = %csr_name, ?common_name, "CN 不匹配");
        return false;
    }

    debug!(
        csr = %csr_name,
        cluster = %cluster_name,
        addon = %addon.name_any(),
        "证书请求符合 Agent 身份策略"
    );
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestSpec;
    use k8s_openapi::ByteString;
    use openssl::asn1::Asn1Type;
    use openssl::ec::{EcGroup, EcKey};
    use openssl::hash::MessageDigest;
    use openssl::nid::Nid;
    use openssl::pkey::PKey;
    use openssl::x509::{X509NameBuilder, X509ReqBuilder};
    use rstest::rstest;
    use submariner_common::models::{ManagedClusterAddOnSpec, ManagedClusterSpec};

    /// 生成 PEM 编码的 PKCS#10 请求
    pub(crate) fn csr_pem(organizations: &[&str], common_name: &str) -> String {
        csr_pem_with_names(organizations, &[common_name])
    }

    /// 生成可带多个 CN 的请求
    ///
    /// 以 UTF8String 写入属性，绕开 OpenSSL 对 CN 64 字节的长度限制。
    pub(crate) fn csr_pem_with_names(organizations: &[&str], common_names: &[&str]) -> String {
        let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
        let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        for org in organizations {
            name.append_entry_by_nid_with_type(Nid::ORGANIZATIONNAME, org, Asn1Type::UTF8STRING)
                .unwrap();
        }
        for cn in common_names {
            name.append_entry_by_nid_with_type(Nid::COMMONNAME, cn, Asn1Type::UTF8STRING)
                .unwrap();
        }
        let name = name.build();

        let mut builder = X509ReqBuilder::new().unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
    }

    pub(crate) fn csr(name: &str, signer: &str, pem: String) -> CertificateSigningRequest {
        CertificateSigningRequest {
            metadata: kube::api::ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(pem.into_bytes()),
                signer_name: signer.to_string(),
                ..Default::default()
            },
            status: None,
        }
    }

    pub(crate) fn valid_pem(cluster: &str) -> String {
        csr_pem(
            &[
                AUTHENTICATED_GROUP,
                ADDON_GROUP,
                &cluster_addon_group(cluster),
            ],
            &agent_user(cluster),
        )
    }

    fn fixtures() -> (ManagedCluster, ManagedClusterAddOn) {
        let cluster = ManagedCluster::new("cluster1", ManagedClusterSpec::default());
        let mut addon = ManagedClusterAddOn::new("submariner", ManagedClusterAddOnSpec::default());
        addon.metadata.namespace = Some("cluster1".to_string());
        (cluster, addon)
    }

    #[test]
    fn test_approve_valid_request() {
        let (cluster, addon) = fixtures();
        let request = csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, valid_pem("cluster1"));
        assert!(approve(&cluster, &addon, &request));
    }

    #[test]
    fn test_approve_is_order_independent() {
        let (cluster, addon) = fixtures();
        let pem = csr_pem(
            &[
                &cluster_addon_group("cluster1"),
                AUTHENTICATED_GROUP,
                ADDON_GROUP,
            ],
            &agent_user("cluster1"),
        );
        assert!(approve(
            &cluster,
            &addon,
            &csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, pem)
        ));
    }

    #[test]
    fn test_deny_wrong_signer() {
        let (cluster, addon) = fixtures();
        let request = csr("csr1", "kubernetes.io/kubelet-serving", valid_pem("cluster1"));
        assert!(!approve(&cluster, &addon, &request));
    }

    #[test]
    fn test_deny_wrong_block_type() {
        let (cluster, addon) = fixtures();
        let pem = valid_pem("cluster1").replace("CERTIFICATE REQUEST", "CERTIFICATE");
        let request = csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, pem);
        assert!(!approve(&cluster, &addon, &request));
    }

    #[test]
    fn test_deny_garbage_request() {
        let (cluster, addon) = fixtures();
        let request = csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, "not a pem".to_string());
        assert!(!approve(&cluster, &addon, &request));

        let pem = "-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n";
        let request = csr("csr2", KUBE_APISERVER_CLIENT_SIGNER, pem.to_string());
        assert!(!approve(&cluster, &addon, &request));
    }

    #[rstest]
    #[case::missing_authenticated(&[ADDON_GROUP, "system:open-cluster-management:cluster:cluster1:addon:submariner"])]
    #[case::missing_addon_group(&[AUTHENTICATED_GROUP, "system:open-cluster-management:cluster:cluster1:addon:submariner"])]
    #[case::missing_cluster_group(&[AUTHENTICATED_GROUP, ADDON_GROUP])]
    #[case::other_cluster_group(&[AUTHENTICATED_GROUP, ADDON_GROUP, "system:open-cluster-management:cluster:cluster2:addon:submariner"])]
    #[case::extra_group(&[AUTHENTICATED_GROUP, ADDON_GROUP, "system:open-cluster-management:cluster:cluster1:addon:submariner", "system:masters"])]
    #[case::duplicated_group(&[AUTHENTICATED_GROUP, ADDON_GROUP, "system:open-cluster-management:cluster:cluster1:addon:submariner", ADDON_GROUP])]
    fn test_deny_organization_mismatch(#[case] organizations: &[&str]) {
        let (cluster, addon) = fixtures();
        let pem = csr_pem(organizations, &agent_user("cluster1"));
        let request = csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, pem);
        assert!(!approve(&cluster, &addon, &request));
    }

    #[rstest]
    #[case::other_cluster("system:open-cluster-management:cluster:cluster2:addon:submariner:agent:submariner-addon-agent")]
    #[case::other_agent("system:open-cluster-management:cluster:cluster1:addon:submariner:agent:other")]
    #[case::empty("x")]
    fn test_deny_common_name_mismatch(#[case] common_name: &str) {
        let (cluster, addon) = fixtures();
        let pem = csr_pem(
            &[
                AUTHENTICATED_GROUP,
                ADDON_GROUP,
                &cluster_addon_group("cluster1"),
            ],
            common_name,
        );
        let request = csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, pem);
        assert!(!approve(&cluster, &addon, &request));
    }

    #[test]
    fn test_agent_common_name_exceeds_default_limit() {
        // Agent 身份超过 64 字节，请求仍需能够生成并被批准
        assert!(agent_user("cluster1").len() > 64);
        let (cluster, addon) = fixtures();
        let request = csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, valid_pem("cluster1"));
        assert!(approve(&cluster, &addon, &request));
    }

    #[rstest]
    #[case::admin_appended(&["AGENT", "system:admin"])]
    #[case::admin_prepended(&["system:admin", "AGENT"])]
    #[case::agent_twice(&["AGENT", "AGENT"])]
    #[case::none(&[])]
    fn test_deny_common_name_count(#[case] common_names: &[&str]) {
        let (cluster, addon) = fixtures();
        let agent = agent_user("cluster1");
        let names: Vec<&str> = common_names
            .iter()
            .map(|cn| if *cn == "AGENT" { agent.as_str() } else { cn })
            .collect();
        let pem = csr_pem_with_names(
            &[
                AUTHENTICATED_GROUP,
                ADDON_GROUP,
                &cluster_addon_group("cluster1"),
            ],
            &names,
        );
        let request = csr("csr1", KUBE_APISERVER_CLIENT_SIGNER, pem);
        assert!(!approve(&cluster, &addon, &request));
    }
}
