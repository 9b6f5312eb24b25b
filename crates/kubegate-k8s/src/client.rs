//! Per-request Kubernetes client construction

use kube::config::{
    AuthInfo, Cluster, Context, KubeConfigOptions, Kubeconfig, NamedAuthInfo, NamedCluster,
    NamedContext,
};

use crate::credentials::{Credentials, UserAuth};
use crate::error::K8sError;

/// Name used for the single cluster, user and context of the synthesized kubeconfig
const ENTRY_NAME: &str = "kubegate";

/// A REST configuration and the client built from it.
///
/// Nothing is cached: every request builds its own pair from its own
/// credentials, and no network I/O happens during construction.
#[derive(Clone)]
pub struct ClusterClient {
    pub config: kube::Config,
    pub client: kube::Client,
}

impl ClusterClient {
    /// Build the REST config and client for a set of credentials
    pub async fn build(credentials: &Credentials) -> Result<Self, K8sError> {
        let config = Self::config(credentials).await?;
        let client = kube::Client::try_from(config.clone()).map_err(K8sError::Client)?;

        tracing::debug!(
            server = credentials.server(),
            auth = credentials.auth().mode(),
            "built Kubernetes client"
        );

        Ok(Self { config, client })
    }

    /// Build only the REST config (host, TLS material and auth)
    pub async fn config(credentials: &Credentials) -> Result<kube::Config, K8sError> {
        let config = kube::Config::from_custom_kubeconfig(
            kubeconfig_for(credentials),
            &KubeConfigOptions {
                context: Some(ENTRY_NAME.to_string()),
                ..Default::default()
            },
        )
        .await?;

        Ok(config)
    }
}

/// Synthesize an in-memory kubeconfig holding exactly one cluster, user and context
fn kubeconfig_for(credentials: &Credentials) -> Kubeconfig {
    let cluster = Cluster {
        server: Some(credentials.server().to_string()),
        insecure_skip_tls_verify: Some(credentials.insecure_skip_tls_verify()),
        certificate_authority_data: credentials.certificate_authority_data().map(str::to_string),
        ..Default::default()
    };

    let auth_info = match credentials.auth() {
        UserAuth::ClientCertificate {
            certificate_data,
            key_data,
        } => AuthInfo {
            client_certificate_data: Some(certificate_data.clone()),
            client_key_data: Some(key_data.clone().into()),
            ..Default::default()
        },
        UserAuth::Token(token) => AuthInfo {
            token: Some(token.clone().into()),
            ..Default::default()
        },
        UserAuth::Basic { username, password } => AuthInfo {
            username: Some(username.clone()),
            password: Some(password.clone().into()),
            ..Default::default()
        },
    };

    Kubeconfig {
        clusters: vec![NamedCluster {
            name: ENTRY_NAME.to_string(),
            cluster: Some(cluster),
        }],
        auth_infos: vec![NamedAuthInfo {
            name: ENTRY_NAME.to_string(),
            auth_info: Some(auth_info),
        }],
        contexts: vec![NamedContext {
            name: ENTRY_NAME.to_string(),
            context: Some(Context {
                cluster: ENTRY_NAME.to_string(),
                user: Some(ENTRY_NAME.to_string()),
                ..Default::default()
            }),
        }],
        current_context: Some(ENTRY_NAME.to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubegate_types::CredentialBundle;

    fn credentials(server: &str) -> Credentials {
        Credentials::try_from(CredentialBundle {
            cluster_server: server.to_string(),
            user_token: "abc".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_config_host_matches_server() {
        let config = ClusterClient::config(&credentials("https://10.0.0.1:6443/"))
            .await
            .unwrap();

        assert_eq!(config.cluster_url.scheme_str(), Some("https"));
        assert_eq!(
            config.cluster_url.authority().map(|a| a.as_str()),
            Some("10.0.0.1:6443")
        );
        assert!(!config.accept_invalid_certs);
    }

    #[tokio::test]
    async fn test_config_carries_auth_and_tls_flags() {
        let credentials = Credentials::try_from(CredentialBundle {
            cluster_server: "https://k8s.example.com".to_string(),
            cluster_insecure_skip_tls_verify: true,
            user_username: "admin".to_string(),
            user_password: "hunter2".to_string(),
            ..Default::default()
        })
        .unwrap();

        let config = ClusterClient::config(&credentials).await.unwrap();
        assert!(config.accept_invalid_certs);
        assert_eq!(config.auth_info.username.as_deref(), Some("admin"));
        assert!(config.auth_info.token.is_none());
    }

    #[tokio::test]
    async fn test_build_client() {
        let cluster = ClusterClient::build(&credentials("http://127.0.0.1:8001"))
            .await
            .unwrap();
        assert_eq!(
            cluster.config.cluster_url.host(),
            Some("127.0.0.1")
        );
    }
}
